// THEORY:
// The `PrecaptureBuffer` is what lets a recording begin *before* the moment motion
// was confirmed. It keeps the last few seconds of frames in a fixed arena of slots
// and forgets everything older.
//
// Key principles:
// 1.  **Arena + Cursor**: Slots are addressed by a monotonically increasing write
//     cursor modulo the capacity. A push is one slot write; it never allocates
//     (outside of growth), never blocks, and never fails.
// 2.  **Shared Frames**: Slots hold `Frame`s, whose payloads are reference counted.
//     Keeping a frame here costs one pointer; handing it to a recording costs one more.
// 3.  **Sized by Time**: Capacity starts at `precapture_seconds * fps * 1.2`. The
//     observed frame rate is tracked as an EWMA of inter-frame intervals, and if
//     the camera runs faster than promised the arena grows (bounded) so the window
//     still spans the configured number of seconds.
// 4.  **Non-destructive Reads**: `drain_since` copies the relevant window out and
//     leaves the buffer as it was, so asking twice gives the same answer.

use std::time::{Duration, Instant};

use crate::core_modules::frame::Frame;

const CAPACITY_MARGIN: f64 = 1.2;
/// Growth never exceeds this multiple of the initial capacity.
const MAX_GROWTH_FACTOR: usize = 4;
const FPS_SMOOTHING: f64 = 0.1;

#[derive(Debug)]
pub struct PrecaptureBuffer {
    slots: Vec<Option<Frame>>,
    /// Total number of frames ever accepted. The next write goes to `cursor % capacity`.
    cursor: u64,
    window: Duration,
    initial_capacity: usize,
    /// EWMA of the inter-frame interval, in seconds.
    mean_interval: Option<f64>,
    last_timestamp: Option<Instant>,
}

impl PrecaptureBuffer {
    pub fn new(window: Duration, nominal_fps: f64) -> Self {
        let capacity = Self::capacity_for(window, nominal_fps);
        Self {
            slots: vec![None; capacity],
            cursor: 0,
            window,
            initial_capacity: capacity,
            mean_interval: None,
            last_timestamp: None,
        }
    }

    fn capacity_for(window: Duration, fps: f64) -> usize {
        ((window.as_secs_f64() * fps * CAPACITY_MARGIN).ceil() as usize).max(1)
    }

    /// Stores a frame, overwriting the oldest one when full. Frames that are not
    /// newer than the last accepted frame are ignored.
    pub fn push(&mut self, frame: Frame) {
        if let Some(last) = self.last_timestamp {
            if frame.timestamp <= last {
                tracing::debug!("ignoring out-of-order frame in precapture buffer");
                return;
            }
            let interval = frame.timestamp.duration_since(last).as_secs_f64();
            let mean = match self.mean_interval {
                Some(mean) => mean + FPS_SMOOTHING * (interval - mean),
                None => interval,
            };
            self.mean_interval = Some(mean);
            self.maybe_grow();
        }

        self.last_timestamp = Some(frame.timestamp);
        let capacity = self.slots.len();
        self.slots[(self.cursor % capacity as u64) as usize] = Some(frame);
        self.cursor += 1;
    }

    fn maybe_grow(&mut self) {
        let Some(fps) = self.observed_fps() else {
            return;
        };
        // Only grow once the bare window no longer fits; the margin is re-added on growth.
        let needed = (self.window.as_secs_f64() * fps).ceil() as usize;
        let limit = self.initial_capacity * MAX_GROWTH_FACTOR;
        if needed <= self.slots.len() || self.slots.len() >= limit {
            return;
        }
        let wanted = Self::capacity_for(self.window, fps).min(limit);

        // Re-layout oldest-first so the cursor arithmetic stays valid.
        let ordered = self.ordered();
        let mut slots = vec![None; wanted];
        for (i, frame) in ordered.into_iter().enumerate() {
            slots[i] = Some(frame);
        }
        tracing::debug!(from = self.slots.len(), to = wanted, "growing precapture buffer");
        self.cursor = slots.iter().filter(|s| s.is_some()).count() as u64;
        self.slots = slots;
    }

    /// All retained frames, oldest first.
    fn ordered(&self) -> Vec<Frame> {
        let capacity = self.slots.len() as u64;
        let len = self.cursor.min(capacity);
        (self.cursor - len..self.cursor)
            .filter_map(|seq| self.slots[(seq % capacity) as usize].clone())
            .collect()
    }

    /// Frames with `event_start - window <= timestamp < event_start`, oldest first.
    pub fn drain_since(&self, event_start: Instant) -> Vec<Frame> {
        let earliest = event_start.checked_sub(self.window);
        self.ordered()
            .into_iter()
            .filter(|f| f.timestamp < event_start && earliest.map_or(true, |e| f.timestamp >= e))
            .collect()
    }

    pub fn len(&self) -> usize {
        (self.cursor as usize).min(self.slots.len())
    }

    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn observed_fps(&self) -> Option<f64> {
        self.mean_interval.filter(|i| *i > 0.0).map(|i| 1.0 / i)
    }

    /// Discards every frame. Capacity and the rate estimate are kept.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.cursor = 0;
        self.last_timestamp = None;
    }
}
