// THEORY:
// The `EventMachine` turns a noisy stream of per-frame motion verdicts into a
// small number of coherent events. It is the only place that decides when an
// event begins, when it ends, and when a recording segment is cut.
//
// Key architectural principles:
// 1.  **Pure Transitions**: The machine performs no I/O. `process` and `tick`
//     return a list of `Directive`s, and the pipeline executes them in order.
//     Every transition can therefore be tested with nothing but timestamps.
// 2.  **Debounce**: An event starts only after `min_consecutive_frames` motion
//     frames in a row. It ends only after `no_motion_timeout` of silence, measured
//     from the last motion frame. A new event cannot start until `event_gap` has
//     passed since the previous one ended; motion seen during that cooldown is
//     counted and otherwise ignored.
// 3.  **Rotation Inside Events**: Long events are cut into segments. The check runs
//     before a frame is fed, so the frame that crosses `max_record` becomes the
//     first frame of the new segment and no frame is written twice or lost.
// 4.  **Monotonic Time Only**: All decisions use `Instant`s. Wall-clock times ride
//     along purely for naming.
//
// States: Idle -> EventActive -> EventEnding -> Cooldown -> Idle. `EventEnding` is
// transient: it is entered and left within a single call, but it is still reported
// through `Transition` directives so the lifecycle can be logged faithfully.

use chrono::{DateTime, Local};
use std::time::{Duration, Instant};

use crate::config::SentryConfig;
use crate::core_modules::blob::BoundingBox;
use crate::core_modules::frame::Frame;
use crate::core_modules::motion_detector::MotionResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventState {
    Idle,
    EventActive,
    EventEnding,
    Cooldown,
}

impl EventState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventState::Idle => "idle",
            EventState::EventActive => "event_active",
            EventState::EventEnding => "event_ending",
            EventState::Cooldown => "cooldown",
        }
    }
}

/// A single period of sustained motion.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Sequential id, starting at 1 for every process lifetime.
    pub id: u64,
    pub start_time: Instant,
    pub last_motion_time: Instant,
    pub end_time: Option<Instant>,
    /// Wall-clock start, for naming.
    pub started_at: DateTime<Local>,
    /// Wall-clock end, for naming.
    pub ended_at: Option<DateTime<Local>>,
}

/// The timing knobs the machine works from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventTimings {
    pub no_motion_timeout: Duration,
    pub event_gap: Duration,
    pub max_record: Duration,
    pub min_consecutive_frames: u32,
}

impl EventTimings {
    pub fn from_config(config: &SentryConfig) -> Self {
        Self {
            no_motion_timeout: config.no_motion_timeout(),
            event_gap: config.event_gap(),
            max_record: config.max_record(),
            min_consecutive_frames: config.detection.min_consecutive_frames.max(1),
        }
    }
}

/// Work the pipeline must carry out, in the order it was emitted.
#[derive(Debug, Clone)]
pub enum Directive {
    /// The machine moved between states.
    Transition { from: EventState, to: EventState },
    /// A new event opened. Fires `on_event_start`.
    StartEvent(Event),
    /// Write the still picture for the event.
    TakePicture {
        event_id: u64,
        frame: Frame,
        region: Option<BoundingBox>,
    },
    /// Open the first segment, seeded with the precapture window before `frame`.
    OpenRecording { event: Event, frame: Frame },
    /// Append a frame to the open segment.
    Feed(Frame),
    /// Finalize the open segment and start the next one at `at`.
    RotateRecording {
        event_id: u64,
        at: Instant,
        at_wall: DateTime<Local>,
    },
    /// Finalize the open segment. Fires `on_movie_end`.
    CloseRecording { event_id: u64 },
    /// The event is over. Fires `on_event_end`.
    EndEvent(Event),
}

/// Counters kept for the shutdown summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MachineStats {
    pub events_started: u64,
    pub events_aborted: u64,
    pub rotations: u64,
    /// Motion frames ignored because the previous event was still cooling down.
    pub suppressed_motion_frames: u64,
}

#[derive(Debug)]
pub struct EventMachine {
    timings: EventTimings,
    state: EventState,
    current: Option<Event>,
    /// Start of the open recording segment.
    segment_start: Option<Instant>,
    /// End of the previous event, while cooling down.
    cooldown_from: Option<Instant>,
    consecutive_motion: u32,
    next_event_id: u64,
    stats: MachineStats,
}

impl EventMachine {
    pub fn new(timings: EventTimings) -> Self {
        Self {
            timings,
            state: EventState::Idle,
            current: None,
            segment_start: None,
            cooldown_from: None,
            consecutive_motion: 0,
            next_event_id: 1,
            stats: MachineStats::default(),
        }
    }

    pub fn state(&self) -> EventState {
        self.state
    }

    pub fn current_event(&self) -> Option<&Event> {
        self.current.as_ref()
    }

    pub fn stats(&self) -> MachineStats {
        self.stats
    }

    /// Advances the machine by one classified frame.
    pub fn process(&mut self, frame: &Frame, result: &MotionResult) -> Vec<Directive> {
        let now = frame.timestamp;
        let mut out = Vec::new();

        if result.is_motion {
            self.consecutive_motion = self.consecutive_motion.saturating_add(1);
        } else {
            self.consecutive_motion = 0;
        }

        if self.state == EventState::Cooldown {
            if !self.cooldown_expired(now) {
                if result.is_motion {
                    self.stats.suppressed_motion_frames += 1;
                }
                self.consecutive_motion = 0;
                return out;
            }
            self.leave_cooldown(&mut out);
        }

        match self.state {
            EventState::Idle => {
                if result.is_motion && self.consecutive_motion >= self.timings.min_consecutive_frames {
                    self.start_event(frame, result, &mut out);
                }
            }
            EventState::EventActive => {
                if result.is_motion {
                    if let Some(event) = self.current.as_mut() {
                        event.last_motion_time = now;
                    }
                }
                let silent_for = self
                    .current
                    .as_ref()
                    .map_or(Duration::ZERO, |e| now.saturating_duration_since(e.last_motion_time));

                let ends = !result.is_motion && silent_for >= self.timings.no_motion_timeout;

                // The closing frame stays in the current segment.
                if !ends {
                    self.maybe_rotate(frame, &mut out);
                }
                out.push(Directive::Feed(frame.clone()));

                if ends {
                    self.finish(now, frame.captured_at, &mut out);
                }
            }
            // Never observable between calls.
            EventState::EventEnding | EventState::Cooldown => {}
        }

        out
    }

    /// Evaluates timeouts when no frame has arrived for a while.
    pub fn tick(&mut self, now: Instant, wall: DateTime<Local>) -> Vec<Directive> {
        let mut out = Vec::new();
        self.consecutive_motion = 0;
        match self.state {
            EventState::EventActive => {
                let timed_out = self
                    .current
                    .as_ref()
                    .is_some_and(|e| now.saturating_duration_since(e.last_motion_time) >= self.timings.no_motion_timeout);
                if timed_out {
                    self.finish(now, wall, &mut out);
                }
            }
            EventState::Cooldown => {
                if self.cooldown_expired(now) {
                    self.leave_cooldown(&mut out);
                }
            }
            EventState::Idle | EventState::EventEnding => {}
        }
        out
    }

    /// Ends the active event immediately, e.g. after an encoder failure.
    /// Does nothing outside of an event.
    pub fn abort(&mut self, now: Instant, wall: DateTime<Local>) -> Vec<Directive> {
        if self.state == EventState::EventActive {
            self.stats.events_aborted += 1;
        }
        self.end_now(now, wall)
    }

    /// Ends the active event as if its timeout had expired. Used at shutdown.
    pub fn end_now(&mut self, now: Instant, wall: DateTime<Local>) -> Vec<Directive> {
        let mut out = Vec::new();
        if self.state == EventState::EventActive {
            self.finish(now, wall, &mut out);
        }
        out
    }

    fn cooldown_expired(&self, now: Instant) -> bool {
        self.cooldown_from
            .map_or(true, |end| now.saturating_duration_since(end) >= self.timings.event_gap)
    }

    fn leave_cooldown(&mut self, out: &mut Vec<Directive>) {
        self.cooldown_from = None;
        self.transition(EventState::Idle, out);
    }

    fn start_event(&mut self, frame: &Frame, result: &MotionResult, out: &mut Vec<Directive>) {
        let event = Event {
            id: self.next_event_id,
            start_time: frame.timestamp,
            last_motion_time: frame.timestamp,
            end_time: None,
            started_at: frame.captured_at,
            ended_at: None,
        };
        self.next_event_id += 1;
        self.stats.events_started += 1;
        self.segment_start = Some(frame.timestamp);

        self.transition(EventState::EventActive, out);
        out.push(Directive::StartEvent(event.clone()));
        out.push(Directive::TakePicture {
            event_id: event.id,
            frame: frame.clone(),
            region: result.region,
        });
        out.push(Directive::OpenRecording {
            event: event.clone(),
            frame: frame.clone(),
        });
        out.push(Directive::Feed(frame.clone()));
        self.current = Some(event);
    }

    fn maybe_rotate(&mut self, frame: &Frame, out: &mut Vec<Directive>) {
        let (Some(event), Some(segment_start)) = (self.current.as_ref(), self.segment_start) else {
            return;
        };
        if frame.timestamp.saturating_duration_since(segment_start) >= self.timings.max_record {
            out.push(Directive::RotateRecording {
                event_id: event.id,
                at: frame.timestamp,
                at_wall: frame.captured_at,
            });
            self.segment_start = Some(frame.timestamp);
            self.stats.rotations += 1;
        }
    }

    fn finish(&mut self, now: Instant, wall: DateTime<Local>, out: &mut Vec<Directive>) {
        let Some(mut event) = self.current.take() else {
            return;
        };
        event.end_time = Some(now);
        event.ended_at = Some(wall);

        self.transition(EventState::EventEnding, out);
        out.push(Directive::CloseRecording { event_id: event.id });
        out.push(Directive::EndEvent(event));
        self.segment_start = None;
        self.cooldown_from = Some(now);
        self.consecutive_motion = 0;
        self.transition(EventState::Cooldown, out);
    }

    fn transition(&mut self, to: EventState, out: &mut Vec<Directive>) {
        let from = self.state;
        self.state = to;
        out.push(Directive::Transition { from, to });
    }
}
