// THEORY:
// A `FrameSource` is the engine's only way in. The daemon implements it on top of
// a capture process; tests and offline runs replay a prepared list of frames.
// `Ok(None)` means the stream has ended for good; an error means this one read
// failed and the caller decides whether to keep going.

use async_trait::async_trait;
use std::collections::VecDeque;

use crate::core_modules::frame::Frame;
use crate::error::CaptureError;

#[async_trait]
pub trait FrameSource: Send {
    /// Waits for the next frame. `Ok(None)` is end of stream.
    async fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError>;

    /// Releases the underlying device. Called once when capture stops.
    async fn stop(&mut self) {}
}

/// Replays frames from memory, in order.
#[derive(Debug, Default)]
pub struct ReplaySource {
    frames: VecDeque<Frame>,
}

impl ReplaySource {
    pub fn new(frames: impl IntoIterator<Item = Frame>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

#[async_trait]
impl FrameSource for ReplaySource {
    async fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        Ok(self.frames.pop_front())
    }
}
