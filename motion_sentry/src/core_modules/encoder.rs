// THEORY:
// The engine never encodes video itself. An `Encoder` is the seam to whatever
// does: an external process in the daemon, an in-memory recorder in tests.
//
// The lifecycle is explicit: `start` opens an output, `write` appends frames in
// order, and exactly one of `stop` (clean finalize) or `abort` (forced teardown)
// ends it. The recording writer is the only caller and guarantees that every exit
// path reaches one of the two. One encoder instance serves exactly one segment;
// the `EncoderFactory` makes a fresh one for every segment.

use async_trait::async_trait;
use std::path::Path;

use crate::core_modules::frame::{Frame, PixelFormat};
use crate::error::EncoderError;

/// Geometry and rate of the stream an encoder is opened for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamSpec {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub fps: f64,
}

impl StreamSpec {
    pub fn of(frame: &Frame, fps: f64) -> Self {
        Self {
            width: frame.width,
            height: frame.height,
            pixel_format: frame.pixel_format,
            fps,
        }
    }

    pub fn accepts(&self, frame: &Frame) -> bool {
        frame.width == self.width && frame.height == self.height && frame.pixel_format == self.pixel_format
    }

    pub fn describe(&self) -> String {
        format!("{}x{} {:?}", self.width, self.height, self.pixel_format)
    }
}

#[async_trait]
pub trait Encoder: Send {
    /// Opens `path` for a stream described by `spec`.
    async fn start(&mut self, path: &Path, spec: &StreamSpec) -> Result<(), EncoderError>;

    /// Appends one frame. Frames arrive in capture order.
    async fn write(&mut self, frame: &Frame) -> Result<(), EncoderError>;

    /// Flushes and finalizes the output. The caller bounds how long this may take.
    async fn stop(&mut self) -> Result<(), EncoderError>;

    /// Tears the encoder down without finalizing. Must not block for long.
    async fn abort(&mut self);
}

/// Produces one encoder per recording segment.
pub trait EncoderFactory: Send + Sync {
    fn create(&self) -> Box<dyn Encoder>;
}
