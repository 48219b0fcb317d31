// THEORY:
// A `Frame` is the single unit of data that flows through the whole engine. The
// detector reads it, the precapture buffer keeps it, and the recording writer
// encodes it. None of them copy the pixels: the payload is an `Arc<[u8]>`, so
// cloning a frame only bumps a reference count and the buffer is freed when the
// last holder lets go.
//
// Every frame carries two clocks. `timestamp` is monotonic and drives all of the
// timing logic (timeouts, gaps, precapture windows). `captured_at` is the wall
// clock, used only for human-facing output such as file names and hook arguments.

use chrono::{DateTime, Local};
use std::sync::Arc;
use std::time::Instant;

use crate::error::DetectorError;

/// Memory layout of a frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Gray8,
    Rgb8,
    Rgba8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgba8 => 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic capture instant.
    pub timestamp: Instant,
    /// Wall-clock capture time.
    pub captured_at: DateTime<Local>,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// Raw pixels, row-major, no padding.
    pub payload: Arc<[u8]>,
}

impl Frame {
    pub fn new(
        timestamp: Instant,
        captured_at: DateTime<Local>,
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        payload: impl Into<Arc<[u8]>>,
    ) -> Self {
        Self {
            timestamp,
            captured_at,
            width,
            height,
            pixel_format,
            payload: payload.into(),
        }
    }

    /// Number of payload bytes a frame of this geometry must carry.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.pixel_format.bytes_per_pixel()
    }

    pub fn is_well_formed(&self) -> bool {
        self.validate().is_ok()
    }

    pub fn validate(&self) -> Result<(), DetectorError> {
        if self.width == 0 || self.height == 0 {
            return Err(DetectorError::EmptyFrame {
                width: self.width,
                height: self.height,
            });
        }
        let expected = self.expected_len();
        if self.payload.len() != expected {
            return Err(DetectorError::PayloadSize {
                width: self.width,
                height: self.height,
                format: self.pixel_format,
                expected,
                actual: self.payload.len(),
            });
        }
        Ok(())
    }

    /// Converts the payload to 8-bit luma (Rec. 601 weights for color input).
    /// Callers must validate the frame first.
    pub fn to_luma(&self) -> Vec<u8> {
        match self.pixel_format {
            PixelFormat::Gray8 => self.payload.to_vec(),
            PixelFormat::Rgb8 => self.payload.chunks_exact(3).map(luminance).collect(),
            PixelFormat::Rgba8 => self.payload.chunks_exact(4).map(luminance).collect(),
        }
    }

    pub fn same_geometry(&self, other: &Frame) -> bool {
        self.width == other.width && self.height == other.height && self.pixel_format == other.pixel_format
    }
}

fn luminance(px: &[u8]) -> u8 {
    let l = 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
    l.round().clamp(0.0, 255.0) as u8
}
