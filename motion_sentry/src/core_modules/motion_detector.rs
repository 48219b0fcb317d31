// THEORY:
// The `MotionDetector` answers one question per frame: is something moving?
// It is deliberately dumb about *what* moves; it only measures how much of the
// scene changed relative to a learned background.
//
// Per frame:
// 1.  **Validation**: Malformed frames are rejected before they can touch the model.
// 2.  **Luma + Blur**: The frame is reduced to 8-bit luma and Gaussian blurred, so
//     sensor noise and compression speckle do not survive as foreground.
// 3.  **Background Subtraction**: The `BackgroundModel` yields a foreground mask and
//     learns from the frame in the same pass.
// 4.  **Spatial Grouping**: The mask is dilated and the largest connected region is
//     extracted by the `blob_detector`.
// 5.  **Decision**: The frame is motion when that region is larger than `min_area`
//     (and smaller than `max_area`, when set).
//
// The detector owns all of its state. `reset()` drops the background, and a frame
// of a different size re-seeds it automatically.

use image::{GrayImage, imageops};
use std::time::Instant;

use crate::config::DetectionConfig;
use crate::core_modules::background_model::BackgroundModel;
use crate::core_modules::blob::BoundingBox;
use crate::core_modules::blob_detector::blob_detector;
use crate::core_modules::frame::Frame;
use crate::error::DetectorError;

/// The verdict for a single frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionResult {
    pub frame_timestamp: Instant,
    pub is_motion: bool,
    /// Size of the largest changed region, as a float for downstream scoring.
    pub score: f64,
    /// Pixel count of the largest changed region.
    pub motion_area: u32,
    pub region: Option<BoundingBox>,
}

impl MotionResult {
    pub fn still(frame_timestamp: Instant) -> Self {
        Self {
            frame_timestamp,
            is_motion: false,
            score: 0.0,
            motion_area: 0,
            region: None,
        }
    }
}

pub struct MotionDetector {
    config: DetectionConfig,
    background: BackgroundModel,
    /// Frames left in the post-seed warmup.
    warmup_remaining: u32,
}

impl MotionDetector {
    pub fn new(config: DetectionConfig) -> Self {
        let background = BackgroundModel::new(config.learning_rate, config.threshold);
        Self {
            config,
            background,
            warmup_remaining: 0,
        }
    }

    /// Forgets the background; the next frame seeds it again.
    pub fn reset(&mut self) {
        self.background.reset();
        self.warmup_remaining = 0;
    }

    pub fn is_seeded(&self) -> bool {
        self.background.is_seeded()
    }

    pub fn classify(&mut self, frame: &Frame) -> Result<MotionResult, DetectorError> {
        frame.validate()?;

        let luma = self.prepare(frame);

        if !self.background.matches(frame.width, frame.height) {
            if self.background.is_seeded() {
                tracing::info!(
                    width = frame.width,
                    height = frame.height,
                    "frame geometry changed, re-seeding background"
                );
            }
            self.background.seed(frame.width, frame.height, &luma);
            self.warmup_remaining = self.config.warmup_frames;
            return Ok(MotionResult::still(frame.timestamp));
        }

        let mask = self.background.apply(&luma);
        let mask = blob_detector::dilate(&mask, frame.width, frame.height, self.config.dilate_iterations);
        let largest = blob_detector::find_largest_blob(&mask, frame.width, frame.height);

        if self.warmup_remaining > 0 {
            self.warmup_remaining -= 1;
            return Ok(MotionResult::still(frame.timestamp));
        }

        let (area, region) = match largest {
            Some(blob) => (blob.area, Some(blob.bounding_box)),
            None => (0, None),
        };
        let below_max = self.config.max_area.map_or(true, |max| area < max);
        let is_motion = area > self.config.min_area && below_max;

        Ok(MotionResult {
            frame_timestamp: frame.timestamp,
            is_motion,
            score: area as f64,
            motion_area: area,
            region,
        })
    }

    /// Luma, blurred with the configured kernel.
    fn prepare(&self, frame: &Frame) -> Vec<u8> {
        let luma = frame.to_luma();
        if self.config.blur_size <= 1 {
            return luma;
        }
        match GrayImage::from_raw(frame.width, frame.height, luma) {
            Some(gray) => imageops::blur(&gray, kernel_sigma(self.config.blur_size)).into_raw(),
            // Unreachable for validated frames.
            None => frame.to_luma(),
        }
    }
}

/// Standard deviation implied by an odd Gaussian kernel size.
pub fn kernel_sigma(kernel_size: u32) -> f32 {
    0.3 * ((kernel_size as f32 - 1.0) * 0.5 - 1.0) + 0.8
}
