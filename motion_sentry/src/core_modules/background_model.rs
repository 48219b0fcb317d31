// THEORY:
// The `BackgroundModel` is the detector's memory of what the empty scene looks
// like. It is a per-pixel running estimate, with no window of past frames kept:
// every pixel holds an exponentially weighted mean and variance of its luma.
//
// Key principles:
// 1.  **Seeding**: The first frame after construction or `reset()` becomes the
//     mean. Nothing is foreground on that frame.
// 2.  **Fast Convergence**: The effective learning rate is `max(1/n, rate)`, where n
//     counts frames since seeding. Early on this is a plain running average, so the
//     model settles in a handful of frames instead of hundreds.
// 3.  **Foreground Test**: A pixel is foreground when its rounded absolute
//     difference from the mean exceeds the configured threshold and also exceeds
//     four standard deviations of that pixel's own history. The variance is
//     clamped so the second test only ever raises the bar for pixels the model
//     has seen flicker.
// 4.  **Selective Update**: Foreground pixels still learn, but at a tenth of the
//     rate and only in the mean. A person standing still is absorbed slowly;
//     a lighting drift is absorbed quickly.

const INITIAL_VARIANCE: f32 = 15.0;
const MIN_VARIANCE: f32 = 4.0;
const MAX_VARIANCE: f32 = 75.0;
/// Squared number of standard deviations a foreground pixel must deviate by.
const VARIANCE_GATE: f32 = 16.0;
const FOREGROUND_RATE_FACTOR: f32 = 0.1;

#[derive(Debug, Clone)]
pub struct BackgroundModel {
    width: u32,
    height: u32,
    mean: Vec<f32>,
    variance: Vec<f32>,
    /// Frames folded into the model since it was seeded, the seed included.
    frames_seen: u64,
    learning_rate: f32,
    threshold: u8,
}

impl BackgroundModel {
    pub fn new(learning_rate: f32, threshold: u8) -> Self {
        Self {
            width: 0,
            height: 0,
            mean: Vec::new(),
            variance: Vec::new(),
            frames_seen: 0,
            learning_rate,
            threshold,
        }
    }

    pub fn is_seeded(&self) -> bool {
        self.frames_seen > 0
    }

    /// True when the model was seeded with frames of this size.
    pub fn matches(&self, width: u32, height: u32) -> bool {
        self.is_seeded() && self.width == width && self.height == height
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    pub fn seed(&mut self, width: u32, height: u32, luma: &[u8]) {
        self.width = width;
        self.height = height;
        self.mean = luma.iter().map(|&v| v as f32).collect();
        self.variance = vec![INITIAL_VARIANCE; luma.len()];
        self.frames_seen = 1;
    }

    /// Forgets everything; the next frame seeds the model again.
    pub fn reset(&mut self) {
        self.width = 0;
        self.height = 0;
        self.mean.clear();
        self.variance.clear();
        self.frames_seen = 0;
    }

    /// Classifies every pixel of `luma` and folds it into the model.
    /// Returns the foreground mask. `luma` must match the seeded geometry.
    pub fn apply(&mut self, luma: &[u8]) -> Vec<bool> {
        debug_assert_eq!(luma.len(), self.mean.len());
        self.frames_seen += 1;
        let rate = (1.0 / self.frames_seen as f32).max(self.learning_rate);
        let foreground_rate = rate * FOREGROUND_RATE_FACTOR;
        let threshold = self.threshold as f32;

        let mut mask = Vec::with_capacity(luma.len());
        for ((&value, mean), variance) in luma.iter().zip(self.mean.iter_mut()).zip(self.variance.iter_mut()) {
            let diff = value as f32 - *mean;
            let magnitude = diff.abs().round();
            let foreground = magnitude > threshold && magnitude * magnitude > VARIANCE_GATE * *variance;

            if foreground {
                *mean += foreground_rate * diff;
            } else {
                *mean += rate * diff;
                *variance = ((1.0 - rate) * *variance + rate * diff * diff).clamp(MIN_VARIANCE, MAX_VARIANCE);
            }
            mask.push(foreground);
        }
        mask
    }

    /// Current mean estimate of a single pixel, for diagnostics and tests.
    pub fn mean_at(&self, x: u32, y: u32) -> Option<f32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.mean.get((y * self.width + x) as usize).copied()
    }
}
