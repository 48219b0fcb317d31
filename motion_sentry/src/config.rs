// THEORY:
// `SentryConfig` is the immutable snapshot of every tunable the engine reads. It
// is loaded once at startup, validated once, and then only ever borrowed. There is
// no hot reload: components copy the values they need when they are constructed.
//
// The section layout (`camera`, `detection`, `movie`, `picture`, `event`, `log`)
// matches the configuration files the daemon accepts, so a file deserializes
// straight into this struct. Every field has a default, so a file only needs to
// name what it changes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Upper bound on the frames a precapture window may span.
const MAX_PRECAPTURE_FRAMES: f64 = 100_000.0;

/// The complete configuration snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SentryConfig {
    pub camera: CameraConfig,
    pub detection: DetectionConfig,
    pub movie: MovieConfig,
    pub picture: PictureConfig,
    pub event: EventConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Capture device handed to the frame source (e.g. `/dev/video0`).
    pub device: String,
    /// Input format understood by the capture pipeline (e.g. `v4l2`).
    pub input_format: String,
    pub width: u32,
    pub height: u32,
    /// Nominal frame rate. Also the rate written into recordings.
    pub fps: f64,
    /// Capacity of the capture queue. When the detector falls behind, the
    /// oldest queued frames are dropped.
    pub queue_frames: usize,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            input_format: "v4l2".to_string(),
            width: 640,
            height: 480,
            fps: 30.0,
            queue_frames: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Foreground threshold on the blurred 8-bit difference image.
    pub threshold: u8,
    /// A region must be strictly larger than this (pixels) to count as motion.
    pub min_area: u32,
    /// Regions at or above this size are ignored (whole-scene changes). Unset = no limit.
    pub max_area: Option<u32>,
    /// Gaussian kernel size. Must be odd; 0 or 1 disables the blur.
    pub blur_size: u32,
    /// 3x3 dilation passes applied to the foreground mask.
    pub dilate_iterations: u32,
    /// Background learning rate per frame, in (0, 1].
    pub learning_rate: f32,
    /// Frames after (re)seeding during which motion is never reported.
    pub warmup_frames: u32,
    /// Consecutive motion frames required before an event may start.
    pub min_consecutive_frames: u32,
    /// Consecutive malformed frames tolerated before an active event is aborted.
    pub max_consecutive_faults: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            threshold: 25,
            min_area: 500,
            max_area: None,
            blur_size: 21,
            dilate_iterations: 2,
            learning_rate: 1.0 / 500.0,
            warmup_frames: 0,
            min_consecutive_frames: 1,
            max_consecutive_faults: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MovieConfig {
    pub dirpath: PathBuf,
    /// Seconds of footage kept from before motion was confirmed.
    pub precapture_seconds: f64,
    /// Segment length after which a recording is rotated.
    #[serde(alias = "max_duration")]
    pub max_record_seconds: f64,
    /// How long the encoder gets to finalize a segment before it is killed.
    pub finalize_timeout_seconds: f64,
    /// Frames a recording writer may have queued before the session is failed.
    pub write_queue_capacity: usize,
}

impl Default for MovieConfig {
    fn default() -> Self {
        Self {
            dirpath: PathBuf::from("/tmp"),
            precapture_seconds: 5.0,
            max_record_seconds: 60.0,
            finalize_timeout_seconds: 10.0,
            write_queue_capacity: 512,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PictureConfig {
    pub enabled: bool,
    pub dirpath: PathBuf,
}

impl Default for PictureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dirpath: PathBuf::from("/tmp"),
        }
    }
}

/// Event timing and the hook command templates.
///
/// Templates may reference `{event_id}`, `{filename}`, `{segment}`,
/// `{timestamp}`, `{start_time}` and `{end_time}`. An empty template disables
/// the hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Seconds without motion before an event ends.
    pub no_motion_timeout: f64,
    /// Seconds after an event ends before a new one may start.
    pub event_gap: f64,
    /// Execution budget of a single hook command.
    pub hook_timeout_seconds: f64,
    pub on_event_start: String,
    pub on_event_end: String,
    pub on_movie_start: String,
    pub on_movie_end: String,
    pub on_picture_taken: String,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            no_motion_timeout: 20.0,
            event_gap: 30.0,
            hook_timeout_seconds: 30.0,
            on_event_start: String::new(),
            on_event_end: String::new(),
            on_movie_start: String::new(),
            on_movie_end: String::new(),
            on_picture_taken: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl SentryConfig {
    /// Checks every value once, so the rest of the engine can trust the snapshot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let camera = &self.camera;
        if camera.width == 0 || camera.height == 0 {
            return Err(ConfigError::new("camera.width/height", "must be non-zero"));
        }
        if !(camera.fps.is_finite() && camera.fps > 0.0) {
            return Err(ConfigError::new("camera.fps", "must be a positive number"));
        }
        let frame_interval = Duration::try_from_secs_f64(1.0 / camera.fps).ok();
        if frame_interval.and_then(|i| i.checked_mul(3)).is_none() {
            return Err(ConfigError::new("camera.fps", format!("{} is too low", camera.fps)));
        }
        if camera.queue_frames == 0 {
            return Err(ConfigError::new("camera.queue_frames", "must be at least 1"));
        }

        let detection = &self.detection;
        if detection.blur_size > 1 && detection.blur_size % 2 == 0 {
            return Err(ConfigError::new(
                "detection.blur_size",
                format!("kernel size must be odd, got {}", detection.blur_size),
            ));
        }
        if !(detection.learning_rate > 0.0 && detection.learning_rate <= 1.0) {
            return Err(ConfigError::new("detection.learning_rate", "must be in (0, 1]"));
        }
        if let Some(max_area) = detection.max_area {
            if max_area <= detection.min_area {
                return Err(ConfigError::new(
                    "detection.max_area",
                    format!("must exceed min_area ({})", detection.min_area),
                ));
            }
        }
        if detection.min_consecutive_frames == 0 {
            return Err(ConfigError::new("detection.min_consecutive_frames", "must be at least 1"));
        }
        if detection.max_consecutive_faults == 0 {
            return Err(ConfigError::new("detection.max_consecutive_faults", "must be at least 1"));
        }

        let movie = &self.movie;
        if movie.dirpath.as_os_str().is_empty() {
            return Err(ConfigError::new("movie.dirpath", "must not be empty"));
        }
        check_seconds("movie.precapture_seconds", movie.precapture_seconds, true)?;
        if movie.precapture_seconds * camera.fps > MAX_PRECAPTURE_FRAMES {
            return Err(ConfigError::new(
                "movie.precapture_seconds",
                format!("window holds more than {MAX_PRECAPTURE_FRAMES} frames at {} fps", camera.fps),
            ));
        }
        check_seconds("movie.max_record_seconds", movie.max_record_seconds, false)?;
        let finalize = check_seconds("movie.finalize_timeout_seconds", movie.finalize_timeout_seconds, false)?;
        // Rotation and close wait for up to three finalize budgets.
        if finalize.checked_mul(3).is_none() {
            return Err(ConfigError::new(
                "movie.finalize_timeout_seconds",
                format!("{} seconds is out of range", movie.finalize_timeout_seconds),
            ));
        }
        if movie.write_queue_capacity == 0 {
            return Err(ConfigError::new("movie.write_queue_capacity", "must be at least 1"));
        }

        if self.picture.enabled && self.picture.dirpath.as_os_str().is_empty() {
            return Err(ConfigError::new("picture.dirpath", "must not be empty"));
        }

        let event = &self.event;
        check_seconds("event.no_motion_timeout", event.no_motion_timeout, false)?;
        check_seconds("event.event_gap", event.event_gap, true)?;
        check_seconds("event.hook_timeout_seconds", event.hook_timeout_seconds, false)?;

        Ok(())
    }

    pub fn precapture(&self) -> Duration {
        seconds(self.movie.precapture_seconds)
    }

    pub fn max_record(&self) -> Duration {
        seconds(self.movie.max_record_seconds)
    }

    pub fn finalize_timeout(&self) -> Duration {
        seconds(self.movie.finalize_timeout_seconds)
    }

    pub fn no_motion_timeout(&self) -> Duration {
        seconds(self.event.no_motion_timeout)
    }

    pub fn event_gap(&self) -> Duration {
        seconds(self.event.event_gap)
    }

    pub fn hook_timeout(&self) -> Duration {
        seconds(self.event.hook_timeout_seconds)
    }

    /// The nominal time between two frames.
    pub fn frame_interval(&self) -> Duration {
        seconds(1.0 / self.camera.fps)
    }

    /// How long the pipeline waits for a frame before treating the silence as a
    /// capture gap: three nominal frame intervals, and never less than a second.
    pub fn frame_timeout(&self) -> Duration {
        self.frame_interval().saturating_mul(3).max(Duration::from_secs(1))
    }
}

/// Converts configured seconds to a `Duration`, clamping instead of panicking.
/// Negative and NaN values become zero, values too large for a `Duration` become
/// `Duration::MAX`. `validate` rejects both, so the clamp only matters for
/// snapshots that were never validated.
pub fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

fn check_seconds(field: &'static str, value: f64, zero_allowed: bool) -> Result<Duration, ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::new(field, format!("must be a finite, non-negative number of seconds, got {value}")));
    }
    if !zero_allowed && value == 0.0 {
        return Err(ConfigError::new(field, "must be greater than zero"));
    }
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::new(field, format!("{value} seconds is out of range")))
}
