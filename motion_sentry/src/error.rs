//! Error types for the motion engine.
//!
//! Every failure the engine can observe belongs to one of the [`FaultKind`]s.
//! Per-frame faults are absorbed where they happen, session faults tear the
//! current recording down cleanly, and only configuration faults are fatal.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::core_modules::frame::PixelFormat;

/// Classification used in log records so a failure can be reconstructed from
/// the log alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// A missed or late frame. Treated as "no motion".
    CaptureGap,
    /// A malformed frame the detector could not classify. The frame is dropped.
    DetectorFault,
    /// An encoder write or finalize failure. Aborts the recording session.
    EncoderFault,
    /// A hook command exited non-zero, failed to spawn or ran out of time.
    HookFault,
    /// The configuration snapshot failed validation. Fatal at startup.
    ConfigInvalid,
    /// Sustained detector faults escalated into an event teardown.
    EventAbort,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::CaptureGap => "capture_gap",
            FaultKind::DetectorFault => "detector_fault",
            FaultKind::EncoderFault => "encoder_fault",
            FaultKind::HookFault => "hook_fault",
            FaultKind::ConfigInvalid => "config_invalid",
            FaultKind::EventAbort => "event_abort",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A frame the detector refused to classify.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DetectorError {
    #[error("frame has zero dimensions ({width}x{height})")]
    EmptyFrame { width: u32, height: u32 },

    #[error("payload is {actual} bytes, expected {expected} for {width}x{height} {format:?}")]
    PayloadSize {
        width: u32,
        height: u32,
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
}

/// Failures reported by an [`Encoder`](crate::core_modules::encoder::Encoder).
#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("failed to spawn encoder: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("encoder I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoder exited with status {code:?}")]
    Exited { code: Option<i32> },

    #[error("encoder was not started")]
    NotStarted,

    #[error("frame geometry {actual} does not match the stream ({expected})")]
    GeometryMismatch { expected: String, actual: String },

    #[error("encoder failure: {0}")]
    Other(String),
}

/// Failures of a recording session as seen by its owner.
#[derive(Debug, Error)]
pub enum RecordingError {
    #[error(transparent)]
    Encoder(#[from] EncoderError),

    #[error("encoder did not finalize {path} within {timeout_secs:.1}s")]
    FinalizeTimeout { path: PathBuf, timeout_secs: f64 },

    #[error("write queue is full ({capacity} frames pending)")]
    Backlogged { capacity: usize },

    #[error("recording writer is no longer running")]
    WriterGone,
}

/// Failures of a single hook execution. Logged, never propagated.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("failed to spawn hook command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("hook command exited with status {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("hook command timed out after {0:.1}s")]
    Timeout(f64),
}

/// Failures of a frame source.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to start capture: {0}")]
    Start(String),

    #[error("capture I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures writing a still picture.
#[derive(Debug, Error)]
pub enum PictureError {
    #[error("frame buffer does not match its declared geometry")]
    InvalidFrame,

    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("picture worker failed: {0}")]
    Worker(String),
}

/// A configuration value outside its allowed range.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("invalid configuration `{field}`: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors that stop the service before or outside the main loop.
#[derive(Debug, Error)]
pub enum SentryError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to prepare output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SentryError {
    pub fn kind(&self) -> FaultKind {
        match self {
            SentryError::Config(_) => FaultKind::ConfigInvalid,
            SentryError::OutputDir { .. } => FaultKind::ConfigInvalid,
        }
    }
}
