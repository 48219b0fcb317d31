// THEORY:
// This file is the entry point for the `motion_sentry` library crate. It defines
// the public API consumed by the daemon binary (and by anything else that wants to
// turn a camera feed into motion events).
//
// The crate is layered bottom-up:
// 1.  **core_modules**: the individual engines. Frames and the background model,
//     the blob detector, the motion detector, the precapture ring buffer, the event
//     state machine, the recording controller, the hook dispatcher and the still
//     picture writer. Each one is usable and testable on its own.
// 2.  **pipeline**: the single logical worker that linearizes detection and the
//     event lifecycle against one timeline of frames, and executes the directives
//     the state machine emits.
// 3.  **service**: the concurrent wiring. Capture on its own task, a drop-oldest
//     frame queue, the pipeline worker, and an orderly shutdown.
//
// Camera acquisition and video encoding are reached only through the
// `FrameSource` and `Encoder` traits; concrete process adapters live in the
// daemon crate.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod pipeline;
pub mod service;

#[cfg(test)]
mod test_support;

pub use config::SentryConfig;
pub use core_modules::event_machine::{Event, EventState};
pub use core_modules::frame::{Frame, PixelFormat};
pub use core_modules::motion_detector::MotionResult;
pub use error::{FaultKind, SentryError};
pub use pipeline::{MotionPipeline, PipelineStats};
pub use service::SentryService;
