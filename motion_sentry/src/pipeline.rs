// THEORY:
// The `pipeline` module is the single logical worker of the engine. It owns the
// detector, the precapture buffer, the event state machine and the open
// recording session, and drives all of them from one timeline of frames.
//
// Everything that changes event state happens here, one frame at a time. The
// state machine decides *what* should happen and returns `Directive`s; the
// pipeline carries them out in emitted order: it feeds and rotates recordings,
// spawns still pictures, and fires hooks. That split keeps the machine pure and
// the side effects in one place.
//
// Failure handling lives here too:
// - A malformed frame is dropped and counted. Once `max_consecutive_faults` of
//   them arrive in a row during an event, the event is aborted.
// - Any recording failure (start, backlog, rotation, finalize) ends the session
//   and aborts the event. Files of failed segments are kept as `.partial`, and
//   `on_movie_end` is only fired for segments that finalized cleanly.
// - Long silences tick the machine so events still end without frames, and a
//   very long gap re-seeds the detector against the scene as it is now.
//
// Finalizing a segment can take as long as the encoder needs, so the pipeline
// never waits for it. Rotation and close are handed to the recording writer and
// their outcome is awaited on the *lifecycle chain*: a sequence of spawned tasks,
// each of which starts only when the previous one is done. Hooks that must follow
// a finalize (`on_movie_end`, then `on_event_end`, then the next event's hooks)
// are queued on the same chain, so they still fire in lifecycle order.

use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::config::SentryConfig;
use crate::core_modules::encoder::{EncoderFactory, StreamSpec};
use crate::core_modules::event_machine::{Directive, Event, EventMachine, EventState, EventTimings};
use crate::core_modules::frame::Frame;
use crate::core_modules::hooks::{HookContext, HookDispatcher, HookName, HookStats};
use crate::core_modules::motion_detector::{MotionDetector, MotionResult};
use crate::core_modules::picture::PictureWriter;
use crate::core_modules::precapture::PrecaptureBuffer;
use crate::core_modules::recording::{Recording, RecordingController, RecordingSession};
use crate::error::FaultKind;

/// A gap in the frame stream longer than this re-seeds the background model.
pub const DETECTOR_RESET_AFTER: Duration = Duration::from_secs(10);

/// Counters reported when the pipeline shuts down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames_processed: u64,
    pub motion_frames: u64,
    pub detector_faults: u64,
    pub capture_gaps: u64,
    /// Frames lost before classification (queue overflow or out of order).
    pub dropped_frames: u64,
    pub events_started: u64,
    pub events_aborted: u64,
    pub rotations: u64,
    pub suppressed_motion_frames: u64,
    pub recordings_finalized: u64,
    pub recording_failures: u64,
    pub pictures_saved: u64,
    pub hooks: HookStats,
}

pub struct MotionPipeline {
    detector: MotionDetector,
    precapture: PrecaptureBuffer,
    machine: EventMachine,
    recorder: RecordingController,
    session: Option<RecordingSession>,
    hooks: Arc<HookDispatcher>,
    pictures: PictureWriter,
    picture_tasks: Vec<JoinHandle<()>>,
    pictures_saved: Arc<AtomicU64>,
    recordings_finalized: Arc<AtomicU64>,
    /// Tail of the lifecycle chain, while work on it is outstanding.
    lifecycle: Option<JoinHandle<()>>,

    // --- Fault tracking ---
    max_consecutive_faults: u32,
    consecutive_faults: u32,
    frame_timeout: Duration,
    last_frame: Option<Instant>,

    stats: PipelineStats,
}

impl MotionPipeline {
    pub fn new(config: &SentryConfig, encoders: Arc<dyn EncoderFactory>, hooks: Arc<HookDispatcher>) -> Self {
        Self {
            detector: MotionDetector::new(config.detection.clone()),
            precapture: PrecaptureBuffer::new(config.precapture(), config.camera.fps),
            machine: EventMachine::new(EventTimings::from_config(config)),
            recorder: RecordingController::new(encoders, &config.movie, config.camera.fps),
            session: None,
            hooks,
            pictures: PictureWriter::new(&config.picture),
            picture_tasks: Vec::new(),
            pictures_saved: Arc::new(AtomicU64::new(0)),
            recordings_finalized: Arc::new(AtomicU64::new(0)),
            lifecycle: None,
            max_consecutive_faults: config.detection.max_consecutive_faults.max(1),
            consecutive_faults: 0,
            frame_timeout: config.frame_timeout(),
            last_frame: None,
            stats: PipelineStats::default(),
        }
    }

    pub fn state(&self) -> EventState {
        self.machine.state()
    }

    pub fn current_event(&self) -> Option<&Event> {
        self.machine.current_event()
    }

    pub fn stats(&self) -> PipelineStats {
        let machine = self.machine.stats();
        PipelineStats {
            events_started: machine.events_started,
            events_aborted: machine.events_aborted,
            rotations: machine.rotations,
            suppressed_motion_frames: machine.suppressed_motion_frames,
            pictures_saved: self.pictures_saved.load(Ordering::Relaxed),
            recordings_finalized: self.recordings_finalized.load(Ordering::Relaxed),
            recording_failures: self.recorder.failures(),
            hooks: self.hooks.stats(),
            ..self.stats
        }
    }

    /// Classifies one frame and carries out whatever the event lifecycle requires.
    /// Returns the verdict, or `None` when the frame was dropped.
    pub async fn process_frame(&mut self, frame: Frame) -> Option<MotionResult> {
        if let Some(last) = self.last_frame {
            if frame.timestamp <= last {
                self.stats.dropped_frames += 1;
                tracing::debug!("dropping frame that is not newer than its predecessor");
                return None;
            }
            let gap = frame.timestamp - last;
            if gap >= self.frame_timeout {
                self.stats.capture_gaps += 1;
                tracing::warn!(
                    fault = %FaultKind::CaptureGap,
                    gap_secs = gap.as_secs_f64(),
                    event_id = self.event_id(),
                    "frame stream resumed after a gap"
                );
            }
            if gap >= DETECTOR_RESET_AFTER && self.detector.is_seeded() {
                tracing::info!(gap_secs = gap.as_secs_f64(), "re-seeding detector after long gap");
                self.detector.reset();
            }
        }
        self.last_frame = Some(frame.timestamp);

        let result = match self.detector.classify(&frame) {
            Ok(result) => {
                self.consecutive_faults = 0;
                result
            }
            Err(err) => {
                self.on_detector_fault(&frame, err).await;
                return None;
            }
        };

        self.stats.frames_processed += 1;
        if result.is_motion {
            self.stats.motion_frames += 1;
        }

        self.precapture.push(frame.clone());
        let directives = self.machine.process(&frame, &result);
        self.execute(directives).await;
        Some(result)
    }

    async fn on_detector_fault(&mut self, frame: &Frame, err: crate::error::DetectorError) {
        self.stats.detector_faults += 1;
        self.consecutive_faults += 1;
        tracing::warn!(
            fault = %FaultKind::DetectorFault,
            consecutive = self.consecutive_faults,
            event_id = self.event_id(),
            error = %err,
            "dropping malformed frame"
        );

        let directives = if self.consecutive_faults >= self.max_consecutive_faults
            && self.machine.state() == EventState::EventActive
        {
            tracing::error!(
                fault = %FaultKind::EventAbort,
                consecutive = self.consecutive_faults,
                event_id = self.event_id(),
                "sustained detector faults, aborting event"
            );
            self.consecutive_faults = 0;
            self.machine.abort(frame.timestamp, frame.captured_at)
        } else {
            // A dropped frame counts as "no motion" for the timeouts.
            self.machine.tick(frame.timestamp, frame.captured_at)
        };
        self.execute(directives).await;
    }

    /// Called when no frame arrived within the frame timeout.
    pub async fn on_capture_gap(&mut self, now: Instant, wall: DateTime<Local>) {
        self.stats.capture_gaps += 1;
        let silent_for = self.last_frame.map(|last| now.saturating_duration_since(last));
        tracing::warn!(
            fault = %FaultKind::CaptureGap,
            silent_secs = silent_for.map(|d| d.as_secs_f64()),
            event_id = self.event_id(),
            "no frames from capture"
        );
        if silent_for.is_some_and(|d| d >= DETECTOR_RESET_AFTER) && self.detector.is_seeded() {
            self.detector.reset();
        }
        let directives = self.machine.tick(now, wall);
        self.execute(directives).await;
    }

    /// Accounts for frames the capture queue discarded before they reached us.
    /// Each overflow counts as one capture gap.
    pub fn record_dropped(&mut self, count: u64) {
        self.stats.dropped_frames += count;
        self.stats.capture_gaps += 1;
    }

    /// Ends any active event, finalizes its recording, waits for pending pictures
    /// and lifecycle work, and discards the precapture buffer. Running hooks are
    /// left to their dispatcher.
    pub async fn shutdown(&mut self) -> PipelineStats {
        let now = self.last_frame.unwrap_or_else(Instant::now);
        let directives = self.machine.end_now(now, Local::now());
        self.execute(directives).await;

        if let Some(session) = self.session.take() {
            self.close_in_background(session);
        }
        for task in self.picture_tasks.drain(..) {
            let _ = task.await;
        }
        if let Some(tail) = self.lifecycle.take() {
            let _ = tail.await;
        }
        self.precapture.clear();

        let stats = self.stats();
        tracing::info!(
            frames = stats.frames_processed,
            events = stats.events_started,
            recordings = stats.recordings_finalized,
            faults = stats.detector_faults + stats.recording_failures,
            "pipeline stopped"
        );
        stats
    }

    fn event_id(&self) -> Option<u64> {
        self.machine.current_event().map(|e| e.id)
    }

    async fn execute(&mut self, directives: Vec<Directive>) {
        let mut queue: VecDeque<Directive> = directives.into();

        while let Some(directive) = queue.pop_front() {
            match directive {
                Directive::Transition { from, to } => {
                    tracing::debug!(from = from.as_str(), to = to.as_str(), "event state changed");
                }
                Directive::StartEvent(event) => {
                    tracing::info!(event_id = event.id, "event started");
                    self.announce(
                        HookName::EventStart,
                        HookContext {
                            event_id: Some(event.id),
                            timestamp: Some(event.started_at),
                            start_time: Some(event.started_at),
                            ..HookContext::default()
                        },
                    );
                }
                Directive::TakePicture { event_id, frame, region } => {
                    self.take_picture(event_id, frame, region);
                }
                Directive::OpenRecording { event, frame } => {
                    let seed = self.precapture.drain_since(frame.timestamp);
                    let spec = StreamSpec::of(&frame, self.recorder.fps());
                    match self.recorder.open_session(&event, spec, seed).await {
                        Ok(session) => {
                            self.announce(
                                HookName::MovieStart,
                                HookContext {
                                    event_id: Some(event.id),
                                    filename: Some(session.current_path().to_path_buf()),
                                    segment: Some(session.segment_index()),
                                    timestamp: Some(event.started_at),
                                    start_time: Some(event.started_at),
                                    ..HookContext::default()
                                },
                            );
                            self.session = Some(session);
                        }
                        Err(err) => {
                            tracing::error!(
                                fault = %FaultKind::EncoderFault,
                                event_id = event.id,
                                error = %err,
                                "could not start recording"
                            );
                            queue.extend(self.machine.abort(frame.timestamp, frame.captured_at));
                        }
                    }
                }
                Directive::Feed(frame) => {
                    let Some(session) = self.session.as_ref() else {
                        continue;
                    };
                    if let Err(err) = session.feed(frame.clone()) {
                        tracing::error!(
                            fault = %FaultKind::EncoderFault,
                            event_id = session.event_id(),
                            segment = session.segment_index(),
                            error = %err,
                            "recording session failed, aborting event"
                        );
                        queue.extend(self.fail_recording(frame.timestamp, frame.captured_at).await);
                    }
                }
                Directive::RotateRecording { event_id, at, at_wall } => {
                    let Some(session) = self.session.as_mut() else {
                        continue;
                    };
                    let requested = session
                        .rotate(at, at_wall)
                        .map(|pending| (pending, session.segment_index()));
                    match requested {
                        Ok((pending, segment)) => {
                            let hooks = Arc::clone(&self.hooks);
                            let finalized = Arc::clone(&self.recordings_finalized);
                            self.then(async move {
                                match pending.outcome().await {
                                    Ok(rotation) => {
                                        if let Some(done) = rotation.finished {
                                            announce_finalized(&hooks, &finalized, &done);
                                        }
                                        if let Some(path) = rotation.started {
                                            hooks.dispatch(
                                                HookName::MovieStart,
                                                &HookContext {
                                                    event_id: Some(event_id),
                                                    filename: Some(path),
                                                    segment: Some(segment),
                                                    timestamp: Some(at_wall),
                                                    ..HookContext::default()
                                                },
                                            );
                                        }
                                    }
                                    Err(err) => tracing::error!(
                                        fault = %FaultKind::EncoderFault,
                                        event_id,
                                        error = %err,
                                        "recording rotation did not complete"
                                    ),
                                }
                            });
                        }
                        Err(err) => {
                            tracing::error!(
                                fault = %FaultKind::EncoderFault,
                                event_id,
                                error = %err,
                                "recording rotation failed"
                            );
                            queue.extend(self.fail_recording(at, at_wall).await);
                        }
                    }
                }
                Directive::CloseRecording { .. } => {
                    if let Some(session) = self.session.take() {
                        self.close_in_background(session);
                    }
                }
                Directive::EndEvent(event) => {
                    let duration = event
                        .end_time
                        .map(|end| end.saturating_duration_since(event.start_time).as_secs_f64());
                    tracing::info!(event_id = event.id, duration_secs = duration, "event ended");
                    self.announce(
                        HookName::EventEnd,
                        HookContext {
                            event_id: Some(event.id),
                            timestamp: event.ended_at,
                            start_time: Some(event.started_at),
                            end_time: event.ended_at,
                            ..HookContext::default()
                        },
                    );
                }
            }
        }
    }

    /// Runs `work` once everything already on the lifecycle chain is done.
    fn then<F>(&mut self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let previous = self.lifecycle.take();
        self.lifecycle = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            work.await;
        }));
    }

    /// Fires a hook now, or after the outstanding lifecycle work if there is any.
    fn announce(&mut self, hook: HookName, context: HookContext) {
        match self.lifecycle.take() {
            Some(previous) if !previous.is_finished() => {
                self.lifecycle = Some(previous);
                let hooks = Arc::clone(&self.hooks);
                self.then(async move { hooks.dispatch(hook, &context) });
            }
            _ => self.hooks.dispatch(hook, &context),
        }
    }

    fn close_in_background(&mut self, session: RecordingSession) {
        let hooks = Arc::clone(&self.hooks);
        let finalized = Arc::clone(&self.recordings_finalized);
        let event_id = session.event_id();
        self.then(async move {
            match session.close().await {
                Ok(recording) => announce_finalized(&hooks, &finalized, &recording),
                Err(err) => tracing::error!(
                    fault = %FaultKind::EncoderFault,
                    event_id,
                    error = %err,
                    "recording did not finalize cleanly"
                ),
            }
        });
    }

    /// Tears the session down and ends the event early.
    async fn fail_recording(&mut self, now: Instant, wall: DateTime<Local>) -> Vec<Directive> {
        if let Some(session) = self.session.take() {
            session.abort().await;
        }
        self.machine.abort(now, wall)
    }

    fn take_picture(&mut self, event_id: u64, frame: Frame, region: Option<crate::core_modules::blob::BoundingBox>) {
        if !self.pictures.is_enabled() {
            return;
        }
        let pictures = self.pictures.clone();
        let hooks = Arc::clone(&self.hooks);
        let saved = Arc::clone(&self.pictures_saved);
        let taken_at = frame.captured_at;

        self.picture_tasks.retain(|task| !task.is_finished());
        self.picture_tasks.push(tokio::spawn(async move {
            match pictures.save(event_id, frame, region).await {
                Ok(path) => {
                    saved.fetch_add(1, Ordering::Relaxed);
                    hooks.dispatch(
                        HookName::PictureTaken,
                        &HookContext {
                            event_id: Some(event_id),
                            filename: Some(path),
                            timestamp: Some(taken_at),
                            ..HookContext::default()
                        },
                    );
                }
                Err(err) => tracing::warn!(event_id, error = %err, "could not save picture"),
            }
        }));
    }
}

fn announce_finalized(hooks: &HookDispatcher, finalized: &AtomicU64, recording: &Recording) {
    finalized.fetch_add(1, Ordering::Relaxed);
    hooks.dispatch(
        HookName::MovieEnd,
        &HookContext {
            event_id: Some(recording.event_id),
            filename: Some(recording.path.clone()),
            segment: Some(recording.sequence_index),
            timestamp: Some(Local::now()),
            start_time: Some(recording.started_at),
            ..HookContext::default()
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::frame::PixelFormat;
    use crate::test_support::{EncoderBehaviour, MemoryEncoderFactory, RecordingRunner};
    use std::path::Path;

    const W: u32 = 80;
    const H: u32 = 60;
    const FPS: u32 = 10;

    fn config(dir: &Path) -> SentryConfig {
        let mut config = SentryConfig::default();
        config.camera.fps = FPS as f64;
        config.camera.width = W;
        config.camera.height = H;
        config.detection.min_area = 100;
        config.detection.blur_size = 3;
        config.detection.dilate_iterations = 0;
        config.movie.dirpath = dir.join("movies");
        config.movie.precapture_seconds = 1.0;
        config.movie.finalize_timeout_seconds = 0.5;
        config.picture.dirpath = dir.join("pictures");
        config.event.no_motion_timeout = 1.0;
        config.event.event_gap = 0.0;
        config.event.on_event_start = "start {event_id}".into();
        config.event.on_event_end = "end {event_id}".into();
        config.event.on_movie_start = "movie_start {filename}".into();
        config.event.on_movie_end = "movie_end {filename}".into();
        config.event.on_picture_taken = "picture {filename}".into();
        config
    }

    struct Harness {
        pipeline: MotionPipeline,
        encoders: MemoryEncoderFactory,
        runner: RecordingRunner,
        hooks: Arc<HookDispatcher>,
        base: Instant,
        _dir: tempfile::TempDir,
    }

    fn harness(tweak: impl FnOnce(&mut SentryConfig), behaviour: EncoderBehaviour) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        tweak(&mut config);
        std::fs::create_dir_all(&config.movie.dirpath).unwrap();
        std::fs::create_dir_all(&config.picture.dirpath).unwrap();

        let encoders = MemoryEncoderFactory::new(behaviour);
        let runner = RecordingRunner::default();
        let hooks = Arc::new(HookDispatcher::new(&config.event, Arc::new(runner.clone())));
        let pipeline = MotionPipeline::new(&config, Arc::new(encoders.clone()), Arc::clone(&hooks));
        Harness {
            pipeline,
            encoders,
            runner,
            hooks,
            base: Instant::now(),
            _dir: dir,
        }
    }

    impl Harness {
        fn frame(&self, i: u32, square: u32) -> Frame {
            let mut px = vec![30u8; (W * H) as usize];
            for y in 10..10 + square {
                for x in 10..10 + square {
                    px[(y * W + x) as usize] = 230;
                }
            }
            Frame::new(
                self.base + Duration::from_secs(i as u64) / FPS,
                Local::now(),
                W,
                H,
                PixelFormat::Gray8,
                px,
            )
        }

        async fn run(&mut self, range: std::ops::Range<u32>, square: impl Fn(u32) -> u32) {
            for i in range {
                let frame = self.frame(i, square(i));
                self.pipeline.process_frame(frame).await;
                // The service loop yields while it waits for the next frame.
                tokio::task::yield_now().await;
            }
        }
    }

    #[tokio::test]
    async fn quiet_scene_records_nothing() {
        let mut h = harness(|_| {}, EncoderBehaviour::default());
        h.run(0..100, |_| 0).await;
        let stats = h.pipeline.shutdown().await;
        h.hooks.shutdown().await;

        assert_eq!(stats.frames_processed, 100);
        assert_eq!(stats.events_started, 0);
        assert!(h.encoders.segments().is_empty());
        assert!(h.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn event_records_precapture_and_fires_hooks_in_order() {
        let mut h = harness(|c| c.picture.enabled = false, EncoderBehaviour::default());
        // Motion on frames 30..40, silence afterwards.
        h.run(0..70, |i| if (30..40).contains(&i) { 20 } else { 0 }).await;
        h.pipeline.shutdown().await;
        h.hooks.shutdown().await;

        assert_eq!(
            h.runner.hooks(),
            vec![
                HookName::EventStart,
                HookName::MovieStart,
                HookName::MovieEnd,
                HookName::EventEnd
            ]
        );

        let segments = h.encoders.segments();
        assert_eq!(segments.len(), 1);
        let frames = &segments[0].frames;
        // One second of precapture at 10 fps, then frames 30 ..= 49.
        assert_eq!(frames.first(), Some(&(h.base + Duration::from_secs(2))));
        assert_eq!(frames.len(), 10 + 20);
        assert!(frames.windows(2).all(|w| w[0] < w[1]));
        assert!(segments[0].stopped);
    }

    #[tokio::test]
    async fn long_event_rotates_exactly_once() {
        let mut h = harness(|c| c.movie.max_record_seconds = 3.0, EncoderBehaviour::default());
        h.run(0..100, |i| if (20..65).contains(&i) { 20 } else { 0 }).await;
        let stats = h.pipeline.shutdown().await;
        h.hooks.shutdown().await;

        assert_eq!(stats.rotations, 1);
        assert_eq!(stats.recordings_finalized, 2);
        let segments = h.encoders.segments();
        assert_eq!(segments.len(), 2);

        let all: Vec<Instant> = segments.iter().flat_map(|s| s.frames.clone()).collect();
        assert!(all.windows(2).all(|w| w[0] < w[1]), "frames duplicated or reordered");
        let expected: Vec<Instant> = (10..75).map(|i| h.base + Duration::from_secs(i) / FPS).collect();
        assert_eq!(all, expected);
        assert_eq!(segments[1].frames[0], h.base + Duration::from_secs(5));

        let hooks = h.runner.hooks();
        let movie_starts = hooks.iter().filter(|n| **n == HookName::MovieStart).count();
        let movie_ends = hooks.iter().filter(|n| **n == HookName::MovieEnd).count();
        assert_eq!((movie_starts, movie_ends), (2, 2));
        assert_eq!(hooks.iter().filter(|n| **n == HookName::EventStart).count(), 1);
    }

    #[tokio::test]
    async fn slow_finalize_does_not_hold_up_detection() {
        let mut h = harness(
            |c| {
                c.picture.enabled = false;
                c.movie.max_record_seconds = 3.0;
                c.movie.finalize_timeout_seconds = 1.0;
            },
            EncoderBehaviour {
                stop_delay: Some(Duration::from_millis(400)),
                ..Default::default()
            },
        );
        let started = Instant::now();
        h.run(0..60, |i| if i >= 20 { 20 } else { 0 }).await;
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(h.pipeline.stats().rotations, 1);

        let stats = h.pipeline.shutdown().await;
        h.hooks.shutdown().await;
        assert_eq!(stats.recordings_finalized, 2);
        assert_eq!(stats.recording_failures, 0);

        let segments = h.encoders.segments();
        let all: Vec<Instant> = segments.iter().flat_map(|s| s.frames.clone()).collect();
        let expected: Vec<Instant> = (10..60).map(|i| h.base + Duration::from_secs(i) / FPS).collect();
        assert_eq!(all, expected);
        assert_eq!(segments[1].frames[0], h.base + Duration::from_secs(5));
        assert_eq!(
            h.runner.hooks(),
            vec![
                HookName::EventStart,
                HookName::MovieStart,
                HookName::MovieEnd,
                HookName::MovieStart,
                HookName::MovieEnd,
                HookName::EventEnd
            ]
        );
    }

    #[tokio::test]
    async fn failed_rotation_is_counted_once() {
        let mut h = harness(
            |c| {
                c.picture.enabled = false;
                c.movie.max_record_seconds = 3.0;
                c.event.event_gap = 60.0;
            },
            EncoderBehaviour {
                fail_stop: true,
                ..Default::default()
            },
        );
        h.run(0..80, |i| if (20..65).contains(&i) { 20 } else { 0 }).await;
        let stats = h.pipeline.shutdown().await;
        h.hooks.shutdown().await;

        assert_eq!(stats.rotations, 1);
        assert_eq!(stats.recording_failures, 1);
        assert_eq!(stats.recordings_finalized, 0);
        let hooks = h.runner.hooks();
        assert!(!hooks.contains(&HookName::MovieEnd));
        assert_eq!(hooks.last(), Some(&HookName::EventEnd));
    }

    #[tokio::test]
    async fn picture_is_written_and_announced() {
        let mut h = harness(|_| {}, EncoderBehaviour::default());
        h.run(0..45, |i| if (30..40).contains(&i) { 20 } else { 0 }).await;
        let stats = h.pipeline.shutdown().await;
        h.hooks.shutdown().await;

        assert_eq!(stats.pictures_saved, 1);
        let picture = h
            .runner
            .calls()
            .into_iter()
            .find(|(hook, _)| *hook == HookName::PictureTaken)
            .map(|(_, command)| command)
            .unwrap();
        let path = picture.trim_start_matches("picture ");
        assert!(Path::new(path).exists());
        assert!(path.contains("picture_event00001_"));
    }

    #[tokio::test]
    async fn encoder_start_failure_aborts_the_event() {
        let mut h = harness(
            |c| {
                c.picture.enabled = false;
                c.event.event_gap = 60.0;
            },
            EncoderBehaviour {
                fail_start: true,
                ..Default::default()
            },
        );
        h.run(0..40, |i| if i >= 30 { 20 } else { 0 }).await;

        assert_eq!(h.pipeline.state(), EventState::Cooldown);
        let stats = h.pipeline.shutdown().await;
        h.hooks.shutdown().await;
        assert_eq!(stats.events_aborted, 1);
        assert_eq!(stats.recording_failures, 1);
        assert_eq!(h.runner.hooks(), vec![HookName::EventStart, HookName::EventEnd]);
    }

    #[tokio::test]
    async fn sustained_detector_faults_abort_the_event() {
        let mut h = harness(
            |c| {
                c.picture.enabled = false;
                c.detection.max_consecutive_faults = 3;
                c.event.no_motion_timeout = 60.0;
            },
            EncoderBehaviour::default(),
        );
        h.run(0..35, |i| if i >= 30 { 20 } else { 0 }).await;
        assert_eq!(h.pipeline.state(), EventState::EventActive);

        for i in 35..38 {
            let mut frame = h.frame(i, 0);
            frame.payload = Arc::from(vec![0u8; 3]);
            assert!(h.pipeline.process_frame(frame).await.is_none());
        }
        assert_eq!(h.pipeline.state(), EventState::Cooldown);

        let stats = h.pipeline.shutdown().await;
        assert_eq!(stats.detector_faults, 3);
        assert_eq!(stats.events_aborted, 1);
        assert_eq!(stats.recordings_finalized, 1);
    }

    #[tokio::test]
    async fn shutdown_finalizes_an_active_recording() {
        let mut h = harness(|c| c.picture.enabled = false, EncoderBehaviour::default());
        h.run(0..40, |i| if i >= 30 { 20 } else { 0 }).await;
        assert_eq!(h.pipeline.state(), EventState::EventActive);

        let stats = h.pipeline.shutdown().await;
        h.hooks.shutdown().await;
        assert_eq!(stats.recordings_finalized, 1);
        assert_eq!(stats.events_aborted, 0);
        assert!(h.encoders.segments()[0].stopped);
        assert_eq!(h.runner.hooks().last(), Some(&HookName::EventEnd));
    }

    #[tokio::test]
    async fn capture_gap_ticks_the_event_closed() {
        let mut h = harness(|c| c.picture.enabled = false, EncoderBehaviour::default());
        h.run(0..35, |i| if i >= 30 { 20 } else { 0 }).await;
        assert_eq!(h.pipeline.state(), EventState::EventActive);

        h.pipeline
            .on_capture_gap(h.base + Duration::from_secs(5), Local::now())
            .await;
        assert_eq!(h.pipeline.state(), EventState::Cooldown);
        assert_eq!(h.pipeline.stats().capture_gaps, 1);
    }

    #[tokio::test]
    async fn out_of_order_frames_are_dropped() {
        let mut h = harness(|_| {}, EncoderBehaviour::default());
        h.run(0..5, |_| 0).await;
        let stale = h.frame(2, 0);
        assert!(h.pipeline.process_frame(stale).await.is_none());
        assert_eq!(h.pipeline.stats().dropped_frames, 1);
    }

    #[tokio::test]
    async fn queue_overflow_counts_dropped_frames_and_a_gap() {
        let mut h = harness(|_| {}, EncoderBehaviour::default());
        h.pipeline.record_dropped(7);
        let stats = h.pipeline.stats();
        assert_eq!(stats.dropped_frames, 7);
        assert_eq!(stats.capture_gaps, 1);
    }
}
