// THEORY:
// The `SentryService` is the concurrent wiring around the `MotionPipeline`.
//
// Tasks:
// 1.  **Capture**: Reads the `FrameSource` on its own task and publishes every frame
//     on a bounded broadcast channel. Publishing never waits. When the detector falls
//     behind, the channel discards the *oldest* frames, so capture keeps pace with
//     the camera and the detector always resumes on recent footage.
// 2.  **Detection**: The calling task receives frames and feeds the pipeline. If
//     nothing arrives within the frame timeout, the pipeline is told about the gap
//     so event timeouts still fire. Recording writers, hooks and pictures run on
//     tasks of their own, spawned by the pipeline.
// 3.  **Shutdown**: Triggered by the shutdown watch (or by the end of the stream).
//     Capture is stopped, the active recording is finalized, and running hooks get
//     their budget to finish. Nothing is persisted.

use chrono::Local;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;

use crate::config::SentryConfig;
use crate::core_modules::encoder::EncoderFactory;
use crate::core_modules::frame::Frame;
use crate::core_modules::frame_source::FrameSource;
use crate::core_modules::hooks::{CommandRunner, HookDispatcher};
use crate::error::{FaultKind, SentryError};
use crate::pipeline::{MotionPipeline, PipelineStats};

/// Consecutive read errors after which capture gives up.
const MAX_CAPTURE_ERRORS: u32 = 10;
const CAPTURE_RETRY_DELAY: Duration = Duration::from_millis(100);
/// How long capture gets to release its device on shutdown.
const CAPTURE_STOP_GRACE: Duration = Duration::from_secs(5);

pub struct SentryService {
    config: SentryConfig,
    encoders: Arc<dyn EncoderFactory>,
    runner: Arc<dyn CommandRunner>,
}

impl SentryService {
    /// Validates the configuration; an invalid snapshot never reaches the engine.
    pub fn new(
        config: SentryConfig,
        encoders: Arc<dyn EncoderFactory>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, SentryError> {
        config.validate()?;
        Ok(Self {
            config,
            encoders,
            runner,
        })
    }

    pub fn config(&self) -> &SentryConfig {
        &self.config
    }

    /// Creates the movie and picture directories.
    pub async fn prepare_directories(&self) -> Result<(), SentryError> {
        let mut dirs = vec![self.config.movie.dirpath.clone()];
        if self.config.picture.enabled {
            dirs.push(self.config.picture.dirpath.clone());
        }
        for dir in dirs {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|source| SentryError::OutputDir { path: dir.clone(), source })?;
        }
        Ok(())
    }

    /// Runs until `shutdown` flips to `true` (or its sender goes away) or the
    /// source reaches end of stream.
    pub async fn run<S>(self, source: S, mut shutdown: watch::Receiver<bool>) -> Result<PipelineStats, SentryError>
    where
        S: FrameSource + 'static,
    {
        self.prepare_directories().await?;

        let hooks = Arc::new(HookDispatcher::new(&self.config.event, Arc::clone(&self.runner)));
        let mut pipeline = MotionPipeline::new(&self.config, Arc::clone(&self.encoders), Arc::clone(&hooks));

        let (frames_tx, mut frames_rx) = broadcast::channel::<Frame>(self.config.camera.queue_frames);
        let (stop_tx, stop_rx) = watch::channel(false);
        let capture = tokio::spawn(capture_loop(source, frames_tx, stop_rx));
        let frame_timeout = self.config.frame_timeout();

        tracing::info!(
            width = self.config.camera.width,
            height = self.config.camera.height,
            fps = self.config.camera.fps,
            "motion detection running"
        );

        if !*shutdown.borrow() {
            loop {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::info!("shutdown requested");
                            break;
                        }
                    }
                    received = timeout(frame_timeout, frames_rx.recv()) => match received {
                        Ok(Ok(frame)) => {
                            pipeline.process_frame(frame).await;
                        }
                        Ok(Err(RecvError::Lagged(dropped))) => {
                            tracing::warn!(
                                fault = %FaultKind::CaptureGap,
                                dropped,
                                "detection fell behind, oldest frames discarded"
                            );
                            pipeline.record_dropped(dropped);
                        }
                        Ok(Err(RecvError::Closed)) => {
                            tracing::info!("capture finished");
                            break;
                        }
                        Err(_) => pipeline.on_capture_gap(Instant::now(), Local::now()).await,
                    }
                }
            }
        }

        let _ = stop_tx.send(true);
        drop(frames_rx);
        pipeline.shutdown().await;
        if timeout(CAPTURE_STOP_GRACE, capture).await.is_err() {
            tracing::warn!("capture did not stop in time");
        }
        hooks.shutdown().await;

        let stats = pipeline.stats();
        tracing::info!(
            hooks_dispatched = stats.hooks.dispatched,
            hooks_failed = stats.hooks.failed,
            dropped_frames = stats.dropped_frames,
            "service stopped"
        );
        Ok(stats)
    }
}

async fn capture_loop<S: FrameSource>(mut source: S, frames: broadcast::Sender<Frame>, mut stop: watch::Receiver<bool>) {
    let mut consecutive_errors = 0u32;
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            next = source.next_frame() => match next {
                Ok(Some(frame)) => {
                    consecutive_errors = 0;
                    // Fails only when detection has already gone away.
                    if frames.send(frame).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    tracing::info!("frame source reached end of stream");
                    break;
                }
                Err(err) => {
                    consecutive_errors += 1;
                    tracing::warn!(
                        fault = %FaultKind::CaptureGap,
                        consecutive = consecutive_errors,
                        error = %err,
                        "frame read failed"
                    );
                    if consecutive_errors >= MAX_CAPTURE_ERRORS {
                        tracing::error!("giving up on the frame source");
                        break;
                    }
                    tokio::time::sleep(CAPTURE_RETRY_DELAY).await;
                }
            }
        }
    }
    source.stop().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::frame::PixelFormat;
    use crate::core_modules::frame_source::ReplaySource;
    use crate::core_modules::hooks::HookName;
    use crate::error::CaptureError;
    use crate::test_support::{EncoderBehaviour, MemoryEncoderFactory, RecordingRunner};
    use async_trait::async_trait;
    use std::path::Path;

    const W: u32 = 48;
    const H: u32 = 36;

    fn config(dir: &Path) -> SentryConfig {
        let mut config = SentryConfig::default();
        config.camera.width = W;
        config.camera.height = H;
        config.camera.fps = 10.0;
        config.camera.queue_frames = 256;
        config.detection.min_area = 50;
        config.detection.blur_size = 3;
        config.detection.dilate_iterations = 1;
        config.movie.dirpath = dir.join("movies");
        config.movie.precapture_seconds = 1.0;
        config.picture.dirpath = dir.join("pictures");
        config.event.no_motion_timeout = 1.0;
        config.event.on_event_start = "start".into();
        config.event.on_event_end = "end".into();
        config.event.on_movie_start = "movie_start".into();
        config.event.on_movie_end = "movie_end".into();
        config
    }

    fn frame(base: Instant, i: u32, motion: bool) -> Frame {
        let mut px = vec![60u8; (W * H) as usize];
        if motion {
            for y in 5..17 {
                for x in 5..17 {
                    px[(y * W + x) as usize] = 240;
                }
            }
        }
        Frame::new(
            base + Duration::from_millis(i as u64 * 100),
            Local::now(),
            W,
            H,
            PixelFormat::Gray8,
            px,
        )
    }

    #[test]
    fn invalid_configuration_is_rejected_up_front() {
        let mut config = SentryConfig::default();
        config.camera.fps = 0.0;
        let result = SentryService::new(
            config,
            Arc::new(MemoryEncoderFactory::new(EncoderBehaviour::default())),
            Arc::new(RecordingRunner::default()),
        );
        assert!(matches!(result, Err(SentryError::Config(_))));
    }

    #[tokio::test]
    async fn replayed_stream_produces_one_event() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let encoders = MemoryEncoderFactory::new(EncoderBehaviour::default());
        let runner = RecordingRunner::default();
        let service = SentryService::new(config, Arc::new(encoders.clone()), Arc::new(runner.clone())).unwrap();

        let base = Instant::now();
        let frames: Vec<Frame> = (0..80).map(|i| frame(base, i, (30..40).contains(&i))).collect();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let stats = service.run(ReplaySource::new(frames), shutdown_rx).await.unwrap();

        assert_eq!(stats.frames_processed, 80);
        assert_eq!(stats.events_started, 1);
        assert_eq!(stats.recordings_finalized, 1);
        assert_eq!(stats.pictures_saved, 1);
        assert_eq!(encoders.segments().len(), 1);
        assert!(dir.path().join("movies").is_dir());
        assert!(dir.path().join("pictures").is_dir());

        let hooks: Vec<HookName> = runner
            .hooks()
            .into_iter()
            .filter(|h| *h != HookName::PictureTaken)
            .collect();
        assert_eq!(
            hooks,
            vec![
                HookName::EventStart,
                HookName::MovieStart,
                HookName::MovieEnd,
                HookName::EventEnd
            ]
        );
    }

    /// Produces a frame every 10 ms forever.
    struct LiveSource {
        base: Instant,
        next: u32,
    }

    #[async_trait]
    impl FrameSource for LiveSource {
        async fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let frame = frame(self.base, self.next, self.next >= 20);
            self.next += 1;
            Ok(Some(frame))
        }
    }

    #[tokio::test]
    async fn shutdown_signal_finalizes_the_active_event() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.picture.enabled = false;
        let encoders = MemoryEncoderFactory::new(EncoderBehaviour::default());
        let runner = RecordingRunner::default();
        let service = SentryService::new(config, Arc::new(encoders.clone()), Arc::new(runner.clone())).unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let source = LiveSource {
            base: Instant::now(),
            next: 0,
        };
        let handle = tokio::spawn(service.run(source, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(600)).await;
        shutdown_tx.send(true).unwrap();
        let stats = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("service did not stop")
            .unwrap()
            .unwrap();

        assert_eq!(stats.events_started, 1);
        assert_eq!(stats.recordings_finalized, 1);
        assert!(encoders.segments()[0].stopped);
        assert_eq!(runner.hooks().last(), Some(&HookName::EventEnd));
    }

    #[tokio::test]
    async fn slow_finalize_loses_no_live_frames() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.picture.enabled = false;
        config.camera.queue_frames = 8;
        config.movie.max_record_seconds = 1.0;
        config.movie.finalize_timeout_seconds = 1.0;
        let encoders = MemoryEncoderFactory::new(EncoderBehaviour {
            stop_delay: Some(Duration::from_millis(400)),
            ..Default::default()
        });
        let service = SentryService::new(config, Arc::new(encoders.clone()), Arc::new(RecordingRunner::default())).unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let base = Instant::now();
        let handle = tokio::spawn(service.run(LiveSource { base, next: 0 }, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(500)).await;
        shutdown_tx.send(true).unwrap();
        let stats = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("service did not stop")
            .unwrap()
            .unwrap();

        assert_eq!(stats.dropped_frames, 0);
        assert!(stats.rotations >= 1);
        assert_eq!(stats.recordings_finalized, stats.rotations + 1);

        let segments = encoders.segments();
        assert_eq!(segments.len() as u64, stats.rotations + 1);
        let indices: Vec<u128> = segments
            .iter()
            .flat_map(|s| s.frames.iter().map(|t| (*t - base).as_millis() / 100))
            .collect();
        assert!(indices.windows(2).all(|w| w[1] == w[0] + 1), "recorded stream has gaps: {indices:?}");
    }

    #[tokio::test]
    async fn output_directory_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"").unwrap();
        let mut config = config(dir.path());
        config.movie.dirpath = blocker.join("movies");

        let service = SentryService::new(
            config,
            Arc::new(MemoryEncoderFactory::new(EncoderBehaviour::default())),
            Arc::new(RecordingRunner::default()),
        )
        .unwrap();
        let err = service.prepare_directories().await.unwrap_err();
        assert!(matches!(err, SentryError::OutputDir { .. }));
    }
}
