// THEORY:
// The `RecordingController` owns every video file the engine produces. An event
// gets one `RecordingSession`, and a session is a sequence of segments written by
// one dedicated writer task.
//
// Key architectural principles:
// 1.  **Single Writer**: All encoder calls happen on the writer task. The detection
//     loop only pushes frames into a bounded queue, so a slow disk or encoder never
//     stalls detection. A full queue is reported immediately as `Backlogged`.
// 2.  **Ordered Queue**: Seed (precapture) frames are queued first, then live
//     frames, in capture order. Rotation and close travel through the same queue,
//     so they act as barriers: everything fed before them is written before the
//     segment is finalized.
// 3.  **Bounded Finalize**: Finalizing asks the encoder to stop and waits at most
//     `finalize_timeout`. On timeout or failure the encoder is aborted and the
//     half-written file is renamed with a `.partial` suffix. No exit path leaves an
//     encoder running: clean close, rotation, failure, and a dropped session all
//     end in either `stop` or `abort`.
// 4.  **Replies over Oneshots**: Rotation and close report their outcome through
//     oneshot channels, the same request/reply shape the worker pool uses. A
//     rotation is only *requested* by the detection loop: the reply arrives as a
//     `PendingRotation` that someone else can wait on, so a slow finalize never
//     holds up live frames.
// 5.  **One Failure per Session**: A session that loses its writer, for whatever
//     reason, is counted once in `RecordingController::failures`.

use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::{MovieConfig, seconds};
use crate::core_modules::encoder::{Encoder, EncoderFactory, StreamSpec};
use crate::core_modules::event_machine::Event;
use crate::core_modules::frame::Frame;
use crate::error::{FaultKind, RecordingError};

/// Index of the first segment of every event.
pub const FIRST_SEGMENT: u32 = 1;

/// One finalized (or in-progress) video segment.
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub event_id: u64,
    pub path: PathBuf,
    pub start_time: Instant,
    pub started_at: DateTime<Local>,
    pub frame_count: u64,
    /// Raw frame bytes handed to the encoder.
    pub bytes_written: u64,
    /// 1-based position of the segment within its event.
    pub sequence_index: u32,
}

/// Outcome of a rotation. Failures are logged by the writer; a `None` here
/// means that half of the rotation did not happen.
#[derive(Debug)]
pub struct Rotation {
    /// The segment that was closed, when it finalized cleanly.
    pub finished: Option<Recording>,
    /// Path of the segment opened in its place.
    pub started: Option<PathBuf>,
}

/// `event00042_seg003_20240101_120000.mp4`
pub fn segment_path(dir: &Path, event_id: u64, index: u32, at: DateTime<Local>) -> PathBuf {
    dir.join(format!(
        "event{:05}_seg{:03}_{}.mp4",
        event_id,
        index,
        at.format("%Y%m%d_%H%M%S")
    ))
}

pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

/// Best effort; a missing file is not an error.
async fn rename_partial(path: &Path) {
    let target = partial_path(path);
    match tokio::fs::rename(path, &target).await {
        Ok(()) => tracing::warn!(path = %target.display(), "kept partial recording"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(path = %path.display(), error = %err, "could not mark recording as partial"),
    }
}

/// Shared between a session and its writer so that whichever side notices the
/// failure first counts it, and the other does not.
#[derive(Clone)]
struct FailureMark {
    failed: Arc<AtomicBool>,
    total: Arc<AtomicU64>,
}

impl FailureMark {
    fn new(total: &Arc<AtomicU64>) -> Self {
        Self {
            failed: Arc::new(AtomicBool::new(false)),
            total: Arc::clone(total),
        }
    }

    fn record(&self) {
        if !self.failed.swap(true, Ordering::AcqRel) {
            self.total.fetch_add(1, Ordering::Relaxed);
        }
    }
}

pub struct RecordingController {
    factory: Arc<dyn EncoderFactory>,
    dir: PathBuf,
    fps: f64,
    finalize_timeout: Duration,
    queue_capacity: usize,
    failures: Arc<AtomicU64>,
}

impl RecordingController {
    pub fn new(factory: Arc<dyn EncoderFactory>, movie: &MovieConfig, fps: f64) -> Self {
        Self {
            factory,
            dir: movie.dirpath.clone(),
            fps,
            finalize_timeout: seconds(movie.finalize_timeout_seconds),
            queue_capacity: movie.write_queue_capacity.max(1),
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// Sessions that failed to start or lost their writer.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Opens the first segment of `event` and queues `seed` ahead of any live
    /// frame. Seed frames whose geometry does not match `spec` are skipped.
    pub async fn open_session(
        &self,
        event: &Event,
        spec: StreamSpec,
        seed: Vec<Frame>,
    ) -> Result<RecordingSession, RecordingError> {
        let path = segment_path(&self.dir, event.id, FIRST_SEGMENT, event.started_at);
        let mut encoder = self.factory.create();
        if let Err(err) = encoder.start(&path, &spec).await {
            encoder.abort().await;
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(err.into());
        }
        let mark = FailureMark::new(&self.failures);

        let segment = Recording {
            event_id: event.id,
            path: path.clone(),
            start_time: event.start_time,
            started_at: event.started_at,
            frame_count: 0,
            bytes_written: 0,
            sequence_index: FIRST_SEGMENT,
        };
        let writer = SegmentWriter {
            encoder,
            factory: Arc::clone(&self.factory),
            spec,
            finalize_timeout: self.finalize_timeout,
            segment,
            mark: mark.clone(),
        };

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let handle = tokio::spawn(writer.run(rx));

        let seed_len = seed.len();
        let session = RecordingSession {
            event_id: event.id,
            dir: self.dir.clone(),
            tx,
            capacity: self.queue_capacity,
            handle,
            segment_index: FIRST_SEGMENT,
            current_path: path,
            sync_timeout: self.finalize_timeout.saturating_mul(3),
            mark,
        };
        for frame in seed.into_iter().filter(|f| spec.accepts(f)) {
            session
                .tx
                .send(WriterMessage::Frame(frame))
                .await
                .map_err(|_| RecordingError::WriterGone)?;
        }

        tracing::info!(
            event_id = event.id,
            segment = FIRST_SEGMENT,
            path = %session.current_path.display(),
            seed_frames = seed_len,
            "recording started"
        );
        Ok(session)
    }
}

struct SegmentStart {
    path: PathBuf,
    index: u32,
    start_time: Instant,
    started_at: DateTime<Local>,
}

enum WriterMessage {
    Frame(Frame),
    Rotate {
        next: SegmentStart,
        reply: oneshot::Sender<Rotation>,
    },
    Close {
        reply: oneshot::Sender<Result<Recording, RecordingError>>,
    },
}

/// The live handle the pipeline holds while an event records.
pub struct RecordingSession {
    event_id: u64,
    dir: PathBuf,
    tx: mpsc::Sender<WriterMessage>,
    capacity: usize,
    handle: JoinHandle<()>,
    segment_index: u32,
    current_path: PathBuf,
    /// Upper bound for a rotate/close round trip: a pending rotation, the queue
    /// drain and the final stop.
    sync_timeout: Duration,
    mark: FailureMark,
}

/// A rotation the writer has been asked for but may not have carried out yet.
pub struct PendingRotation {
    rx: oneshot::Receiver<Rotation>,
    limit: Duration,
    finishing: PathBuf,
}

impl PendingRotation {
    /// Waits for the writer to finalize the old segment and open the new one.
    pub async fn outcome(self) -> Result<Rotation, RecordingError> {
        match timeout(self.limit, self.rx).await {
            Ok(Ok(rotation)) => Ok(rotation),
            Ok(Err(_)) => Err(RecordingError::WriterGone),
            Err(_) => Err(RecordingError::FinalizeTimeout {
                path: self.finishing,
                timeout_secs: self.limit.as_secs_f64(),
            }),
        }
    }
}

impl RecordingSession {
    pub fn event_id(&self) -> u64 {
        self.event_id
    }

    pub fn segment_index(&self) -> u32 {
        self.segment_index
    }

    pub fn current_path(&self) -> &Path {
        &self.current_path
    }

    /// Queues a frame without waiting.
    pub fn feed(&self, frame: Frame) -> Result<(), RecordingError> {
        self.tx
            .try_send(WriterMessage::Frame(frame))
            .map_err(|err| self.send_error(err))
    }

    /// Asks the writer to finalize the current segment after everything already
    /// queued and to open the next one starting at `at`. Returns at once; frames
    /// fed afterwards belong to the new segment.
    pub fn rotate(&mut self, at: Instant, at_wall: DateTime<Local>) -> Result<PendingRotation, RecordingError> {
        let index = self.segment_index + 1;
        let path = segment_path(&self.dir, self.event_id, index, at_wall);
        let next = SegmentStart {
            path: path.clone(),
            index,
            start_time: at,
            started_at: at_wall,
        };

        let (reply, rx) = oneshot::channel();
        self.tx
            .try_send(WriterMessage::Rotate { next, reply })
            .map_err(|err| self.send_error(err))?;

        let finishing = std::mem::replace(&mut self.current_path, path);
        self.segment_index = index;
        Ok(PendingRotation {
            rx,
            limit: self.sync_timeout,
            finishing,
        })
    }

    fn send_error<T>(&self, err: TrySendError<T>) -> RecordingError {
        match err {
            TrySendError::Full(_) => RecordingError::Backlogged {
                capacity: self.capacity,
            },
            TrySendError::Closed(_) => RecordingError::WriterGone,
        }
    }

    /// Drains the queue, finalizes the current segment and ends the writer.
    pub async fn close(self) -> Result<Recording, RecordingError> {
        let (reply, rx) = oneshot::channel();
        let exchange = async {
            self.tx
                .send(WriterMessage::Close { reply })
                .await
                .map_err(|_| RecordingError::WriterGone)?;
            rx.await.unwrap_or(Err(RecordingError::WriterGone))
        };

        match timeout(self.sync_timeout, exchange).await {
            Ok(result) => {
                let _ = self.handle.await;
                result
            }
            Err(_) => {
                let err = RecordingError::FinalizeTimeout {
                    path: self.current_path.clone(),
                    timeout_secs: self.sync_timeout.as_secs_f64(),
                };
                self.abort().await;
                Err(err)
            }
        }
    }

    /// Kills the writer without draining, keeping whatever was written as `.partial`.
    pub async fn abort(self) {
        self.handle.abort();
        let _ = self.handle.await;
        self.mark.record();
        rename_partial(&self.current_path).await;
        tracing::warn!(
            event_id = self.event_id,
            segment = self.segment_index,
            "recording session aborted"
        );
    }
}

struct SegmentWriter {
    encoder: Box<dyn Encoder>,
    factory: Arc<dyn EncoderFactory>,
    spec: StreamSpec,
    finalize_timeout: Duration,
    segment: Recording,
    mark: FailureMark,
}

impl SegmentWriter {
    async fn run(mut self, mut rx: mpsc::Receiver<WriterMessage>) {
        while let Some(message) = rx.recv().await {
            match message {
                WriterMessage::Frame(frame) => {
                    if let Err(err) = self.write(&frame).await {
                        tracing::error!(
                            fault = %FaultKind::EncoderFault,
                            event_id = self.segment.event_id,
                            segment = self.segment.sequence_index,
                            path = %self.segment.path.display(),
                            error = %err,
                            "encoder write failed"
                        );
                        self.discard().await;
                        return;
                    }
                }
                WriterMessage::Rotate { next, reply } => {
                    let finished = self.finalize().await.ok();
                    if finished.is_none() {
                        let _ = reply.send(Rotation {
                            finished,
                            started: None,
                        });
                        return;
                    }
                    let started = self.open(next).await;
                    let keep_going = started.is_some();
                    let _ = reply.send(Rotation { finished, started });
                    if !keep_going {
                        return;
                    }
                }
                WriterMessage::Close { reply } => {
                    let _ = reply.send(self.finalize().await);
                    return;
                }
            }
        }

        // The session went away without closing; the segment is still finalized.
        tracing::warn!(
            event_id = self.segment.event_id,
            segment = self.segment.sequence_index,
            "recording session dropped, finalizing"
        );
        let _ = self.finalize().await;
    }

    async fn write(&mut self, frame: &Frame) -> Result<(), RecordingError> {
        if !self.spec.accepts(frame) {
            return Err(crate::error::EncoderError::GeometryMismatch {
                expected: self.spec.describe(),
                actual: StreamSpec::of(frame, self.spec.fps).describe(),
            }
            .into());
        }
        self.encoder.write(frame).await?;
        self.segment.frame_count += 1;
        self.segment.bytes_written += frame.payload.len() as u64;
        Ok(())
    }

    async fn finalize(&mut self) -> Result<Recording, RecordingError> {
        let outcome = match timeout(self.finalize_timeout, self.encoder.stop()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(RecordingError::from(err)),
            Err(_) => Err(RecordingError::FinalizeTimeout {
                path: self.segment.path.clone(),
                timeout_secs: self.finalize_timeout.as_secs_f64(),
            }),
        };

        match outcome {
            Ok(()) => {
                tracing::info!(
                    event_id = self.segment.event_id,
                    segment = self.segment.sequence_index,
                    path = %self.segment.path.display(),
                    frames = self.segment.frame_count,
                    "recording finalized"
                );
                Ok(self.segment.clone())
            }
            Err(err) => {
                tracing::error!(
                    fault = %FaultKind::EncoderFault,
                    event_id = self.segment.event_id,
                    segment = self.segment.sequence_index,
                    path = %self.segment.path.display(),
                    error = %err,
                    "recording failed to finalize"
                );
                self.discard().await;
                Err(err)
            }
        }
    }

    /// Starts the next segment on a fresh encoder.
    async fn open(&mut self, next: SegmentStart) -> Option<PathBuf> {
        self.encoder = self.factory.create();
        self.segment = Recording {
            event_id: self.segment.event_id,
            path: next.path,
            start_time: next.start_time,
            started_at: next.started_at,
            frame_count: 0,
            bytes_written: 0,
            sequence_index: next.index,
        };

        match self.encoder.start(&self.segment.path, &self.spec).await {
            Ok(()) => {
                tracing::info!(
                    event_id = self.segment.event_id,
                    segment = self.segment.sequence_index,
                    path = %self.segment.path.display(),
                    "recording rotated"
                );
                Some(self.segment.path.clone())
            }
            Err(err) => {
                tracing::error!(
                    fault = %FaultKind::EncoderFault,
                    event_id = self.segment.event_id,
                    segment = self.segment.sequence_index,
                    error = %err,
                    "could not start next segment"
                );
                self.discard().await;
                None
            }
        }
    }

    async fn discard(&mut self) {
        self.mark.record();
        self.encoder.abort().await;
        rename_partial(&self.segment.path).await;
    }
}
