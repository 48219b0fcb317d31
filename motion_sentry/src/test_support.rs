//! In-memory stand-ins for the encoder and hook runner, shared by unit tests.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::core_modules::encoder::{Encoder, EncoderFactory, StreamSpec};
use crate::core_modules::frame::Frame;
use crate::core_modules::hooks::{CommandRunner, HookName};
use crate::error::{EncoderError, HookError};

#[derive(Debug, Clone, Default)]
pub struct EncoderBehaviour {
    /// Fail the write after this many successful ones.
    pub fail_write_at: Option<usize>,
    pub fail_start: bool,
    pub stall_write: bool,
    pub stall_stop: bool,
    pub fail_stop: bool,
    /// `stop` takes this long before it succeeds.
    pub stop_delay: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct SegmentLog {
    pub path: PathBuf,
    pub frames: Vec<Instant>,
    pub stopped: bool,
    pub aborted: bool,
}

#[derive(Clone)]
pub struct MemoryEncoderFactory {
    behaviour: EncoderBehaviour,
    segments: Arc<Mutex<Vec<SegmentLog>>>,
}

impl MemoryEncoderFactory {
    pub fn new(behaviour: EncoderBehaviour) -> Self {
        Self {
            behaviour,
            segments: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn segments(&self) -> Vec<SegmentLog> {
        self.segments.lock().unwrap().clone()
    }
}

impl EncoderFactory for MemoryEncoderFactory {
    fn create(&self) -> Box<dyn Encoder> {
        Box::new(MemoryEncoder {
            behaviour: self.behaviour.clone(),
            segments: Arc::clone(&self.segments),
            slot: None,
            written: 0,
        })
    }
}

struct MemoryEncoder {
    behaviour: EncoderBehaviour,
    segments: Arc<Mutex<Vec<SegmentLog>>>,
    slot: Option<usize>,
    written: usize,
}

impl MemoryEncoder {
    fn update(&self, f: impl FnOnce(&mut SegmentLog)) {
        if let Some(slot) = self.slot {
            f(&mut self.segments.lock().unwrap()[slot]);
        }
    }
}

#[async_trait]
impl Encoder for MemoryEncoder {
    async fn start(&mut self, path: &Path, _spec: &StreamSpec) -> Result<(), EncoderError> {
        if self.behaviour.fail_start {
            return Err(EncoderError::Other("start refused".into()));
        }
        tokio::fs::write(path, b"").await?;
        let mut segments = self.segments.lock().unwrap();
        segments.push(SegmentLog {
            path: path.to_path_buf(),
            frames: Vec::new(),
            stopped: false,
            aborted: false,
        });
        self.slot = Some(segments.len() - 1);
        Ok(())
    }

    async fn write(&mut self, frame: &Frame) -> Result<(), EncoderError> {
        if self.behaviour.stall_write {
            std::future::pending::<()>().await;
        }
        if self.behaviour.fail_write_at == Some(self.written) {
            return Err(EncoderError::Other("write refused".into()));
        }
        self.written += 1;
        let timestamp = frame.timestamp;
        self.update(|log| log.frames.push(timestamp));
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), EncoderError> {
        if self.behaviour.stall_stop {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = self.behaviour.stop_delay {
            tokio::time::sleep(delay).await;
        }
        if self.behaviour.fail_stop {
            return Err(EncoderError::Exited { code: Some(1) });
        }
        self.update(|log| log.stopped = true);
        Ok(())
    }

    async fn abort(&mut self) {
        self.update(|log| log.aborted = true);
    }
}

/// Records every command it is asked to run.
#[derive(Clone, Default)]
pub struct RecordingRunner {
    calls: Arc<Mutex<Vec<(HookName, String)>>>,
    delay: Option<Duration>,
    fail: bool,
}

impl RecordingRunner {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<(HookName, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn hooks(&self) -> Vec<HookName> {
        self.calls().into_iter().map(|(hook, _)| hook).collect()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, hook: HookName, command: String) -> BoxFuture<'static, Result<(), HookError>> {
        self.calls.lock().unwrap().push((hook, command));
        let delay = self.delay;
        let fail = self.fail;
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if fail {
                Err(HookError::Exit {
                    code: Some(1),
                    stderr: "refused".into(),
                })
            } else {
                Ok(())
            }
        })
    }
}
