//! Shared fixtures for the integration tests: a synthetic scene, an encoder that
//! records what it receives, and a hook runner that records what it is asked to run.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Local;
use futures::future::BoxFuture;
use motion_sentry::core_modules::encoder::{Encoder, EncoderFactory, StreamSpec};
use motion_sentry::core_modules::hooks::{CommandRunner, HookName};
use motion_sentry::error::{EncoderError, HookError};
use motion_sentry::{Frame, PixelFormat};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const WIDTH: u32 = 160;
pub const HEIGHT: u32 = 120;
pub const FPS: f64 = 30.0;

const BACKGROUND: u8 = 40;
const OBJECT: u8 = 220;

pub fn timestamp(base: Instant, index: u32) -> Instant {
    base + Duration::from_secs_f64(index as f64 / FPS)
}

pub fn index_of(base: Instant, at: Instant) -> u32 {
    ((at - base).as_secs_f64() * FPS).round() as u32
}

/// A flat scene with an optional bright square whose top-left corner is at (10, 10).
pub fn scene(base: Instant, index: u32, square: Option<u32>) -> Frame {
    let mut pixels = vec![BACKGROUND; (WIDTH * HEIGHT) as usize];
    if let Some(side) = square {
        for y in 10..(10 + side).min(HEIGHT) {
            for x in 10..(10 + side).min(WIDTH) {
                pixels[(y * WIDTH + x) as usize] = OBJECT;
            }
        }
    }
    Frame::new(
        timestamp(base, index),
        Local::now(),
        WIDTH,
        HEIGHT,
        PixelFormat::Gray8,
        pixels,
    )
}

#[derive(Debug, Clone)]
pub struct Segment {
    pub path: PathBuf,
    pub frames: Vec<Instant>,
    pub stopped: bool,
}

#[derive(Clone, Default)]
pub struct CapturingEncoders {
    segments: Arc<Mutex<Vec<Segment>>>,
}

impl CapturingEncoders {
    pub fn segments(&self) -> Vec<Segment> {
        self.segments.lock().unwrap().clone()
    }
}

impl EncoderFactory for CapturingEncoders {
    fn create(&self) -> Box<dyn Encoder> {
        Box::new(CapturingEncoder {
            segments: Arc::clone(&self.segments),
            slot: None,
        })
    }
}

struct CapturingEncoder {
    segments: Arc<Mutex<Vec<Segment>>>,
    slot: Option<usize>,
}

#[async_trait]
impl Encoder for CapturingEncoder {
    async fn start(&mut self, path: &Path, _spec: &StreamSpec) -> Result<(), EncoderError> {
        let mut segments = self.segments.lock().unwrap();
        segments.push(Segment {
            path: path.to_path_buf(),
            frames: Vec::new(),
            stopped: false,
        });
        self.slot = Some(segments.len() - 1);
        Ok(())
    }

    async fn write(&mut self, frame: &Frame) -> Result<(), EncoderError> {
        let slot = self.slot.ok_or(EncoderError::NotStarted)?;
        self.segments.lock().unwrap()[slot].frames.push(frame.timestamp);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), EncoderError> {
        let slot = self.slot.ok_or(EncoderError::NotStarted)?;
        self.segments.lock().unwrap()[slot].stopped = true;
        Ok(())
    }

    async fn abort(&mut self) {}
}

#[derive(Clone, Default)]
pub struct LoggingRunner {
    calls: Arc<Mutex<Vec<(HookName, String)>>>,
}

impl LoggingRunner {
    pub fn calls(&self) -> Vec<(HookName, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn hooks(&self) -> Vec<HookName> {
        self.calls().into_iter().map(|(hook, _)| hook).collect()
    }
}

impl CommandRunner for LoggingRunner {
    fn run(&self, hook: HookName, command: String) -> BoxFuture<'static, Result<(), HookError>> {
        self.calls.lock().unwrap().push((hook, command));
        Box::pin(async { Ok(()) })
    }
}
