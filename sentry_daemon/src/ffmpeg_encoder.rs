// THEORY:
// Each recording segment is one ffmpeg child process. Raw frames are written to its
// stdin in capture order; ffmpeg encodes them to H.264 in an MP4 container.
//
// Lifecycle:
// 1.  **start**: Spawn ffmpeg for the segment's path and stream geometry.
// 2.  **write**: Append a frame's bytes to stdin. A frame with different geometry is
//     refused, since the raw stream has no headers to announce a change.
// 3.  **stop**: Close stdin and wait for ffmpeg to write the trailer and exit. The
//     recording writer bounds the wait; a non-zero exit is an `EncoderFault`.
// 4.  **abort**: Kill the child without waiting for a trailer.

use async_trait::async_trait;
use motion_sentry::core_modules::encoder::{Encoder, EncoderFactory, StreamSpec};
use motion_sentry::error::EncoderError;
use motion_sentry::{Frame, PixelFormat};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};

fn raw_pix_fmt(format: PixelFormat) -> &'static str {
    match format {
        PixelFormat::Gray8 => "gray",
        PixelFormat::Rgb8 => "rgb24",
        PixelFormat::Rgba8 => "rgba",
    }
}

/// Arguments for an encoder that reads raw frames on stdin and writes `output`.
pub fn encoder_args(output: &Path, spec: &StreamSpec) -> Vec<String> {
    vec![
        "-y".into(),
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        raw_pix_fmt(spec.pixel_format).into(),
        "-s".into(),
        format!("{}x{}", spec.width, spec.height),
        "-r".into(),
        format!("{}", spec.fps),
        "-i".into(),
        "pipe:0".into(),
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        "ultrafast".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-f".into(),
        "mp4".into(),
        output.to_string_lossy().to_string(),
    ]
}

#[derive(Debug, Clone)]
pub struct FfmpegEncoderFactory {
    binary: PathBuf,
}

impl FfmpegEncoderFactory {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }
}

impl EncoderFactory for FfmpegEncoderFactory {
    fn create(&self) -> Box<dyn Encoder> {
        Box::new(FfmpegEncoder::new(self.binary.clone()))
    }
}

pub struct FfmpegEncoder {
    binary: PathBuf,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    spec: Option<StreamSpec>,
}

impl FfmpegEncoder {
    pub fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            child: None,
            stdin: None,
            spec: None,
        }
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn start(&mut self, path: &Path, spec: &StreamSpec) -> Result<(), EncoderError> {
        let args = encoder_args(path, spec);
        tracing::debug!(path = %path.display(), args = %args.join(" "), "starting encoder");

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(EncoderError::Spawn)?;
        self.stdin = child.stdin.take();
        if self.stdin.is_none() {
            let _ = child.kill().await;
            return Err(EncoderError::Other("encoder stdin was not piped".into()));
        }
        self.child = Some(child);
        self.spec = Some(*spec);
        Ok(())
    }

    async fn write(&mut self, frame: &Frame) -> Result<(), EncoderError> {
        let spec = self.spec.ok_or(EncoderError::NotStarted)?;
        if !spec.accepts(frame) {
            return Err(EncoderError::GeometryMismatch {
                expected: spec.describe(),
                actual: StreamSpec::of(frame, spec.fps).describe(),
            });
        }
        let stdin = self.stdin.as_mut().ok_or(EncoderError::NotStarted)?;
        stdin.write_all(&frame.payload).await?;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), EncoderError> {
        let mut child = self.child.take().ok_or(EncoderError::NotStarted)?;
        if let Some(mut stdin) = self.stdin.take() {
            stdin.flush().await?;
            // Dropping stdin is the end-of-input signal.
            drop(stdin);
        }
        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(EncoderError::Exited { code: status.code() })
        }
    }

    async fn abort(&mut self) {
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill().await {
                tracing::debug!(error = %err, "encoder process already gone");
            }
        }
    }
}
