// THEORY:
// Camera frames come from an ffmpeg child process. ffmpeg opens the device, decodes
// whatever the camera delivers, scales it to the configured geometry and writes raw
// RGB24 frames to its stdout. We read exactly one frame's worth of bytes at a time,
// so frame boundaries never have to be searched for.
//
// End of file on stdout is end of stream. The child is killed when the source is
// stopped or dropped.

use async_trait::async_trait;
use chrono::Local;
use motion_sentry::core_modules::frame_source::FrameSource;
use motion_sentry::error::CaptureError;
use motion_sentry::config::CameraConfig;
use motion_sentry::{Frame, PixelFormat};
use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};

/// Arguments for a capture process that writes raw RGB24 frames to stdout.
pub fn capture_args(camera: &CameraConfig) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-nostdin", "-loglevel", "error"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    if !camera.input_format.trim().is_empty() {
        args.extend(["-f".to_string(), camera.input_format.clone()]);
        args.extend(["-framerate".to_string(), format!("{}", camera.fps)]);
        args.extend([
            "-video_size".to_string(),
            format!("{}x{}", camera.width, camera.height),
        ]);
    }
    args.extend(["-i".to_string(), camera.device.clone()]);
    args.extend([
        "-vf".to_string(),
        format!("scale={}:{}", camera.width, camera.height),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "rgb24".to_string(),
        "pipe:1".to_string(),
    ]);
    args
}

pub struct FfmpegCapture {
    child: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
    frame_len: usize,
}

impl FfmpegCapture {
    pub fn spawn(binary: &Path, camera: &CameraConfig) -> Result<Self, CaptureError> {
        let args = capture_args(camera);
        tracing::debug!(binary = %binary.display(), args = %args.join(" "), "starting capture process");

        let mut child = Command::new(binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| CaptureError::Start(format!("{}: {err}", binary.display())))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Start("capture stdout was not piped".into()))?;

        tracing::info!(device = %camera.device, width = camera.width, height = camera.height, "capture started");
        Ok(Self {
            child,
            stdout,
            width: camera.width,
            height: camera.height,
            frame_len: PixelFormat::Rgb8.bytes_per_pixel() * camera.width as usize * camera.height as usize,
        })
    }
}

#[async_trait]
impl FrameSource for FfmpegCapture {
    async fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        let mut buffer = vec![0u8; self.frame_len];
        match self.stdout.read_exact(&mut buffer).await {
            Ok(_) => Ok(Some(Frame::new(
                Instant::now(),
                Local::now(),
                self.width,
                self.height,
                PixelFormat::Rgb8,
                buffer,
            ))),
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(err) => Err(CaptureError::Io(err)),
        }
    }

    async fn stop(&mut self) {
        if let Err(err) = self.child.kill().await {
            tracing::debug!(error = %err, "capture process already gone");
        }
        tracing::info!("capture stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_capture_names_format_rate_and_size() {
        let camera = CameraConfig {
            device: "/dev/video1".into(),
            width: 320,
            height: 240,
            fps: 15.0,
            ..CameraConfig::default()
        };
        let args = capture_args(&camera).join(" ");
        assert!(args.contains("-f v4l2 -framerate 15 -video_size 320x240 -i /dev/video1"));
        assert!(args.ends_with("-vf scale=320:240 -f rawvideo -pix_fmt rgb24 pipe:1"));
    }

    #[test]
    fn file_input_skips_device_options() {
        let camera = CameraConfig {
            device: "clip.mp4".into(),
            input_format: String::new(),
            ..CameraConfig::default()
        };
        let args = capture_args(&camera);
        assert!(!args.iter().any(|a| a == "-framerate"));
        assert_eq!(args.iter().position(|a| a == "-i").map(|i| args[i + 1].as_str()), Some("clip.mp4"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reads_whole_frames_until_end_of_stream() {
        // `head -c` stands in for ffmpeg: 2.5 frames of 2x2 RGB, then EOF.
        let mut child = Command::new("head")
            .args(["-c", "30", "/dev/zero"])
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let stdout = child.stdout.take().unwrap();
        let mut source = FfmpegCapture {
            child,
            stdout,
            width: 2,
            height: 2,
            frame_len: 12,
        };

        let first = source.next_frame().await.unwrap().unwrap();
        assert_eq!(first.payload.len(), 12);
        assert_eq!(first.pixel_format, PixelFormat::Rgb8);
        assert!(source.next_frame().await.unwrap().is_some());
        assert!(source.next_frame().await.unwrap().is_none());
        source.stop().await;
    }
}
