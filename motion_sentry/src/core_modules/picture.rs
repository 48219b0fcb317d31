// THEORY:
// Every event gets one still picture: the frame on which motion was confirmed,
// with the moving region outlined. It is the quick-look artifact a person checks
// before deciding whether the video is worth opening.
//
// Rendering and JPEG encoding are CPU-bound, so they run on the blocking pool.
// The detection loop only hands over a frame (a reference-counted clone) and moves on.

use chrono::{DateTime, Local};
use image::{ImageFormat, Rgb, RgbImage};
use std::path::{Path, PathBuf};

use crate::config::PictureConfig;
use crate::core_modules::blob::BoundingBox;
use crate::core_modules::frame::{Frame, PixelFormat};
use crate::error::PictureError;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_THICKNESS: u32 = 2;

/// `picture_event00042_20240101_120000_250.jpg`
pub fn picture_path(dir: &Path, event_id: u64, at: DateTime<Local>) -> PathBuf {
    dir.join(format!(
        "picture_event{:05}_{}.jpg",
        event_id,
        at.format("%Y%m%d_%H%M%S_%3f")
    ))
}

/// Converts the frame to RGB and outlines `region`, if any.
pub fn render_picture(frame: &Frame, region: Option<BoundingBox>) -> Result<RgbImage, PictureError> {
    frame.validate().map_err(|_| PictureError::InvalidFrame)?;

    let rgb: Vec<u8> = match frame.pixel_format {
        PixelFormat::Gray8 => frame.payload.iter().flat_map(|&v| [v, v, v]).collect(),
        PixelFormat::Rgb8 => frame.payload.to_vec(),
        PixelFormat::Rgba8 => frame
            .payload
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect(),
    };
    let mut image = RgbImage::from_raw(frame.width, frame.height, rgb).ok_or(PictureError::InvalidFrame)?;

    if let Some(region) = region {
        draw_box(&mut image, region);
    }
    Ok(image)
}

fn draw_box(image: &mut RgbImage, region: BoundingBox) {
    let (w, h) = image.dimensions();
    let x0 = region.min.x.min(w - 1);
    let y0 = region.min.y.min(h - 1);
    let x1 = region.max.x.min(w - 1);
    let y1 = region.max.y.min(h - 1);

    for t in 0..BOX_THICKNESS {
        for x in x0..=x1 {
            image.put_pixel(x, (y0 + t).min(y1), BOX_COLOR);
            image.put_pixel(x, y1.saturating_sub(t).max(y0), BOX_COLOR);
        }
        for y in y0..=y1 {
            image.put_pixel((x0 + t).min(x1), y, BOX_COLOR);
            image.put_pixel(x1.saturating_sub(t).max(x0), y, BOX_COLOR);
        }
    }
}

#[derive(Debug, Clone)]
pub struct PictureWriter {
    enabled: bool,
    dir: PathBuf,
}

impl PictureWriter {
    pub fn new(config: &PictureConfig) -> Self {
        Self {
            enabled: config.enabled,
            dir: config.dirpath.clone(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Renders and writes the picture on the blocking pool. Returns the written path.
    pub async fn save(
        &self,
        event_id: u64,
        frame: Frame,
        region: Option<BoundingBox>,
    ) -> Result<PathBuf, PictureError> {
        let path = picture_path(&self.dir, event_id, frame.captured_at);
        let target = path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), PictureError> {
            let image = render_picture(&frame, region)?;
            image.save_with_format(&target, ImageFormat::Jpeg)?;
            Ok(())
        })
        .await
        .map_err(|err| PictureError::Worker(err.to_string()))??;

        tracing::info!(event_id, path = %path.display(), "picture saved");
        Ok(path)
    }
}
