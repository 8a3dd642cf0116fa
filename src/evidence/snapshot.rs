use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use crate::frame::{write_jpeg, Frame};
use crate::BoundingBox;

const BOX_COLOR: Rgb<u8> = Rgb([255, 32, 32]);
const BOX_THICKNESS: u32 = 3;

/// Outline `bbox` on `image`, clipped to the image bounds.
pub fn draw_bounding_box(image: &mut RgbImage, bbox: &BoundingBox) {
    let (width, height) = image.dimensions();
    let x1 = bbox.x1.max(0.0).min(width as f32) as u32;
    let y1 = bbox.y1.max(0.0).min(height as f32) as u32;
    let x2 = bbox.x2.max(0.0).min(width as f32) as u32;
    let y2 = bbox.y2.max(0.0).min(height as f32) as u32;

    for inset in 0..BOX_THICKNESS {
        let w = x2.saturating_sub(x1).saturating_sub(inset * 2);
        let h = y2.saturating_sub(y1).saturating_sub(inset * 2);
        if w == 0 || h == 0 {
            break;
        }
        let rect = Rect::at((x1 + inset) as i32, (y1 + inset) as i32).of_size(w, h);
        draw_hollow_rect_mut(image, rect, BOX_COLOR);
    }
}

/// Write `frame` as a JPEG with `bbox` outlined.
pub fn write_snapshot(
    frame: &Frame,
    bbox: Option<&BoundingBox>,
    quality: u8,
    path: &Path,
) -> Result<()> {
    let file = File::create(path).with_context(|| format!("create snapshot {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    match bbox {
        Some(bbox) => {
            let mut image = frame.to_rgb_image()?;
            draw_bounding_box(&mut image, bbox);
            write_jpeg(&mut writer, image.as_raw(), image.width(), image.height(), quality)
        }
        None => frame.write_jpeg(&mut writer, quality),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_is_drawn_on_the_outline_only() {
        let mut image = RgbImage::new(20, 20);
        let bbox = BoundingBox {
            x1: 2.0,
            y1: 2.0,
            x2: 18.0,
            y2: 18.0,
        };
        draw_bounding_box(&mut image, &bbox);
        assert_eq!(*image.get_pixel(2, 10), BOX_COLOR);
        assert_eq!(*image.get_pixel(4, 4), BOX_COLOR);
        assert_eq!(*image.get_pixel(10, 10), Rgb([0, 0, 0]));
    }

    #[test]
    fn out_of_frame_boxes_are_clipped() {
        let mut image = RgbImage::new(10, 10);
        let bbox = BoundingBox {
            x1: -50.0,
            y1: 5.0,
            x2: 500.0,
            y2: 500.0,
        };
        draw_bounding_box(&mut image, &bbox);
        assert_eq!(*image.get_pixel(0, 5), BOX_COLOR);
    }

    #[test]
    fn snapshot_is_a_jpeg_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("snap.jpg");
        let frame = Frame::new(vec![90; 12 * 12 * 3], 12, 12, 7)?;
        write_snapshot(&frame, None, 70, &path)?;
        let bytes = std::fs::read(&path)?;
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        Ok(())
    }
}
