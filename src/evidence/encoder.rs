use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use super::avi::{write_mjpeg_avi, AviStream};
use crate::config::ClipFormat;
use crate::frame::Frame;

/// Writes a sequence of frames as one video file.
pub trait ClipEncoder: Send + Sync {
    /// File extension without the dot.
    fn extension(&self) -> &'static str;

    /// Encode `frames` in order at `fps` into `path`. The file is created or
    /// truncated. Frames are never empty.
    fn encode(&self, frames: &[Arc<Frame>], fps: u32, path: &Path) -> Result<()>;
}

/// Motion-JPEG in an AVI container. Every frame is a baseline JPEG and the
/// clip plays back at the `fps` it was encoded with.
#[derive(Clone, Debug)]
pub struct MjpegClipEncoder {
    quality: u8,
}

impl MjpegClipEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }
}

impl Default for MjpegClipEncoder {
    fn default() -> Self {
        Self::new(85)
    }
}

impl ClipEncoder for MjpegClipEncoder {
    fn extension(&self) -> &'static str {
        ClipFormat::Mjpeg.extension()
    }

    fn encode(&self, frames: &[Arc<Frame>], fps: u32, path: &Path) -> Result<()> {
        let first = frames
            .first()
            .ok_or_else(|| anyhow!("no frames to encode into {}", path.display()))?;
        let jpegs = frames
            .iter()
            .map(|frame| {
                let mut jpeg = Vec::new();
                frame.write_jpeg(&mut jpeg, self.quality)?;
                Ok(jpeg)
            })
            .collect::<Result<Vec<_>>>()?;
        let stream = AviStream {
            width: first.width,
            height: first.height,
            fps,
        };

        let file =
            File::create(path).with_context(|| format!("create clip {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        write_mjpeg_avi(&mut writer, stream, &jpegs)
            .with_context(|| format!("write clip {}", path.display()))?;
        writer
            .flush()
            .with_context(|| format!("flush clip {}", path.display()))?;
        Ok(())
    }
}

/// Encoder for a configured clip format.
pub fn encoder_for(format: ClipFormat, quality: u8) -> Result<Arc<dyn ClipEncoder>> {
    match format {
        ClipFormat::Mjpeg => Ok(Arc::new(MjpegClipEncoder::new(quality))),
        #[cfg(feature = "clip-ffmpeg")]
        ClipFormat::Mp4 => Ok(Arc::new(super::ffmpeg::Mp4ClipEncoder::new()?)),
        #[cfg(not(feature = "clip-ffmpeg"))]
        ClipFormat::Mp4 => anyhow::bail!("mp4 clips require the clip-ffmpeg feature"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames() -> Result<Vec<Arc<Frame>>> {
        (0..3u8)
            .map(|i| Frame::new(vec![i * 40; 16 * 16 * 3], 16, 16, i as u64).map(Arc::new))
            .collect()
    }

    fn u32_at(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn mjpeg_clip_holds_one_jpeg_per_frame() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("clip.avi");

        MjpegClipEncoder::default().encode(&frames()?, 15, &path)?;

        let bytes = std::fs::read(&path)?;
        assert_eq!(&bytes[0..4], b"RIFF");
        let starts = bytes.windows(2).filter(|w| w == &[0xFF, 0xD8]).count();
        assert_eq!(starts, 3);
        assert_eq!(u32_at(&bytes, 48), 3);
        assert_eq!((u32_at(&bytes, 64), u32_at(&bytes, 68)), (16, 16));
        Ok(())
    }

    #[test]
    fn clip_rate_follows_the_requested_fps() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let frames = frames()?;
        let slow = dir.path().join("slow.avi");
        let fast = dir.path().join("fast.avi");
        let encoder = MjpegClipEncoder::default();

        encoder.encode(&frames, 5, &slow)?;
        encoder.encode(&frames, 30, &fast)?;

        let (slow, fast) = (std::fs::read(slow)?, std::fs::read(fast)?);
        assert_ne!(slow, fast);
        // avih microseconds per frame, then strh rate over scale
        assert_eq!(u32_at(&slow, 32), 200_000);
        assert_eq!(u32_at(&fast, 32), 33_333);
        assert_eq!(u32_at(&slow, 132) / u32_at(&slow, 128), 5);
        assert_eq!(u32_at(&fast, 132) / u32_at(&fast, 128), 30);
        Ok(())
    }

    #[test]
    fn mjpeg_is_always_available() {
        let encoder = encoder_for(ClipFormat::Mjpeg, 70).unwrap();
        assert_eq!(encoder.extension(), "avi");
    }
}
