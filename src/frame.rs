//! Decoded frames and the pre-roll ring buffer.
//!
//! - `Frame`: one decoded RGB24 image with its capture time and sequence number.
//! - `FrameRing`: fixed-capacity FIFO of the most recent (annotated) frames for one source.
//!
//! Frames are shared as `Arc<Frame>` so that snapshotting the ring for an evidence
//! clip never copies pixel data.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, RgbImage};
use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;

/// Hard cap on ring capacity regardless of configuration.
/// At 30 fps this is 60 seconds of pre-roll.
pub const MAX_RING_FRAMES: usize = 1800;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// Decoded frame in packed RGB24 layout.
#[derive(Clone, Debug)]
pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Per-source sequence number assigned at capture.
    pub sequence: u64,
    /// Wall-clock capture time.
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    /// Build a frame, rejecting empty or malformed pixel buffers.
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("frame has zero dimension {}x{}", width, height));
        }
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
            sequence,
            captured_at: Utc::now(),
        })
    }

    pub fn with_captured_at(mut self, captured_at: DateTime<Utc>) -> Self {
        self.captured_at = captured_at;
        self
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Copy into an `image` buffer for encoding or drawing.
    pub fn to_rgb_image(&self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", self.width, self.height))
    }

    /// Encode as a baseline JPEG into `writer`.
    pub fn write_jpeg<W: Write>(&self, writer: &mut W, quality: u8) -> Result<()> {
        write_jpeg(writer, &self.pixels, self.width, self.height, quality)
    }

    /// Build a frame from an `image` buffer, keeping sequence and capture time of `like`.
    pub fn from_rgb_image(image: RgbImage, like: &Frame) -> Self {
        let (width, height) = image.dimensions();
        Self {
            pixels: image.into_raw(),
            width,
            height,
            sequence: like.sequence,
            captured_at: like.captured_at,
        }
    }
}

/// Encode packed RGB24 pixels as JPEG. `quality` is clamped to 1..=100.
pub fn write_jpeg<W: Write>(
    writer: &mut W,
    pixels: &[u8],
    width: u32,
    height: u32,
    quality: u8,
) -> Result<()> {
    let mut encoder = JpegEncoder::new_with_quality(writer, quality.clamp(1, 100));
    encoder
        .encode(pixels, width, height, ExtendedColorType::Rgb8)
        .with_context(|| format!("encode {}x{} frame as jpeg", width, height))
}

pub fn jpeg_bytes(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_jpeg(&mut out, image.as_raw(), image.width(), image.height(), quality)?;
    Ok(out)
}

// ----------------------------------------------------------------------------
// FrameRing
// ----------------------------------------------------------------------------

/// Fixed-capacity rolling store of the most recent frames.
///
/// Insertion is O(1). Once full, each insert evicts the oldest frame. The ring
/// never grows past its capacity.
pub struct FrameRing {
    buffer: VecDeque<Arc<Frame>>,
    capacity: usize,
}

impl FrameRing {
    /// `capacity` is clamped to `MAX_RING_FRAMES`. A zero capacity ring holds nothing.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(MAX_RING_FRAMES);
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, frame: Arc<Frame>) {
        if self.capacity == 0 {
            return;
        }
        if self.buffer.len() == self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(frame);
    }

    /// Current contents, oldest first.
    pub fn snapshot(&self) -> Vec<Arc<Frame>> {
        self.buffer.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
