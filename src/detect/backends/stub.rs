use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::DetectionSignal;
use crate::frame::Frame;
use crate::BoundingBox;

/// Stub backend for demos and `stub://` sources.
///
/// Reports a positive signal whenever the frame content differs from the
/// previous frame, with a box covering the whole frame.
pub struct StubBackend {
    last_hash: Option<[u8; 32]>,
    confidence: f32,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            last_hash: None,
            confidence: 0.85,
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<DetectionSignal> {
        let current_hash: [u8; 32] = Sha256::digest(frame.pixels()).into();

        let changed = self.last_hash.is_some_and(|prev| prev != current_hash);

        self.last_hash = Some(current_hash);

        if changed {
            let bbox = BoundingBox {
                x1: 0.0,
                y1: 0.0,
                x2: frame.width as f32,
                y2: frame.height as f32,
            };
            Ok(DetectionSignal::positive(self.confidence, Some(bbox)))
        } else {
            Ok(DetectionSignal::negative())
        }
    }
}
