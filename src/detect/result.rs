use crate::frame::Frame;
use crate::BoundingBox;

/// Per-frame output of a detector. Ephemeral; never persisted on its own.
#[derive(Clone, Debug, Default)]
pub struct DetectionSignal {
    /// Is the target class present?
    pub positive: bool,
    /// Confidence of the primary detection, in `[0, 1]`.
    pub confidence: f32,
    /// Box around the primary detection, if the backend localises.
    pub bounding_box: Option<BoundingBox>,
    /// Frame with detections drawn. `None` means the input frame is used as-is.
    pub annotated: Option<Frame>,
}

impl DetectionSignal {
    /// Signal used whenever detection could not run.
    pub fn negative() -> Self {
        Self::default()
    }

    pub fn positive(confidence: f32, bounding_box: Option<BoundingBox>) -> Self {
        Self {
            positive: true,
            confidence: confidence.clamp(0.0, 1.0),
            bounding_box,
            annotated: None,
        }
    }

    pub fn with_annotated(mut self, annotated: Frame) -> Self {
        self.annotated = Some(annotated);
        self
    }
}
