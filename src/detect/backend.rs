use anyhow::Result;

use crate::detect::result::DetectionSignal;
use crate::frame::Frame;

/// Detector backend trait.
///
/// A backend classifies one frame at a time and may be slow. Backends are not
/// assumed to be thread-safe: `detect` takes `&mut self`, and sharing one across
/// sessions goes through `DetectorProvider::Shared`, which serialises calls.
///
/// Errors and panics raised by `detect` never cross into the capture loop; the
/// caller converts them into a negative signal.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Classify a frame.
    fn detect(&mut self, frame: &Frame) -> Result<DetectionSignal>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
