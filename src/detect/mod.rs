//! Frame classification.
//!
//! The detector is an opaque capability: given a frame it reports whether the
//! target class is present. Sessions reach it through a `DetectorProvider`,
//! which decides whether all sessions share one instance or each gets its own.

use anyhow::{anyhow, Result};

mod backend;
mod backends;
mod provider;
mod result;

pub use backend::DetectorBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use provider::{DetectorFactory, DetectorHandle, DetectorProvider};
pub use result::DetectionSignal;

use crate::config::DetectorSettings;

/// Provider for the configured backend.
///
/// The stub backend compares each frame with the previous one, so it is always
/// instantiated per session.
pub fn provider_for(settings: &DetectorSettings) -> Result<DetectorProvider> {
    match settings.backend.as_str() {
        "stub" => Ok(DetectorProvider::per_session(|| {
            Ok(Box::new(StubBackend::new()) as Box<dyn DetectorBackend>)
        })),
        #[cfg(feature = "backend-tract")]
        "tract" => {
            let model_path = settings
                .model_path
                .clone()
                .ok_or_else(|| anyhow!("detector.model_path is required for the tract backend"))?;
            let size = settings.input_size;
            let threshold = settings.confidence_threshold;
            let target_index = settings.target_index;
            let build = move || -> Result<TractBackend> {
                Ok(TractBackend::new(&model_path, size, size)?
                    .with_threshold(threshold)
                    .with_target_index(target_index))
            };
            if settings.per_session {
                Ok(DetectorProvider::per_session(move || {
                    Ok(Box::new(build()?) as Box<dyn DetectorBackend>)
                }))
            } else {
                Ok(DetectorProvider::shared(build()?))
            }
        }
        #[cfg(not(feature = "backend-tract"))]
        "tract" => Err(anyhow!("the tract detector requires the backend-tract feature")),
        other => Err(anyhow!("unknown detector backend '{}'", other)),
    }
}
