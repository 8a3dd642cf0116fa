use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Result};

use super::backend::DetectorBackend;
use super::result::DetectionSignal;
use crate::frame::Frame;

/// Builds one detector instance per session.
pub type DetectorFactory = Arc<dyn Fn() -> Result<Box<dyn DetectorBackend>> + Send + Sync>;

/// How sessions obtain a detector.
///
/// - `Shared`: one instance behind a `Mutex`. Every invocation from every
///   session is serialised, so detector throughput bounds the whole engine.
/// - `PerSession`: a factory called once per session start, for backends whose
///   model supports concurrent instantiation.
///
/// Which one to use is a deployment choice; the capture path is identical.
#[derive(Clone)]
pub enum DetectorProvider {
    Shared(Arc<Mutex<dyn DetectorBackend>>),
    PerSession(DetectorFactory),
}

impl DetectorProvider {
    pub fn shared<B: DetectorBackend + 'static>(backend: B) -> Self {
        Self::Shared(Arc::new(Mutex::new(backend)))
    }

    pub fn per_session<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn DetectorBackend>> + Send + Sync + 'static,
    {
        Self::PerSession(Arc::new(factory))
    }

    /// Detector handle for a new session.
    pub fn handle(&self) -> Result<DetectorHandle> {
        match self {
            DetectorProvider::Shared(backend) => Ok(DetectorHandle::Shared(backend.clone())),
            DetectorProvider::PerSession(factory) => {
                let mut backend = factory()?;
                backend.warm_up()?;
                Ok(DetectorHandle::Owned(backend))
            }
        }
    }
}

/// A session's access to its detector.
pub enum DetectorHandle {
    Shared(Arc<Mutex<dyn DetectorBackend>>),
    Owned(Box<dyn DetectorBackend>),
}

impl DetectorHandle {
    pub fn name(&self) -> &'static str {
        match self {
            DetectorHandle::Shared(backend) => backend
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .name(),
            DetectorHandle::Owned(backend) => backend.name(),
        }
    }

    /// Run detection. Backend errors and panics both come back as `Err`.
    ///
    /// A poisoned shared lock is recovered: the backend is stateless from the
    /// engine's point of view and one failed call must not disable every session.
    pub fn detect(&mut self, frame: &Frame) -> Result<DetectionSignal> {
        let outcome = match self {
            DetectorHandle::Shared(backend) => {
                let mut guard = backend.lock().unwrap_or_else(PoisonError::into_inner);
                catch_unwind(AssertUnwindSafe(|| guard.detect(frame)))
            }
            DetectorHandle::Owned(backend) => catch_unwind(AssertUnwindSafe(|| backend.detect(frame))),
        };
        outcome.unwrap_or_else(|_| Err(anyhow!("detector panicked")))
    }
}
