#![allow(dead_code)]

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use roadwatch::config::SessionTunables;
use roadwatch::ingest::ConnectOptions;
use roadwatch::{
    CameraSource, ClipEncoder, DetectionSignal, DetectorBackend, DetectorProvider, EngineConfig,
    Frame, FrameSource, InMemoryPersistence, LiveMessage, Publisher, SessionDeps, SourceConnector,
};

pub static ENV_LOCK: Mutex<()> = Mutex::new(());

/// 2x2 frame whose pixels all equal `sequence` (mod 256).
pub fn frame(sequence: u64) -> Frame {
    Frame::new(vec![sequence as u8; 12], 2, 2, sequence).unwrap()
}

// ----------------------------------------------------------------------------
// Capture
// ----------------------------------------------------------------------------

/// Produces `frames` frames, then fails every read.
pub struct ScriptedSource {
    next: u64,
    frames: Option<u64>,
    pace: Duration,
}

impl ScriptedSource {
    pub fn endless(pace: Duration) -> Self {
        Self {
            next: 1,
            frames: None,
            pace,
        }
    }

    pub fn finite(frames: u64) -> Self {
        Self {
            next: 1,
            frames: Some(frames),
            pace: Duration::from_millis(1),
        }
    }
}

impl FrameSource for ScriptedSource {
    fn read_frame(&mut self) -> Result<Frame> {
        std::thread::sleep(self.pace);
        if self.frames.is_some_and(|limit| self.next > limit) {
            return Err(anyhow!("stream ended"));
        }
        let frame = frame(self.next);
        self.next += 1;
        Ok(frame)
    }

    fn describe(&self) -> String {
        "scripted://test".to_string()
    }
}

type SourceFactory = Box<dyn Fn() -> ScriptedSource + Send + Sync>;

/// Fails the first `fail_opens` connection attempts, then opens sources from
/// `factory`.
pub struct ScriptedConnector {
    fail_opens: u32,
    attempts: AtomicU32,
    factory: SourceFactory,
}

impl ScriptedConnector {
    pub fn new<F>(fail_opens: u32, factory: F) -> Self
    where
        F: Fn() -> ScriptedSource + Send + Sync + 'static,
    {
        Self {
            fail_opens,
            attempts: AtomicU32::new(0),
            factory: Box::new(factory),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl SourceConnector for ScriptedConnector {
    fn open(&self, source: &CameraSource, _options: &ConnectOptions) -> Result<Box<dyn FrameSource>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_opens {
            return Err(anyhow!("source {} unreachable (attempt {})", source.id, attempt));
        }
        Ok(Box::new((self.factory)()))
    }
}

/// Tracks how many frame sources are open at once.
#[derive(Default)]
pub struct OpenGauge {
    open: AtomicU32,
    peak: AtomicU32,
}

impl OpenGauge {
    pub fn open(&self) -> u32 {
        self.open.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> u32 {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Source that holds a slot in its gauge until dropped.
pub struct GaugedSource {
    inner: ScriptedSource,
    gauge: Arc<OpenGauge>,
}

impl FrameSource for GaugedSource {
    fn read_frame(&mut self) -> Result<Frame> {
        self.inner.read_frame()
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}

impl Drop for GaugedSource {
    fn drop(&mut self) {
        self.gauge.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Opens endless sources whose reads take `pace`, counting live connections.
pub struct GaugedConnector {
    pub gauge: Arc<OpenGauge>,
    pace: Duration,
}

impl GaugedConnector {
    pub fn new(pace: Duration) -> Self {
        Self {
            gauge: Arc::new(OpenGauge::default()),
            pace,
        }
    }
}

impl SourceConnector for GaugedConnector {
    fn open(&self, _source: &CameraSource, _options: &ConnectOptions) -> Result<Box<dyn FrameSource>> {
        let now = self.gauge.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(now, Ordering::SeqCst);
        Ok(Box::new(GaugedSource {
            inner: ScriptedSource::endless(self.pace),
            gauge: self.gauge.clone(),
        }))
    }
}

// ----------------------------------------------------------------------------
// Detection
// ----------------------------------------------------------------------------

/// Replays a script of signals: `Some(true)` positive, `Some(false)` negative,
/// `None` a detector error. Negative once the script runs out.
pub struct ScriptedDetector {
    script: VecDeque<Option<bool>>,
}

impl ScriptedDetector {
    pub fn new(signals: &[bool]) -> Self {
        Self {
            script: signals.iter().map(|positive| Some(*positive)).collect(),
        }
    }

    pub fn with_errors(script: Vec<Option<bool>>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

impl DetectorBackend for ScriptedDetector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<DetectionSignal> {
        match self.script.pop_front() {
            Some(Some(true)) => Ok(DetectionSignal::positive(0.9, None)),
            Some(Some(false)) | None => Ok(DetectionSignal::negative()),
            Some(None) => Err(anyhow!("inference failed")),
        }
    }
}

pub struct AlwaysPositive;

impl DetectorBackend for AlwaysPositive {
    fn name(&self) -> &'static str {
        "always"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<DetectionSignal> {
        Ok(DetectionSignal::positive(0.8, None))
    }
}

pub fn never_positive() -> DetectorProvider {
    DetectorProvider::per_session(|| {
        Ok(Box::new(ScriptedDetector::new(&[])) as Box<dyn DetectorBackend>)
    })
}

/// Per-session detector whose construction takes `delay`, like a model load.
pub fn slow_to_build(delay: Duration) -> DetectorProvider {
    DetectorProvider::per_session(move || {
        std::thread::sleep(delay);
        Ok(Box::new(ScriptedDetector::new(&[])) as Box<dyn DetectorBackend>)
    })
}

// ----------------------------------------------------------------------------
// Evidence & publishing
// ----------------------------------------------------------------------------

/// Records the frame sequences of every clip and writes a marker file.
#[derive(Default)]
pub struct CapturingEncoder {
    clips: Mutex<Vec<Vec<u64>>>,
}

impl CapturingEncoder {
    pub fn clips(&self) -> Vec<Vec<u64>> {
        self.clips.lock().unwrap().clone()
    }
}

impl ClipEncoder for CapturingEncoder {
    fn extension(&self) -> &'static str {
        "clip"
    }

    fn encode(&self, frames: &[Arc<Frame>], _fps: u32, path: &Path) -> Result<()> {
        let sequences: Vec<u64> = frames.iter().map(|frame| frame.sequence).collect();
        std::fs::write(path, format!("{:?}", sequences))?;
        self.clips.lock().unwrap().push(sequences);
        Ok(())
    }
}

#[derive(Default)]
pub struct CollectingPublisher {
    messages: Mutex<Vec<LiveMessage>>,
}

impl CollectingPublisher {
    pub fn messages(&self) -> Vec<LiveMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.messages().iter().map(|message| message.kind()).collect()
    }
}

impl Publisher for CollectingPublisher {
    fn publish(&self, message: LiveMessage) {
        self.messages.lock().unwrap().push(message);
    }
}

// ----------------------------------------------------------------------------
// Wiring
// ----------------------------------------------------------------------------

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub persistence: Arc<InMemoryPersistence>,
    pub encoder: Arc<CapturingEncoder>,
    pub publisher: Arc<CollectingPublisher>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            persistence: Arc::new(InMemoryPersistence::new()),
            encoder: Arc::new(CapturingEncoder::default()),
            publisher: Arc::new(CollectingPublisher::default()),
        }
    }

    pub fn deps(
        &self,
        connector: Arc<dyn SourceConnector>,
        detector: DetectorProvider,
    ) -> SessionDeps {
        SessionDeps {
            connector,
            detector,
            encoder: self.encoder.clone(),
            persistence: self.persistence.clone(),
            publisher: self.publisher.clone(),
        }
    }

    /// Engine config with directories under the harness temp dir and fast
    /// retry timings.
    pub fn config(&self) -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.clips_dir = self.dir.path().join("clips");
        cfg.snapshots_dir = self.dir.path().join("snapshots");
        cfg.capture.reconnect_backoff = Duration::from_millis(10);
        cfg.capture.read_failure_sleep = Duration::from_millis(1);
        cfg.capture.max_read_failures = 2;
        cfg.capture.frame_skip = 1;
        cfg
    }

    pub fn tunables(&self) -> SessionTunables {
        SessionTunables::from_config(&self.config())
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
