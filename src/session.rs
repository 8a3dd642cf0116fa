//! One camera's capture session.
//!
//! A `StreamSession` runs its capture loop on a dedicated thread. All per-source
//! state (connection, ring buffer, confirmation state, recorder) lives on that
//! thread. The outside world sees only the shutdown flag and `SessionStats`.
//!
//! Capture loop phases:
//! - Connecting: open the source; failures count towards `reconnect_max_attempts`
//! - Streaming: read frames; more than `max_read_failures` consecutive read
//!   failures drop the connection and go back to Connecting
//! - Reconnecting: cancellable backoff between attempts
//! - Terminated: attempts exhausted or shutdown requested

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::SessionTunables;
use crate::detect::DetectorProvider;
use crate::evidence::ClipEncoder;
use crate::ingest::{ConnectOptions, FrameSource, SourceConnector};
use crate::pipeline::FramePipeline;
use crate::publish::Publisher;
use crate::storage::Persistence;
use crate::CameraSource;

/// Longest uninterrupted sleep inside the capture loop.
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CapturePhase {
    /// Created, loop not started yet.
    Idle = 0,
    Connecting = 1,
    Streaming = 2,
    Reconnecting = 3,
    Terminated = 4,
}

impl CapturePhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CapturePhase::Connecting,
            2 => CapturePhase::Streaming,
            3 => CapturePhase::Reconnecting,
            4 => CapturePhase::Terminated,
            _ => CapturePhase::Idle,
        }
    }
}

// ----------------------------------------------------------------------------
// Stats
// ----------------------------------------------------------------------------

/// Counters written by the capture thread and read by anyone.
#[derive(Debug, Default)]
pub struct SessionStats {
    frame_count: AtomicU64,
    total_detections: AtomicU64,
    confirmed_events: AtomicU64,
    clips_written: AtomicU64,
    consecutive_count: AtomicU32,
    recording: AtomicBool,
    connections: AtomicU64,
    read_failures: AtomicU64,
    reconnect_attempts: AtomicU32,
    phase: AtomicU8,
}

impl SessionStats {
    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::Relaxed)
    }

    /// Positive detection signals seen.
    pub fn total_detections(&self) -> u64 {
        self.total_detections.load(Ordering::Relaxed)
    }

    pub fn confirmed_events(&self) -> u64 {
        self.confirmed_events.load(Ordering::Relaxed)
    }

    pub fn clips_written(&self) -> u64 {
        self.clips_written.load(Ordering::Relaxed)
    }

    pub fn consecutive_count(&self) -> u32 {
        self.consecutive_count.load(Ordering::Relaxed)
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Relaxed)
    }

    /// Successful connection opens.
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn read_failures(&self) -> u64 {
        self.read_failures.load(Ordering::Relaxed)
    }

    /// Failed opens since the last successful one.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    pub fn phase(&self) -> CapturePhase {
        CapturePhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub(crate) fn record_frame(&self) -> u64 {
        self.frame_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn record_detection(&self) {
        self.total_detections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_confirmation(&self) {
        self.confirmed_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_clip(&self) {
        self.clips_written.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_consecutive(&self, count: u32) {
        self.consecutive_count.store(count, Ordering::Relaxed);
    }

    pub(crate) fn set_recording(&self, recording: bool) {
        self.recording.store(recording, Ordering::Relaxed);
    }

    fn record_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        self.reconnect_attempts.store(0, Ordering::Relaxed);
    }

    fn record_read_failure(&self) {
        self.read_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn set_reconnect_attempts(&self, attempts: u32) {
        self.reconnect_attempts.store(attempts, Ordering::Relaxed);
    }

    fn set_phase(&self, phase: CapturePhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }
}

// ----------------------------------------------------------------------------
// Session
// ----------------------------------------------------------------------------

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionDeps {
    pub connector: Arc<dyn SourceConnector>,
    pub detector: DetectorProvider,
    pub encoder: Arc<dyn ClipEncoder>,
    pub persistence: Arc<dyn Persistence>,
    pub publisher: Arc<dyn Publisher>,
}

pub struct StreamSession {
    source: CameraSource,
    tunables: SessionTunables,
    deps: SessionDeps,
    stats: Arc<SessionStats>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl StreamSession {
    pub fn new(source: CameraSource, tunables: SessionTunables, deps: SessionDeps) -> Self {
        Self {
            source,
            tunables,
            deps,
            stats: Arc::new(SessionStats::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
            join: None,
        }
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        self.stats.clone()
    }

    /// Whether the capture loop is alive.
    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|join| !join.is_finished())
    }

    /// Launch the capture loop. Returns `Ok(false)` if it is already running.
    ///
    /// Errors mean the loop could not be launched (detector unavailable,
    /// thread spawn failure); nothing is left running.
    pub fn start(&mut self) -> Result<bool> {
        if self.is_running() {
            return Ok(false);
        }
        self.reap();

        let detector = self
            .deps
            .detector
            .handle()
            .with_context(|| format!("source {}: detector unavailable", self.source.id))?;
        let pipeline = FramePipeline::new(
            &self.source,
            &self.tunables,
            detector,
            &self.deps,
            self.stats.clone(),
        );

        self.shutdown.store(false, Ordering::SeqCst);
        self.stats.set_phase(CapturePhase::Connecting);
        let ctx = CaptureContext {
            source: self.source.clone(),
            connector: self.deps.connector.clone(),
            options: ConnectOptions {
                io_timeout: self.tunables.io_timeout,
                expected_fps: self.tunables.expected_fps,
            },
            max_attempts: self.tunables.reconnect_max_attempts.max(1),
            backoff: self.tunables.reconnect_backoff,
            max_read_failures: self.tunables.max_read_failures,
            read_failure_sleep: self.tunables.read_failure_sleep,
            stats: self.stats.clone(),
            shutdown: self.shutdown.clone(),
        };

        let join = std::thread::Builder::new()
            .name(format!("session-{}", self.source.id))
            .spawn(move || run_capture_loop(ctx, pipeline))
            .map_err(|e| {
                self.stats.set_phase(CapturePhase::Terminated);
                anyhow!("source {}: failed to spawn capture thread: {}", self.source.id, e)
            })?;
        self.join = Some(join);
        Ok(true)
    }

    /// Ask the loop to exit without waiting for it.
    pub fn request_stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Request shutdown and wait for the loop to exit.
    ///
    /// Returns `false` if the loop was not running. Idempotent.
    pub fn stop(&mut self) -> bool {
        let was_running = self.is_running();
        self.shutdown.store(true, Ordering::SeqCst);
        self.reap();
        was_running
    }

    fn reap(&mut self) {
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("source {}: capture thread panicked", self.source.id);
                self.stats.set_phase(CapturePhase::Terminated);
            }
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.stop();
    }
}

// ----------------------------------------------------------------------------
// Capture loop
// ----------------------------------------------------------------------------

struct CaptureContext {
    source: CameraSource,
    connector: Arc<dyn SourceConnector>,
    options: ConnectOptions,
    max_attempts: u32,
    backoff: Duration,
    max_read_failures: u32,
    read_failure_sleep: Duration,
    stats: Arc<SessionStats>,
    shutdown: Arc<AtomicBool>,
}

impl CaptureContext {
    fn cancelled(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

enum StreamEnd {
    Cancelled,
    Failed,
}

fn run_capture_loop(ctx: CaptureContext, mut pipeline: FramePipeline) {
    let id = ctx.source.id;
    let mut attempts = 0u32;

    while !ctx.cancelled() {
        ctx.stats.set_phase(CapturePhase::Connecting);
        match ctx.connector.open(&ctx.source, &ctx.options) {
            Ok(mut stream) => {
                attempts = 0;
                ctx.stats.record_connection();
                ctx.stats.set_phase(CapturePhase::Streaming);
                log::info!("source {}: streaming from {}", id, stream.describe());

                let end = stream_frames(&ctx, stream.as_mut(), &mut pipeline);
                let description = stream.describe();
                drop(stream);
                match end {
                    StreamEnd::Cancelled => break,
                    StreamEnd::Failed => {
                        log::warn!(
                            "source {}: more than {} consecutive read failures on {}; reconnecting",
                            id,
                            ctx.max_read_failures,
                            description
                        );
                        ctx.stats.set_phase(CapturePhase::Reconnecting);
                    }
                }
            }
            Err(e) => {
                attempts += 1;
                ctx.stats.set_reconnect_attempts(attempts);
                if attempts >= ctx.max_attempts {
                    log::error!(
                        "source {}: giving up after {} failed connection attempts: {:#}",
                        id,
                        attempts,
                        e
                    );
                    break;
                }
                log::warn!(
                    "source {}: connection attempt {}/{} failed: {:#}; retrying in {:?}",
                    id,
                    attempts,
                    ctx.max_attempts,
                    e,
                    ctx.backoff
                );
                ctx.stats.set_phase(CapturePhase::Reconnecting);
                if !sleep_unless_cancelled(ctx.backoff, &ctx.shutdown) {
                    break;
                }
            }
        }
    }

    pipeline.finish();
    ctx.stats.set_phase(CapturePhase::Terminated);
    log::info!("source {}: capture loop terminated", id);
}

fn stream_frames(
    ctx: &CaptureContext,
    stream: &mut dyn FrameSource,
    pipeline: &mut FramePipeline,
) -> StreamEnd {
    let mut consecutive_failures = 0u32;
    loop {
        if ctx.cancelled() {
            return StreamEnd::Cancelled;
        }
        match stream.read_frame() {
            Ok(frame) => {
                consecutive_failures = 0;
                pipeline.process(frame, Instant::now());
            }
            Err(e) => {
                consecutive_failures += 1;
                ctx.stats.record_read_failure();
                log::debug!(
                    "source {}: read failure {} : {:#}",
                    ctx.source.id,
                    consecutive_failures,
                    e
                );
                if consecutive_failures > ctx.max_read_failures {
                    return StreamEnd::Failed;
                }
                if !sleep_unless_cancelled(ctx.read_failure_sleep, &ctx.shutdown) {
                    return StreamEnd::Cancelled;
                }
            }
        }
    }
}

/// Sleep for `duration` in short slices. Returns `false` if shutdown was requested.
fn sleep_unless_cancelled(duration: Duration, shutdown: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(SHUTDOWN_POLL));
    }
}
