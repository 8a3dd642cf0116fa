//! Frame ingestion.
//!
//! A `SourceConnector` opens a `FrameSource` for a camera. The capture loop
//! owns the source for as long as the connection lives and drops it to release
//! the connection.
//!
//! Sources:
//! - `stub://` synthetic streams (demos, tests)
//! - RTSP over TCP via GStreamer (feature: rtsp-gstreamer)
//!
//! Every blocking call on a source is bounded by `ConnectOptions::io_timeout`
//! so that session cancellation is observed within one timeout.

use anyhow::Result;
use std::time::Duration;

use crate::frame::Frame;
use crate::CameraSource;

pub mod rtsp;
pub mod synthetic;
pub mod target;

pub use rtsp::RtspConnector;
pub use synthetic::SyntheticSource;
pub use target::StreamTarget;

/// Connection parameters shared by every source kind.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    /// Upper bound on any single open or read call.
    pub io_timeout: Duration,
    /// Nominal capture rate; used to pace synthetic sources.
    pub expected_fps: u32,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_secs(10),
            expected_fps: 15,
        }
    }
}

/// An open connection producing decoded frames in capture order.
pub trait FrameSource: Send {
    /// Read the next frame. An `Err` is a read failure; the caller decides
    /// whether to retry or reconnect.
    fn read_frame(&mut self) -> Result<Frame>;

    /// Redacted description for logs.
    fn describe(&self) -> String;
}

/// Opens connections to camera sources.
pub trait SourceConnector: Send + Sync {
    fn open(&self, source: &CameraSource, options: &ConnectOptions) -> Result<Box<dyn FrameSource>>;
}
