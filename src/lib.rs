//! Roadwatch - live stream ingestion and event capture engine.
//!
//! Roadwatch supervises many independent network camera sessions. Each session:
//! 1. Pulls frames from its camera over RTSP (TCP transport, bounded timeouts)
//! 2. Samples frames through an external detection capability
//! 3. Confirms detections with a consecutive-frame rule and a cooldown window
//! 4. Writes a pre-roll + post-roll evidence clip and hands it to persistence
//! 5. Publishes a time-gated live frame feed plus detection notifications
//!
//! Sessions share nothing but the detector provider and the publish channel.
//! The `StreamRegistry` owns the table of running sessions.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod config;
pub mod confirm;
pub mod credentials;
pub mod detect;
pub mod evidence;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod publish;
pub mod registry;
pub mod session;
pub mod storage;

pub use config::{EngineConfig, SessionTunables};
pub use confirm::{ConfirmationOutcome, ConfirmationPhase, ConfirmationState};
pub use detect::{DetectionSignal, DetectorBackend, DetectorHandle, DetectorProvider, StubBackend};
pub use evidence::{ClipEncoder, EvidenceRecorder, MjpegClipEncoder, RecorderSettings};
pub use frame::{Frame, FrameRing};
pub use ingest::{FrameSource, RtspConnector, SourceConnector};
pub use pipeline::FramePipeline;
pub use publish::{BroadcastHub, LiveFramePublisher, LiveMessage, MqttPublisher, Publisher};
pub use registry::{SourceStats, StreamRegistry};
pub use session::{CapturePhase, SessionDeps, SessionStats, StreamSession};
pub use storage::{InMemoryPersistence, Persistence, SqlitePersistence};

// -------------------- Identifiers --------------------

/// Identity of a camera source as assigned by the persistence layer.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SourceId(pub i64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SourceId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<i64>()
            .map(SourceId)
            .map_err(|_| anyhow!("invalid source id '{}'", s))
    }
}

/// Opaque identifier returned by persistence when an event is saved.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct EventId(pub i64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// -------------------- Camera Sources --------------------

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Network endpoint of a camera.
///
/// Credentials are never carried here in plaintext; `credential_ref` names where
/// they live (see `credentials::resolve`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
    pub path: String,
    pub credential_ref: Option<String>,
    /// Explicit stream URL. Takes precedence over address/port/path.
    pub url: Option<String>,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port,
            path: path.into(),
            credential_ref: None,
            url: None,
        }
    }

    /// Endpoint backed by an explicit URL (e.g. `stub://lobby`).
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            address: String::new(),
            port: 0,
            path: String::new(),
            credential_ref: None,
            url: Some(url.into()),
        }
    }

    pub fn with_credential_ref(mut self, reference: impl Into<String>) -> Self {
        self.credential_ref = Some(reference.into());
        self
    }
}

/// A camera as known to persistence. Immutable for the lifetime of a session.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CameraSource {
    pub id: SourceId,
    pub endpoint: Endpoint,
    pub location: GeoPoint,
}

// -------------------- Detection & Evidence --------------------

/// Axis-aligned box in frame pixel coordinates.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Image,
    Video,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Image => "image",
            ArtifactKind::Video => "video",
        }
    }
}

impl FromStr for ArtifactKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "image" => Ok(ArtifactKind::Image),
            "video" => Ok(ArtifactKind::Video),
            other => Err(anyhow!("unknown artifact kind '{}'", other)),
        }
    }
}

/// Event record handed to persistence when an event is confirmed.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct NewEvent {
    pub source_id: SourceId,
    pub file_path: String,
    pub location: GeoPoint,
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_id_parses_and_displays() {
        let id: SourceId = " 42 ".parse().unwrap();
        assert_eq!(id, SourceId(42));
        assert_eq!(id.to_string(), "42");
        assert!("camera".parse::<SourceId>().is_err());
    }

    #[test]
    fn bounding_box_extent_is_never_negative() {
        let bbox = BoundingBox {
            x1: 10.0,
            y1: 20.0,
            x2: 5.0,
            y2: 60.0,
        };
        assert_eq!(bbox.width(), 0.0);
        assert_eq!(bbox.height(), 40.0);
    }

    #[test]
    fn artifact_kind_round_trips_through_str() {
        assert_eq!("video".parse::<ArtifactKind>().unwrap(), ArtifactKind::Video);
        assert_eq!(ArtifactKind::Image.as_str(), "image");
        assert!("audio".parse::<ArtifactKind>().is_err());
    }
}
