//! Live notifications.
//!
//! Each session emits a time-gated frame feed plus detection notifications.
//! Publishing is best-effort: a `Publisher` must return without waiting on
//! any subscriber, and drops messages rather than apply back-pressure to the
//! capture loop.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::sync::Arc;

use crate::{BoundingBox, EventId, SourceId};

pub mod hub;
pub mod live;
pub mod mqtt;

pub use hub::BroadcastHub;
pub use live::LiveFramePublisher;
pub use mqtt::MqttPublisher;

/// Fire-and-forget sink for live messages.
pub trait Publisher: Send + Sync {
    /// Must not block on subscribers.
    fn publish(&self, message: LiveMessage);
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullPublisher;

impl Publisher for NullPublisher {
    fn publish(&self, _message: LiveMessage) {}
}

/// Forwards every message to each inner publisher.
#[derive(Clone, Default)]
pub struct FanOut {
    publishers: Vec<Arc<dyn Publisher>>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publishers.push(publisher);
        self
    }

    pub fn len(&self) -> usize {
        self.publishers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }
}

impl Publisher for FanOut {
    fn publish(&self, message: LiveMessage) {
        if let Some((last, rest)) = self.publishers.split_last() {
            for publisher in rest {
                publisher.publish(message.clone());
            }
            last.publish(message);
        }
    }
}

// -------------------- Messages --------------------

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveMessage {
    Frame(FrameUpdate),
    Tentative(TentativeDetection),
    Confirmed(ConfirmedDetection),
    RecordingFinished(RecordingFinished),
}

impl LiveMessage {
    pub fn source_id(&self) -> SourceId {
        match self {
            LiveMessage::Frame(m) => m.source_id,
            LiveMessage::Tentative(m) => m.source_id,
            LiveMessage::Confirmed(m) => m.source_id,
            LiveMessage::RecordingFinished(m) => m.source_id,
        }
    }

    /// Short name, used as the last topic segment by transports.
    pub fn kind(&self) -> &'static str {
        match self {
            LiveMessage::Frame(_) => "frame",
            LiveMessage::Tentative(_) => "tentative",
            LiveMessage::Confirmed(_) => "confirmed",
            LiveMessage::RecordingFinished(_) => "recording",
        }
    }
}

/// One published frame of the live feed.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct FrameUpdate {
    pub source_id: SourceId,
    /// JPEG bytes; base64 on the wire.
    #[serde(serialize_with = "as_base64")]
    pub encoded_frame: Arc<Vec<u8>>,
    pub width: u32,
    pub height: u32,
    pub recording: bool,
    pub timestamp: DateTime<Utc>,
    pub frame_count: u64,
}

/// Positive detection that has not (yet) confirmed. Not authoritative.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct TentativeDetection {
    pub source_id: SourceId,
    pub confidence: f32,
    pub consecutive_count: u32,
    pub required_count: u32,
    pub progress_percent: u8,
    pub bounding_box: Option<BoundingBox>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ConfirmedDetection {
    pub source_id: SourceId,
    pub confidence: f32,
    pub bounding_box: Option<BoundingBox>,
    pub timestamp: DateTime<Utc>,
    /// `None` when the event could not be persisted at confirmation time.
    pub event_id: Option<EventId>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct RecordingFinished {
    pub source_id: SourceId,
    pub event_id: Option<EventId>,
    pub clip_path: String,
    pub frame_count: usize,
    pub complete: bool,
    pub timestamp: DateTime<Utc>,
}

fn as_base64<S: Serializer>(bytes: &Arc<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64.encode(bytes.as_slice()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collecting(Mutex<Vec<LiveMessage>>);

    impl Publisher for Collecting {
        fn publish(&self, message: LiveMessage) {
            self.0.lock().unwrap().push(message);
        }
    }

    fn confirmed() -> LiveMessage {
        LiveMessage::Confirmed(ConfirmedDetection {
            source_id: SourceId(4),
            confidence: 0.75,
            bounding_box: None,
            timestamp: Utc::now(),
            event_id: Some(EventId(11)),
        })
    }

    #[test]
    fn messages_serialize_with_type_tag() {
        let json = serde_json::to_value(confirmed()).unwrap();
        assert_eq!(json["type"], "confirmed");
        assert_eq!(json["source_id"], 4);
        assert_eq!(json["event_id"], 11);
    }

    #[test]
    fn frame_bytes_are_base64_encoded() {
        let message = LiveMessage::Frame(FrameUpdate {
            source_id: SourceId(1),
            encoded_frame: Arc::new(vec![0xFF, 0xD8, 0xFF]),
            width: 1,
            height: 1,
            recording: true,
            timestamp: Utc::now(),
            frame_count: 9,
        });
        assert_eq!(message.kind(), "frame");
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["encoded_frame"], "/9j/");
        assert_eq!(json["recording"], true);
    }

    #[test]
    fn fan_out_reaches_every_publisher() {
        let a = Arc::new(Collecting::default());
        let b = Arc::new(Collecting::default());
        let fan = FanOut::new().with(a.clone()).with(b.clone());
        fan.publish(confirmed());
        assert_eq!(a.0.lock().unwrap().len(), 1);
        assert_eq!(b.0.lock().unwrap().len(), 1);
    }
}
