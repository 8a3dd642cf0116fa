use anyhow::Result;
use image::imageops::{self, FilterType};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{FrameUpdate, LiveMessage, Publisher};
use crate::config::SessionTunables;
use crate::frame::{jpeg_bytes, Frame};
use crate::SourceId;

/// Time-gated live frame feed for one source.
///
/// At most one frame is published per `min_interval` regardless of capture
/// rate. Frames wider than `max_width` are downscaled before JPEG encoding.
pub struct LiveFramePublisher {
    source_id: SourceId,
    publisher: Arc<dyn Publisher>,
    min_interval: Duration,
    max_width: u32,
    quality: u8,
    last_published_at: Option<Instant>,
}

impl LiveFramePublisher {
    pub fn new(
        source_id: SourceId,
        publisher: Arc<dyn Publisher>,
        min_interval: Duration,
        max_width: u32,
        quality: u8,
    ) -> Self {
        Self {
            source_id,
            publisher,
            min_interval,
            max_width,
            quality,
            last_published_at: None,
        }
    }

    pub fn from_tunables(
        source_id: SourceId,
        publisher: Arc<dyn Publisher>,
        tunables: &SessionTunables,
    ) -> Self {
        Self::new(
            source_id,
            publisher,
            tunables.publish_interval,
            tunables.publish_max_width,
            tunables.jpeg_quality,
        )
    }

    /// Publish `frame` if the gate is open at `now`. Returns whether it was sent.
    pub fn offer(&mut self, frame: &Frame, recording: bool, frame_count: u64, now: Instant) -> bool {
        if let Some(last) = self.last_published_at {
            if now.saturating_duration_since(last) < self.min_interval {
                return false;
            }
        }
        // An encode failure still closes the gate until the next interval.
        self.last_published_at = Some(now);

        match self.encode(frame) {
            Ok((jpeg, width, height)) => {
                self.publisher.publish(LiveMessage::Frame(FrameUpdate {
                    source_id: self.source_id,
                    encoded_frame: Arc::new(jpeg),
                    width,
                    height,
                    recording,
                    timestamp: frame.captured_at,
                    frame_count,
                }));
                true
            }
            Err(e) => {
                log::debug!("source {}: live frame not encoded: {:#}", self.source_id, e);
                false
            }
        }
    }

    fn encode(&self, frame: &Frame) -> Result<(Vec<u8>, u32, u32)> {
        let mut image = frame.to_rgb_image()?;
        if self.max_width > 0 && image.width() > self.max_width {
            let height = ((image.height() as u64 * self.max_width as u64) / image.width() as u64)
                .max(1) as u32;
            image = imageops::resize(&image, self.max_width, height, FilterType::Triangle);
        }
        let jpeg = jpeg_bytes(&image, self.quality)?;
        Ok((jpeg, image.width(), image.height()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::BroadcastHub;

    fn frame(width: u32, height: u32) -> Frame {
        Frame::new(vec![128; (width * height * 3) as usize], width, height, 1).unwrap()
    }

    #[test]
    fn publishes_at_most_once_per_interval() {
        let hub = Arc::new(BroadcastHub::default());
        let rx = hub.subscribe(None);
        let mut live =
            LiveFramePublisher::new(SourceId(1), hub.clone(), Duration::from_millis(100), 0, 70);

        let start = Instant::now();
        let sent: Vec<bool> = [0u64, 30, 60, 100, 150, 210]
            .iter()
            .map(|ms| live.offer(&frame(4, 4), false, *ms, start + Duration::from_millis(*ms)))
            .collect();
        assert_eq!(sent, vec![true, false, false, true, false, true]);
        assert_eq!(rx.try_iter().count(), 3);
    }

    #[test]
    fn wide_frames_are_downscaled() {
        let hub = Arc::new(BroadcastHub::default());
        let rx = hub.subscribe(None);
        let mut live = LiveFramePublisher::new(SourceId(9), hub.clone(), Duration::ZERO, 32, 70);

        assert!(live.offer(&frame(64, 48), true, 5, Instant::now()));
        match rx.try_recv().unwrap() {
            LiveMessage::Frame(update) => {
                assert_eq!((update.width, update.height), (32, 24));
                assert!(update.recording);
                assert_eq!(update.frame_count, 5);
                assert_eq!(&update.encoded_frame[..2], &[0xFF, 0xD8]);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
}
