//! Per-frame processing for one session.
//!
//! For every captured frame, in capture order:
//! 1. every Nth frame goes to the detector; its signal feeds the confirmation state
//! 2. a recording in flight takes the frame as post-roll
//! 3. the (annotated) frame enters the ring buffer
//! 4. a confirmation starts a recording seeded with the ring's contents
//! 5. the frame is offered to the time-gated live feed
//!
//! Detector failures count as negative signals. Recording failures abort the
//! clip only.

use std::sync::Arc;
use std::time::Instant;

use crate::config::SessionTunables;
use crate::confirm::{progress_percent, ConfirmationOutcome, ConfirmationState};
use crate::detect::{DetectionSignal, DetectorHandle};
use crate::evidence::{EvidenceRecorder, FinishedClip, RecorderSettings, Trigger};
use crate::frame::{Frame, FrameRing};
use crate::publish::{
    ConfirmedDetection, LiveFramePublisher, LiveMessage, Publisher, RecordingFinished,
    TentativeDetection,
};
use crate::session::{SessionDeps, SessionStats};
use crate::{CameraSource, EventId, SourceId};

pub struct FramePipeline {
    source_id: SourceId,
    detector: DetectorHandle,
    confirmation: ConfirmationState,
    ring: FrameRing,
    recorder: EvidenceRecorder,
    live: LiveFramePublisher,
    publisher: Arc<dyn Publisher>,
    stats: Arc<SessionStats>,
    frame_skip: u64,
}

impl FramePipeline {
    pub fn new(
        source: &CameraSource,
        tunables: &SessionTunables,
        detector: DetectorHandle,
        deps: &SessionDeps,
        stats: Arc<SessionStats>,
    ) -> Self {
        let recorder = EvidenceRecorder::new(
            source.id,
            source.location,
            RecorderSettings::from_tunables(tunables),
            deps.encoder.clone(),
            deps.persistence.clone(),
        );
        Self {
            source_id: source.id,
            detector,
            confirmation: ConfirmationState::new(tunables.required_consecutive, tunables.cooldown),
            ring: FrameRing::new(tunables.pre_roll_frames()),
            recorder,
            live: LiveFramePublisher::from_tunables(source.id, deps.publisher.clone(), tunables),
            publisher: deps.publisher.clone(),
            stats,
            frame_skip: u64::from(tunables.frame_skip.max(1)),
        }
    }

    /// Process one captured frame observed at `now`.
    pub fn process(&mut self, frame: Frame, now: Instant) {
        let frame_count = self.stats.record_frame();

        let (frame, detection) = if frame_count % self.frame_skip == 0 {
            let (annotated, signal) = self.detect(frame);
            let outcome = self.confirmation.observe(signal.positive, now);
            self.stats.set_consecutive(self.confirmation.consecutive());
            (annotated, Some((signal, outcome)))
        } else {
            (Arc::new(frame), None)
        };

        if let Some(clip) = self.recorder.push(frame.clone()) {
            self.recording_finished(clip);
        }
        self.ring.push(frame.clone());

        if let Some((signal, outcome)) = detection {
            match outcome {
                ConfirmationOutcome::Reset => {}
                ConfirmationOutcome::Progress { count, required } => {
                    self.publisher
                        .publish(LiveMessage::Tentative(TentativeDetection {
                            source_id: self.source_id,
                            confidence: signal.confidence,
                            consecutive_count: count,
                            required_count: required,
                            progress_percent: progress_percent(count, required),
                            bounding_box: signal.bounding_box,
                            timestamp: frame.captured_at,
                        }));
                }
                ConfirmationOutcome::Confirmed { .. } => self.confirmed(&frame, &signal),
            }
        }

        self.stats.set_recording(self.recorder.is_recording());
        self.live
            .offer(&frame, self.recorder.is_recording(), frame_count, now);
    }

    /// Flush a recording still gathering post-roll. Called once on session exit.
    pub fn finish(&mut self) {
        if let Some(clip) = self.recorder.finish_partial() {
            self.recording_finished(clip);
        }
        self.stats.set_recording(false);
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_recording()
    }

    fn detect(&mut self, frame: Frame) -> (Arc<Frame>, DetectionSignal) {
        let mut signal = match self.detector.detect(&frame) {
            Ok(signal) => signal,
            Err(e) => {
                log::warn!(
                    "source {}: detector {} failed on frame {}: {:#}",
                    self.source_id,
                    self.detector.name(),
                    frame.sequence,
                    e
                );
                DetectionSignal::negative()
            }
        };
        if signal.positive {
            self.stats.record_detection();
        }

        let annotated = match signal.annotated.take() {
            Some(mut annotated) => {
                annotated.sequence = frame.sequence;
                annotated.captured_at = frame.captured_at;
                annotated
            }
            None => frame,
        };
        (Arc::new(annotated), signal)
    }

    fn confirmed(&mut self, frame: &Arc<Frame>, signal: &DetectionSignal) {
        self.stats.record_confirmation();
        log::info!(
            "source {}: event confirmed at frame {} (confidence {:.2})",
            self.source_id,
            frame.sequence,
            signal.confidence
        );

        let mut finished = None;
        let event_id = if self.recorder.is_recording() {
            log::warn!(
                "source {}: confirmation while a clip is still recording; no new clip",
                self.source_id
            );
            None
        } else {
            let trigger = Trigger {
                frame: frame.as_ref(),
                confidence: signal.confidence,
                bounding_box: signal.bounding_box,
            };
            match self.recorder.begin(trigger, self.ring.snapshot()) {
                Ok(started) => {
                    finished = started.finished;
                    started.event_id
                }
                Err(e) => {
                    log::error!("source {}: recording not started: {:#}", self.source_id, e);
                    None
                }
            }
        };

        self.publish_confirmed(frame, signal, event_id);
        if let Some(clip) = finished {
            self.recording_finished(clip);
        }
    }

    fn publish_confirmed(
        &self,
        frame: &Frame,
        signal: &DetectionSignal,
        event_id: Option<EventId>,
    ) {
        self.publisher
            .publish(LiveMessage::Confirmed(ConfirmedDetection {
                source_id: self.source_id,
                confidence: signal.confidence,
                bounding_box: signal.bounding_box,
                timestamp: frame.captured_at,
                event_id,
            }));
    }

    fn recording_finished(&self, clip: FinishedClip) {
        self.stats.record_clip();
        self.publisher
            .publish(LiveMessage::RecordingFinished(RecordingFinished {
                source_id: self.source_id,
                event_id: clip.event_id,
                clip_path: clip.path.to_string_lossy().into_owned(),
                frame_count: clip.frame_count,
                complete: clip.complete,
                timestamp: chrono::Utc::now(),
            }));
    }
}
