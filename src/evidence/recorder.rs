use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::encoder::ClipEncoder;
use super::snapshot::write_snapshot;
use crate::config::SessionTunables;
use crate::frame::Frame;
use crate::storage::Persistence;
use crate::{ArtifactKind, BoundingBox, EventId, GeoPoint, NewEvent, SourceId};

#[derive(Clone, Debug)]
pub struct RecorderSettings {
    pub clips_dir: PathBuf,
    pub snapshots_dir: PathBuf,
    /// Frames kept after the confirming frame.
    pub post_roll_frames: usize,
    /// Playback rate written into the clip.
    pub fps: u32,
    pub snapshot_quality: u8,
    /// Human name of the detected class, used in event descriptions.
    pub target_label: String,
}

impl RecorderSettings {
    pub fn from_tunables(tunables: &SessionTunables) -> Self {
        Self {
            clips_dir: tunables.clips_dir.clone(),
            snapshots_dir: tunables.snapshots_dir.clone(),
            post_roll_frames: tunables.post_roll_frames(),
            fps: tunables.expected_fps,
            snapshot_quality: tunables.jpeg_quality,
            target_label: tunables.target_label.clone(),
        }
    }
}

/// The detection that confirmed an event.
#[derive(Clone, Copy, Debug)]
pub struct Trigger<'a> {
    /// Annotated frame that completed the run.
    pub frame: &'a Frame,
    pub confidence: f32,
    pub bounding_box: Option<BoundingBox>,
}

/// A clip that was written to disk.
#[derive(Clone, Debug, PartialEq)]
pub struct FinishedClip {
    /// `None` when the event could not be persisted; the clip stays on disk.
    pub event_id: Option<EventId>,
    pub path: PathBuf,
    pub frame_count: usize,
    /// `false` when the session stopped before the post-roll quota was met.
    pub complete: bool,
}

/// Result of starting a recording.
#[derive(Debug)]
pub struct RecordingStarted {
    pub event_id: Option<EventId>,
    /// Set when there is no post-roll to wait for.
    pub finished: Option<FinishedClip>,
}

struct ActiveRecording {
    event_id: Option<EventId>,
    event: NewEvent,
    clip_path: PathBuf,
    frames: Vec<Arc<Frame>>,
    post_roll_remaining: usize,
}

/// Per-source evidence recorder. At most one recording is in flight.
pub struct EvidenceRecorder {
    source_id: SourceId,
    location: GeoPoint,
    settings: RecorderSettings,
    encoder: Arc<dyn ClipEncoder>,
    persistence: Arc<dyn Persistence>,
    active: Option<ActiveRecording>,
}

impl EvidenceRecorder {
    pub fn new(
        source_id: SourceId,
        location: GeoPoint,
        settings: RecorderSettings,
        encoder: Arc<dyn ClipEncoder>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        Self {
            source_id,
            location,
            settings,
            encoder,
            persistence,
            active: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// Start recording with `pre_roll` (oldest first) as the head of the clip.
    ///
    /// The event is persisted and the snapshot written here, so the returned
    /// event id can go out with the confirmation. Persisting is retried when
    /// the clip is finalised if it fails now.
    pub fn begin(&mut self, trigger: Trigger<'_>, pre_roll: Vec<Arc<Frame>>) -> Result<RecordingStarted> {
        if self.active.is_some() {
            return Err(anyhow!("source {}: a recording is already in flight", self.source_id));
        }
        std::fs::create_dir_all(&self.settings.clips_dir).with_context(|| {
            format!("create clips directory {}", self.settings.clips_dir.display())
        })?;

        let at = trigger.frame.captured_at;
        let clip_path = self
            .settings
            .clips_dir
            .join(clip_file_name(self.source_id, at, self.encoder.extension()));
        let event = NewEvent {
            source_id: self.source_id,
            file_path: clip_path.to_string_lossy().into_owned(),
            location: self.location,
            description: format!(
                "Confirmed {} on camera {} at {} (confidence {:.0}%)",
                self.settings.target_label,
                self.source_id,
                at.format("%Y-%m-%d %H:%M:%S UTC"),
                trigger.confidence * 100.0
            ),
        };
        let event_id = self.save_event(&event);
        self.save_snapshot(&trigger, &clip_path, event_id);

        log::info!(
            "source {}: recording {} ({} pre-roll, {} post-roll frames)",
            self.source_id,
            clip_path.display(),
            pre_roll.len(),
            self.settings.post_roll_frames
        );

        let mut frames = pre_roll;
        frames.reserve(self.settings.post_roll_frames);
        self.active = Some(ActiveRecording {
            event_id,
            event,
            clip_path,
            frames,
            post_roll_remaining: self.settings.post_roll_frames,
        });

        let finished = if self.settings.post_roll_frames == 0 {
            self.finish(true)
        } else {
            None
        };
        Ok(RecordingStarted { event_id, finished })
    }

    /// Offer a captured frame as post-roll. Returns the clip once the quota is met.
    pub fn push(&mut self, frame: Arc<Frame>) -> Option<FinishedClip> {
        let recording = self.active.as_mut()?;
        recording.frames.push(frame);
        recording.post_roll_remaining = recording.post_roll_remaining.saturating_sub(1);
        if recording.post_roll_remaining == 0 {
            self.finish(true)
        } else {
            None
        }
    }

    /// Write whatever has been gathered so far. Used when the session stops.
    pub fn finish_partial(&mut self) -> Option<FinishedClip> {
        let complete = self
            .active
            .as_ref()
            .is_some_and(|recording| recording.post_roll_remaining == 0);
        self.finish(complete)
    }

    fn finish(&mut self, complete: bool) -> Option<FinishedClip> {
        let recording = self.active.take()?;
        if let Err(e) = self.write_clip(&recording) {
            self.abort(&recording, &e);
            return None;
        }

        let event_id = recording
            .event_id
            .or_else(|| self.save_event(&recording.event));
        let path_str = recording.clip_path.to_string_lossy();
        match event_id {
            Some(id) => {
                if let Err(e) =
                    self.persistence
                        .save_evidence_artifact(id, ArtifactKind::Video, &path_str)
                {
                    log::error!("source {}: failed to attach clip to event {}: {:#}", self.source_id, id, e);
                }
            }
            None => log::error!(
                "source {}: clip {} written but no event could be saved",
                self.source_id,
                path_str
            ),
        }

        log::info!(
            "source {}: clip {} written ({} frames{})",
            self.source_id,
            recording.clip_path.display(),
            recording.frames.len(),
            if complete { "" } else { ", partial" }
        );
        Some(FinishedClip {
            event_id,
            frame_count: recording.frames.len(),
            path: recording.clip_path,
            complete,
        })
    }

    fn write_clip(&self, recording: &ActiveRecording) -> Result<()> {
        if recording.frames.is_empty() {
            return Err(anyhow!("no frames were captured"));
        }
        let part = part_path(&recording.clip_path);
        if let Err(e) = self
            .encoder
            .encode(&recording.frames, self.settings.fps, &part)
        {
            let _ = std::fs::remove_file(&part);
            return Err(e);
        }
        std::fs::rename(&part, &recording.clip_path)
            .with_context(|| format!("move {} into place", part.display()))
    }

    /// The event row already points at the clip path; mark it so the row
    /// does not reference a file that was never written.
    fn abort(&self, recording: &ActiveRecording, error: &anyhow::Error) {
        let Some(id) = recording.event_id else {
            log::error!(
                "source {}: clip {} aborted (no event saved): {:#}",
                self.source_id,
                recording.clip_path.display(),
                error
            );
            return;
        };
        log::error!(
            "source {}: clip {} for event {} aborted: {:#}",
            self.source_id,
            recording.clip_path.display(),
            id,
            error
        );
        if let Err(e) = self.persistence.mark_clip_failed(id, &format!("{:#}", error)) {
            log::error!("source {}: failed to mark event {} clipless: {:#}", self.source_id, id, e);
        }
    }

    fn save_event(&self, event: &NewEvent) -> Option<EventId> {
        match self.persistence.save_event(event) {
            Ok(id) => Some(id),
            Err(e) => {
                log::warn!("source {}: failed to save event: {:#}", self.source_id, e);
                None
            }
        }
    }

    fn save_snapshot(&self, trigger: &Trigger<'_>, clip_path: &Path, event_id: Option<EventId>) {
        let stem = clip_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.source_id.to_string());
        let path = self.settings.snapshots_dir.join(format!("{}.jpg", stem));

        let written = std::fs::create_dir_all(&self.settings.snapshots_dir)
            .with_context(|| format!("create snapshots directory {}", self.settings.snapshots_dir.display()))
            .and_then(|_| {
                write_snapshot(
                    trigger.frame,
                    trigger.bounding_box.as_ref(),
                    self.settings.snapshot_quality,
                    &path,
                )
            });
        if let Err(e) = written {
            log::warn!("source {}: snapshot not written: {:#}", self.source_id, e);
            return;
        }
        if let Some(id) = event_id {
            if let Err(e) = self.persistence.save_evidence_artifact(
                id,
                ArtifactKind::Image,
                &path.to_string_lossy(),
            ) {
                log::warn!("source {}: failed to attach snapshot: {:#}", self.source_id, e);
            }
        }
    }
}

/// `<sourceId>_<UTC timestamp>.<ext>`, e.g. `7_20240301T081502.250Z.avi`.
pub fn clip_file_name(source_id: SourceId, at: DateTime<Utc>, extension: &str) -> String {
    format!("{}_{}.{}", source_id, at.format("%Y%m%dT%H%M%S%.3fZ"), extension)
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}
