mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{frame, AlwaysPositive, Harness, ScriptedConnector, ScriptedDetector, ScriptedSource};
use roadwatch::config::SessionTunables;
use roadwatch::publish::LiveMessage;
use roadwatch::storage::StoredArtifact;
use roadwatch::{
    ArtifactKind, CameraSource, DetectorBackend, DetectorProvider, Endpoint, FramePipeline,
    GeoPoint, SessionStats,
};

struct Scenario {
    harness: Harness,
    pipeline: FramePipeline,
    stats: Arc<SessionStats>,
    start: Instant,
    next: u64,
}

impl Scenario {
    fn new(detector: impl DetectorBackend + 'static, tune: impl FnOnce(&mut SessionTunables)) -> Self {
        let harness = Harness::new();
        let location = GeoPoint {
            latitude: 52.37,
            longitude: 4.89,
        };
        let id = harness
            .persistence
            .add_source(Endpoint::from_url("stub://road"), location);
        let source = CameraSource {
            id,
            endpoint: Endpoint::from_url("stub://road"),
            location,
        };

        let mut tunables = harness.tunables();
        tunables.expected_fps = 1;
        tunables.publish_interval = Duration::from_secs(3600);
        tune(&mut tunables);

        let connector = Arc::new(ScriptedConnector::new(0, || ScriptedSource::finite(0)));
        let deps = harness.deps(connector, DetectorProvider::shared(AlwaysPositive));
        let handle = DetectorProvider::shared(detector).handle().unwrap();
        let stats = Arc::new(SessionStats::default());
        let pipeline = FramePipeline::new(&source, &tunables, handle, &deps, stats.clone());

        Self {
            harness,
            pipeline,
            stats,
            start: Instant::now(),
            next: 1,
        }
    }

    /// Feed `count` frames, one second apart.
    fn feed(&mut self, count: u64) {
        for _ in 0..count {
            let at = self.start + Duration::from_secs(self.next);
            self.pipeline.process(frame(self.next), at);
            self.next += 1;
        }
    }

    fn messages(&self) -> Vec<LiveMessage> {
        self.harness.publisher.messages()
    }

    fn confirmed(&self) -> Vec<LiveMessage> {
        self.messages()
            .into_iter()
            .filter(|message| matches!(message, LiveMessage::Confirmed(_)))
            .collect()
    }

    fn artifacts_of(&self, kind: ArtifactKind) -> Vec<StoredArtifact> {
        self.harness
            .persistence
            .artifacts()
            .into_iter()
            .filter(|artifact| artifact.kind == kind)
            .collect()
    }
}

#[test]
fn interrupted_run_confirms_only_after_a_fresh_run() {
    let signals = [true, true, true, true, false, true, true, true, true, true];
    let mut scenario = Scenario::new(ScriptedDetector::new(&signals), |t| {
        t.required_consecutive = 5;
        t.cooldown = Duration::from_secs(10);
    });

    scenario.feed(9);
    assert!(scenario.confirmed().is_empty());
    assert_eq!(scenario.stats.consecutive_count(), 4);

    scenario.feed(1);
    let confirmed = scenario.confirmed();
    assert_eq!(confirmed.len(), 1);
    match &confirmed[0] {
        LiveMessage::Confirmed(c) => assert!(c.event_id.is_some()),
        other => panic!("unexpected message {:?}", other),
    }
    assert_eq!(scenario.stats.confirmed_events(), 1);
    assert_eq!(scenario.stats.total_detections(), 9);
    assert_eq!(scenario.stats.consecutive_count(), 0);
    assert_eq!(scenario.harness.persistence.events().len(), 1);
    assert!(scenario.pipeline.is_recording());
}

#[test]
fn a_long_positive_run_inside_cooldown_confirms_once() {
    let mut scenario = Scenario::new(ScriptedDetector::new(&[true; 10]), |t| {
        t.required_consecutive = 5;
        t.cooldown = Duration::from_secs(10);
    });

    scenario.feed(10);
    assert_eq!(scenario.confirmed().len(), 1);
    assert_eq!(scenario.stats.confirmed_events(), 1);
}

#[test]
fn tentative_progress_is_published_for_unconfirmed_positives() {
    let mut scenario = Scenario::new(ScriptedDetector::new(&[true, true, false, true]), |t| {
        t.required_consecutive = 4;
    });

    scenario.feed(4);
    let progress: Vec<(u32, u8)> = scenario
        .messages()
        .into_iter()
        .filter_map(|message| match message {
            LiveMessage::Tentative(t) => Some((t.consecutive_count, t.progress_percent)),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![(1, 25), (2, 50), (1, 25)]);
    assert!(scenario.confirmed().is_empty());
}

#[test]
fn clip_spans_pre_roll_trigger_and_post_roll() {
    let mut scenario = Scenario::new(
        ScriptedDetector::new(&[false, false, true, false, false]),
        |t| {
            t.required_consecutive = 1;
            t.pre_roll_secs = 3;
            t.post_roll_secs = 2;
        },
    );

    scenario.feed(4);
    assert!(scenario.pipeline.is_recording());
    assert!(scenario.harness.encoder.clips().is_empty());

    scenario.feed(1);
    assert!(!scenario.pipeline.is_recording());
    assert_eq!(scenario.harness.encoder.clips(), vec![vec![1, 2, 3, 4, 5]]);
    assert_eq!(scenario.stats.clips_written(), 1);

    let finished: Vec<_> = scenario
        .messages()
        .into_iter()
        .filter_map(|message| match message {
            LiveMessage::RecordingFinished(r) => Some(r),
            _ => None,
        })
        .collect();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].frame_count, 5);
    assert!(finished[0].complete);
    assert!(std::path::Path::new(&finished[0].clip_path).exists());

    let videos = scenario.artifacts_of(ArtifactKind::Video);
    assert_eq!(videos.len(), 1);
    assert_eq!(videos[0].path, finished[0].clip_path);
    assert_eq!(scenario.artifacts_of(ArtifactKind::Image).len(), 1);
}

#[test]
fn pre_roll_is_bounded_by_ring_capacity() {
    let mut signals = vec![false; 5];
    signals.push(true);
    let mut scenario = Scenario::new(ScriptedDetector::new(&signals), |t| {
        t.required_consecutive = 1;
        t.pre_roll_secs = 3;
        t.post_roll_secs = 2;
    });

    scenario.feed(8);
    assert_eq!(scenario.harness.encoder.clips(), vec![vec![4, 5, 6, 7, 8]]);
}

#[test]
fn detector_errors_count_as_negatives() {
    let script = vec![Some(true), Some(true), None, Some(true), Some(true), Some(true)];
    let mut scenario = Scenario::new(ScriptedDetector::with_errors(script), |t| {
        t.required_consecutive = 3;
    });

    scenario.feed(5);
    assert!(scenario.confirmed().is_empty());
    scenario.feed(1);
    assert_eq!(scenario.confirmed().len(), 1);
    assert_eq!(scenario.stats.total_detections(), 5);
    assert_eq!(scenario.stats.frame_count(), 6);
}

#[test]
fn only_every_nth_frame_is_sampled() {
    let mut scenario = Scenario::new(ScriptedDetector::new(&[true, true, true]), |t| {
        t.required_consecutive = 3;
        t.frame_skip = 2;
    });

    scenario.feed(5);
    assert!(scenario.confirmed().is_empty());
    scenario.feed(1);
    assert_eq!(scenario.confirmed().len(), 1);
    assert_eq!(scenario.stats.total_detections(), 3);
}

#[test]
fn confirmation_during_recording_adds_no_clip() {
    let mut scenario = Scenario::new(ScriptedDetector::new(&[true, false, true]), |t| {
        t.required_consecutive = 1;
        t.cooldown = Duration::ZERO;
        t.pre_roll_secs = 1;
        t.post_roll_secs = 5;
    });

    scenario.feed(3);
    let confirmed = scenario.confirmed();
    assert_eq!(confirmed.len(), 2);
    match &confirmed[1] {
        LiveMessage::Confirmed(c) => assert_eq!(c.event_id, None),
        other => panic!("unexpected message {:?}", other),
    }
    assert_eq!(scenario.stats.confirmed_events(), 2);
    assert_eq!(scenario.harness.persistence.events().len(), 1);

    scenario.feed(3);
    assert_eq!(scenario.harness.encoder.clips(), vec![vec![1, 2, 3, 4, 5, 6]]);
}

#[test]
fn stopping_mid_post_roll_writes_a_partial_clip() {
    let mut scenario = Scenario::new(ScriptedDetector::new(&[true]), |t| {
        t.required_consecutive = 1;
        t.pre_roll_secs = 2;
        t.post_roll_secs = 10;
    });

    scenario.feed(3);
    scenario.pipeline.finish();
    assert_eq!(scenario.harness.encoder.clips(), vec![vec![1, 2, 3]]);
    let partial = scenario.messages().into_iter().find_map(|message| match message {
        LiveMessage::RecordingFinished(r) => Some(r),
        _ => None,
    });
    assert!(!partial.unwrap().complete);
    assert!(!scenario.stats.is_recording());
}

#[test]
fn live_feed_is_time_gated() {
    let mut scenario = Scenario::new(ScriptedDetector::new(&[]), |t| {
        t.publish_interval = Duration::from_millis(2500);
    });

    scenario.feed(6);
    let published: Vec<u64> = scenario
        .messages()
        .into_iter()
        .filter_map(|message| match message {
            LiveMessage::Frame(f) => Some(f.frame_count),
            _ => None,
        })
        .collect();
    assert_eq!(published, vec![1, 4]);
}
