mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{never_positive, wait_until, Harness, ScriptedConnector, ScriptedSource};
use roadwatch::{CameraSource, CapturePhase, Endpoint, GeoPoint, StreamSession};

const WAIT: Duration = Duration::from_secs(5);

fn camera(harness: &Harness) -> CameraSource {
    let endpoint = Endpoint::new("10.1.2.3", 554, "/stream1");
    let id = harness
        .persistence
        .add_source(endpoint.clone(), GeoPoint::default());
    CameraSource {
        id,
        endpoint,
        location: GeoPoint::default(),
    }
}

#[test]
fn transient_connect_failures_recover_within_attempt_budget() {
    let harness = Harness::new();
    let connector = Arc::new(ScriptedConnector::new(3, || {
        ScriptedSource::endless(Duration::from_millis(5))
    }));
    let mut tunables = harness.tunables();
    tunables.reconnect_max_attempts = 5;

    let mut session = StreamSession::new(
        camera(&harness),
        tunables,
        harness.deps(connector.clone(), never_positive()),
    );
    assert!(session.start().unwrap());
    let stats = session.stats();

    assert!(wait_until(WAIT, || stats.phase() == CapturePhase::Streaming));
    assert!(wait_until(WAIT, || stats.frame_count() > 3));
    assert_eq!(connector.attempts(), 4);
    assert_eq!(stats.connections(), 1);
    assert_eq!(stats.reconnect_attempts(), 0);

    assert!(session.stop());
    assert_eq!(stats.phase(), CapturePhase::Terminated);
    assert!(!session.is_running());
}

#[test]
fn exhausted_attempts_terminate_the_session() {
    let harness = Harness::new();
    let connector = Arc::new(ScriptedConnector::new(u32::MAX, || {
        ScriptedSource::endless(Duration::from_millis(5))
    }));
    let mut tunables = harness.tunables();
    tunables.reconnect_max_attempts = 2;

    let mut session = StreamSession::new(
        camera(&harness),
        tunables,
        harness.deps(connector.clone(), never_positive()),
    );
    assert!(session.start().unwrap());
    let stats = session.stats();

    assert!(wait_until(WAIT, || !session.is_running()));
    assert_eq!(stats.phase(), CapturePhase::Terminated);
    assert_eq!(connector.attempts(), 2);
    assert_eq!(stats.connections(), 0);
    assert_eq!(stats.frame_count(), 0);
    assert!(!session.stop());
}

#[test]
fn persistent_read_failures_force_a_reconnect() {
    let harness = Harness::new();
    let connector = Arc::new(ScriptedConnector::new(0, || ScriptedSource::finite(3)));

    let mut session = StreamSession::new(
        camera(&harness),
        harness.tunables(),
        harness.deps(connector.clone(), never_positive()),
    );
    assert!(session.start().unwrap());
    let stats = session.stats();

    assert!(wait_until(WAIT, || stats.connections() >= 3));
    assert!(stats.read_failures() >= 6);
    assert!(stats.frame_count() >= 6);
    session.stop();
    assert_eq!(stats.phase(), CapturePhase::Terminated);
}

#[test]
fn stop_interrupts_backoff_promptly() {
    let harness = Harness::new();
    let connector = Arc::new(ScriptedConnector::new(u32::MAX, || {
        ScriptedSource::endless(Duration::from_millis(5))
    }));
    let mut tunables = harness.tunables();
    tunables.reconnect_max_attempts = 100;
    tunables.reconnect_backoff = Duration::from_secs(60);

    let mut session = StreamSession::new(
        camera(&harness),
        tunables,
        harness.deps(connector.clone(), never_positive()),
    );
    assert!(session.start().unwrap());
    let stats = session.stats();
    assert!(wait_until(WAIT, || stats.phase() == CapturePhase::Reconnecting));

    let started = std::time::Instant::now();
    assert!(session.stop());
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(stats.phase(), CapturePhase::Terminated);
}

#[test]
fn start_is_idempotent_while_running() {
    let harness = Harness::new();
    let connector = Arc::new(ScriptedConnector::new(0, || {
        ScriptedSource::endless(Duration::from_millis(5))
    }));
    let mut session = StreamSession::new(
        camera(&harness),
        harness.tunables(),
        harness.deps(connector, never_positive()),
    );
    assert!(session.start().unwrap());
    assert!(!session.start().unwrap());
    assert!(session.stop());
    assert!(!session.stop());
}
