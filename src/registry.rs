//! Supervisor of running sessions.
//!
//! The registry owns a lock-protected table from source id to session. It
//! never reaches into a session beyond its start/stop handle and its stats.
//! Slow work (source lookup, detector construction, joining a capture loop)
//! runs outside the lock while the id stays reserved in the table.
//! Session failures are logged and leave the source inactive; they are never
//! returned to callers.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::config::{EngineConfig, SessionTunables};
use crate::session::{CapturePhase, SessionDeps, SessionStats, StreamSession};
use crate::SourceId;

/// Point-in-time copy of a session's counters.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct SourceStats {
    pub total_detections: u64,
    pub confirmed_events: u64,
    pub consecutive_count: u32,
    pub frame_count: u64,
    pub clips_written: u64,
    pub phase: CapturePhase,
    pub recording: bool,
    pub connections: u64,
    pub reconnect_attempts: u32,
    pub read_failures: u64,
}

impl From<&SessionStats> for SourceStats {
    fn from(stats: &SessionStats) -> Self {
        Self {
            total_detections: stats.total_detections(),
            confirmed_events: stats.confirmed_events(),
            consecutive_count: stats.consecutive_count(),
            frame_count: stats.frame_count(),
            clips_written: stats.clips_written(),
            phase: stats.phase(),
            recording: stats.is_recording(),
            connections: stats.connections(),
            reconnect_attempts: stats.reconnect_attempts(),
            read_failures: stats.read_failures(),
        }
    }
}

/// Table entry for one source id. Only `Running` counts as active; the other
/// states reserve the id while work happens outside the table lock.
enum Slot {
    /// Lookup, tunables and detector construction are in progress.
    Starting { cancelled: bool },
    Running(StreamSession),
    /// The capture loop is being joined.
    Stopping,
}

impl Slot {
    /// Hand back the session of a running slot and leave `Stopping` behind.
    /// A starting slot is marked cancelled instead.
    fn begin_stop(&mut self) -> Option<StreamSession> {
        match self {
            Slot::Starting { cancelled } => {
                *cancelled = true;
                None
            }
            Slot::Running(_) => match std::mem::replace(self, Slot::Stopping) {
                Slot::Running(session) => Some(session),
                _ => None,
            },
            Slot::Stopping => None,
        }
    }

    fn is_busy(&self) -> bool {
        matches!(self, Slot::Starting { .. } | Slot::Stopping)
    }

    fn live_session(&self) -> Option<&StreamSession> {
        match self {
            Slot::Running(session) if session.is_running() => Some(session),
            _ => None,
        }
    }
}

type Slots = HashMap<SourceId, Slot>;

pub struct StreamRegistry {
    config: EngineConfig,
    deps: SessionDeps,
    slots: Mutex<Slots>,
    /// Signalled whenever a slot leaves `Starting` or `Stopping`.
    settled: Condvar,
}

impl StreamRegistry {
    pub fn new(config: EngineConfig, deps: SessionDeps) -> Self {
        Self {
            config,
            deps,
            slots: Mutex::new(HashMap::new()),
            settled: Condvar::new(),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_while<'a>(
        &self,
        slots: MutexGuard<'a, Slots>,
        condition: impl FnMut(&mut Slots) -> bool,
    ) -> MutexGuard<'a, Slots> {
        self.settled
            .wait_while(slots, condition)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Start capturing `id`. Returns `false` if it is already active, is
    /// still starting or stopping, or could not be started.
    ///
    /// The id is reserved in the table first; the source lookup and the
    /// session launch (which builds the detector) run without the lock.
    pub fn start_source(&self, id: SourceId) -> bool {
        let stale = {
            let mut slots = self.slots();
            match slots.get(&id) {
                Some(slot) if slot.is_busy() => {
                    log::debug!("source {} is starting or stopping", id);
                    return false;
                }
                Some(slot) if slot.live_session().is_some() => {
                    log::debug!("source {} is already active", id);
                    return false;
                }
                _ => {}
            }
            slots.insert(id, Slot::Starting { cancelled: false })
        };
        drop(stale);

        let launched = self.launch(id);

        let mut slots = self.slots();
        let cancelled = matches!(slots.get(&id), Some(Slot::Starting { cancelled: true }));
        match launched {
            Some(session) if cancelled => {
                slots.insert(id, Slot::Stopping);
                drop(slots);
                log::info!("source {}: stop requested while starting", id);
                self.join_and_release(id, session);
                false
            }
            Some(session) => {
                slots.insert(id, Slot::Running(session));
                drop(slots);
                self.settled.notify_all();
                log::info!("source {} started", id);
                true
            }
            None => {
                slots.remove(&id);
                drop(slots);
                self.settled.notify_all();
                false
            }
        }
    }

    fn launch(&self, id: SourceId) -> Option<StreamSession> {
        let source = match self.deps.persistence.get_source_by_id(id) {
            Ok(Some(source)) => source,
            Ok(None) => {
                log::warn!("source {} is not registered", id);
                return None;
            }
            Err(e) => {
                log::error!("source {}: lookup failed: {:#}", id, e);
                return None;
            }
        };
        let tunables = SessionTunables::resolve(&self.config, self.deps.persistence.as_ref());
        log::debug!("source {}: starting with {:?}", id, tunables);

        let mut session = StreamSession::new(source, tunables, self.deps.clone());
        match session.start() {
            Ok(true) => Some(session),
            Ok(false) => None,
            Err(e) => {
                log::error!("{:#}", e);
                None
            }
        }
    }

    /// Join a session whose slot is `Stopping`, then free the id.
    fn join_and_release(&self, id: SourceId, mut session: StreamSession) -> bool {
        let stopped = session.stop();
        {
            let mut slots = self.slots();
            if matches!(slots.get(&id), Some(Slot::Stopping)) {
                slots.remove(&id);
            }
        }
        self.settled.notify_all();
        log::info!("source {} stopped", id);
        stopped
    }

    /// Stop capturing `id` and wait for its loop to exit. A start still in
    /// progress is cancelled and waited for. Returns `false` if nothing was
    /// active or starting.
    ///
    /// The id stays reserved until the join finishes, so a concurrent
    /// `start_source` cannot launch a second session meanwhile.
    pub fn stop_source(&self, id: SourceId) -> bool {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(&id) else {
            return false;
        };
        let was_starting = matches!(slot, Slot::Starting { .. });
        match slot.begin_stop() {
            Some(session) => {
                drop(slots);
                self.join_and_release(id, session)
            }
            None => {
                // another caller owns the transition; wait for it to settle
                let _slots = self.wait_while(slots, |slots| slots.get(&id).is_some_and(Slot::is_busy));
                was_starting
            }
        }
    }

    /// Stop and restart `id` with freshly resolved tunables.
    pub fn restart_source(&self, id: SourceId) -> bool {
        self.stop_source(id);
        self.start_source(id)
    }

    /// Stop every session. All loops have exited when this returns, including
    /// those of starts that were in progress.
    pub fn stop_all(&self) {
        let mut sessions: Vec<(SourceId, StreamSession)> = {
            let mut slots = self.slots();
            slots
                .iter_mut()
                .filter_map(|(id, slot)| slot.begin_stop().map(|session| (*id, session)))
                .collect()
        };
        for (_, session) in &sessions {
            session.request_stop();
        }
        for (id, session) in sessions.drain(..) {
            self.join_and_release(id, session);
        }

        let slots = self.slots();
        let _slots = self.wait_while(slots, |slots| {
            slots.values().any(|slot| {
                matches!(slot, Slot::Stopping | Slot::Starting { cancelled: true })
            })
        });
    }

    /// Ids with a live capture loop.
    pub fn list_active(&self) -> BTreeSet<SourceId> {
        let mut slots = self.slots();
        reap_finished(&mut slots);
        slots
            .iter()
            .filter(|(_, slot)| slot.live_session().is_some())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn is_active(&self, id: SourceId) -> bool {
        self.slots()
            .get(&id)
            .is_some_and(|slot| slot.live_session().is_some())
    }

    /// Counters of a registered session, live or terminated but not yet reaped.
    pub fn get_stats(&self, id: SourceId) -> Option<SourceStats> {
        self.session_stats(id)
            .map(|stats| SourceStats::from(stats.as_ref()))
    }

    /// Live counters of a registered session.
    pub fn session_stats(&self, id: SourceId) -> Option<Arc<SessionStats>> {
        match self.slots().get(&id) {
            Some(Slot::Running(session)) => Some(session.stats()),
            _ => None,
        }
    }
}

impl Drop for StreamRegistry {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn reap_finished(slots: &mut Slots) {
    slots.retain(|id, slot| match slot {
        Slot::Running(session) if !session.is_running() => {
            log::warn!("source {} is no longer running; left inactive", id);
            false
        }
        _ => true,
    });
}
