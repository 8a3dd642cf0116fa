//! Persistence collaborator.
//!
//! The engine only consumes four operations (`Persistence`): resolve a camera,
//! save a confirmed event, attach an evidence artifact, read a tunable. No
//! business logic lives behind this boundary.
//!
//! `SqlitePersistence` is the deployed store; `InMemoryPersistence` backs tests
//! and demos. Both also expose the small catalogue surface used by the
//! `camera_admin` tool.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::{ArtifactKind, CameraSource, Endpoint, EventId, GeoPoint, NewEvent, SourceId};

pub trait Persistence: Send + Sync {
    fn get_source_by_id(&self, id: SourceId) -> Result<Option<CameraSource>>;

    fn save_event(&self, event: &NewEvent) -> Result<EventId>;

    fn save_evidence_artifact(&self, event_id: EventId, kind: ArtifactKind, path: &str)
        -> Result<()>;

    fn get_config_value(&self, key: &str) -> Result<Option<String>>;

    /// The clip promised by `event_id` was never written. Clears the event's
    /// file path and appends `reason` to its description.
    fn mark_clip_failed(&self, event_id: EventId, reason: &str) -> Result<()>;
}

fn clip_failure_note(reason: &str) -> String {
    format!(" [clip not written: {}]", reason)
}

/// Event row as stored.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct StoredEvent {
    pub id: EventId,
    pub source_id: SourceId,
    pub file_path: String,
    pub location: GeoPoint,
    pub description: String,
    pub created_at: String,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct StoredArtifact {
    pub event_id: EventId,
    pub kind: ArtifactKind,
    pub path: String,
}

// ----------------------------------------------------------------------------
// SQLite
// ----------------------------------------------------------------------------

pub struct SqlitePersistence {
    conn: Mutex<Connection>,
}

impl SqlitePersistence {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open database {}", db_path))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn().execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS cameras (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              address TEXT NOT NULL,
              port INTEGER NOT NULL,
              path TEXT NOT NULL,
              credential_ref TEXT,
              url TEXT,
              latitude REAL NOT NULL,
              longitude REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              camera_id INTEGER NOT NULL,
              file_path TEXT NOT NULL,
              latitude REAL NOT NULL,
              longitude REAL NOT NULL,
              description TEXT NOT NULL,
              created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS evidence (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              event_id INTEGER NOT NULL,
              kind TEXT NOT NULL,
              file_path TEXT NOT NULL,
              anonymized INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS settings (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_camera ON events(camera_id);
            "#,
        )?;
        Ok(())
    }

    pub fn add_source(&self, endpoint: &Endpoint, location: GeoPoint) -> Result<SourceId> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO cameras(address, port, path, credential_ref, url, latitude, longitude)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                endpoint.address,
                endpoint.port,
                endpoint.path,
                endpoint.credential_ref,
                endpoint.url,
                location.latitude,
                location.longitude
            ],
        )?;
        Ok(SourceId(conn.last_insert_rowid()))
    }

    pub fn list_sources(&self) -> Result<Vec<CameraSource>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, address, port, path, credential_ref, url, latitude, longitude \
             FROM cameras ORDER BY id",
        )?;
        let rows = stmt.query_map([], camera_from_row)?;
        let sources = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sources)
    }

    pub fn set_config_value(&self, key: &str, value: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO settings(key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn events_for_source(&self, id: SourceId, limit: usize) -> Result<Vec<StoredEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, camera_id, file_path, latitude, longitude, description, created_at \
             FROM events WHERE camera_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![id.0, limit as i64], |row| {
            Ok(StoredEvent {
                id: EventId(row.get(0)?),
                source_id: SourceId(row.get(1)?),
                file_path: row.get(2)?,
                location: GeoPoint {
                    latitude: row.get(3)?,
                    longitude: row.get(4)?,
                },
                description: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?;
        let events = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    pub fn artifacts_for_event(&self, event_id: EventId) -> Result<Vec<StoredArtifact>> {
        let raw = {
            let conn = self.conn();
            let mut stmt = conn
                .prepare("SELECT kind, file_path FROM evidence WHERE event_id = ?1 ORDER BY id")?;
            let rows = stmt.query_map(params![event_id.0], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        raw.into_iter()
            .map(|(kind, path)| {
                Ok(StoredArtifact {
                    event_id,
                    kind: kind.parse()?,
                    path,
                })
            })
            .collect()
    }
}

fn camera_from_row(row: &Row<'_>) -> rusqlite::Result<CameraSource> {
    Ok(CameraSource {
        id: SourceId(row.get(0)?),
        endpoint: Endpoint {
            address: row.get(1)?,
            port: row.get(2)?,
            path: row.get(3)?,
            credential_ref: row.get(4)?,
            url: row.get(5)?,
        },
        location: GeoPoint {
            latitude: row.get(6)?,
            longitude: row.get(7)?,
        },
    })
}

impl Persistence for SqlitePersistence {
    fn get_source_by_id(&self, id: SourceId) -> Result<Option<CameraSource>> {
        let conn = self.conn();
        let source = conn
            .query_row(
                "SELECT id, address, port, path, credential_ref, url, latitude, longitude \
                 FROM cameras WHERE id = ?1",
                params![id.0],
                camera_from_row,
            )
            .optional()?;
        Ok(source)
    }

    fn save_event(&self, event: &NewEvent) -> Result<EventId> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO events(camera_id, file_path, latitude, longitude, description, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                event.source_id.0,
                event.file_path,
                event.location.latitude,
                event.location.longitude,
                event.description,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(EventId(conn.last_insert_rowid()))
    }

    fn save_evidence_artifact(
        &self,
        event_id: EventId,
        kind: ArtifactKind,
        path: &str,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO evidence(event_id, kind, file_path) VALUES (?1, ?2, ?3)",
            params![event_id.0, kind.as_str(), path],
        )?;
        Ok(())
    }

    fn get_config_value(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn()
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn mark_clip_failed(&self, event_id: EventId, reason: &str) -> Result<()> {
        let updated = self.conn().execute(
            "UPDATE events SET file_path = '', description = description || ?2 WHERE id = ?1",
            params![event_id.0, clip_failure_note(reason)],
        )?;
        if updated == 0 {
            return Err(anyhow!("event {} does not exist", event_id));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// In-memory
// ----------------------------------------------------------------------------

#[derive(Default)]
struct InMemoryState {
    sources: HashMap<SourceId, CameraSource>,
    next_source_id: i64,
    events: Vec<StoredEvent>,
    artifacts: Vec<StoredArtifact>,
    settings: HashMap<String, String>,
    fail_writes: bool,
}

#[derive(Default)]
pub struct InMemoryPersistence {
    state: Mutex<InMemoryState>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, InMemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_source(&self, endpoint: Endpoint, location: GeoPoint) -> SourceId {
        let mut state = self.state();
        state.next_source_id += 1;
        let id = SourceId(state.next_source_id);
        state.sources.insert(
            id,
            CameraSource {
                id,
                endpoint,
                location,
            },
        );
        id
    }

    pub fn set_config_value(&self, key: &str, value: &str) {
        self.state()
            .settings
            .insert(key.to_string(), value.to_string());
    }

    /// Make every subsequent write fail, to exercise recording error paths.
    pub fn fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    pub fn events(&self) -> Vec<StoredEvent> {
        self.state().events.clone()
    }

    pub fn artifacts(&self) -> Vec<StoredArtifact> {
        self.state().artifacts.clone()
    }
}

impl Persistence for InMemoryPersistence {
    fn get_source_by_id(&self, id: SourceId) -> Result<Option<CameraSource>> {
        Ok(self.state().sources.get(&id).cloned())
    }

    fn save_event(&self, event: &NewEvent) -> Result<EventId> {
        let mut state = self.state();
        if state.fail_writes {
            return Err(anyhow!("event store unavailable"));
        }
        let id = EventId(state.events.len() as i64 + 1);
        state.events.push(StoredEvent {
            id,
            source_id: event.source_id,
            file_path: event.file_path.clone(),
            location: event.location,
            description: event.description.clone(),
            created_at: Utc::now().to_rfc3339(),
        });
        Ok(id)
    }

    fn save_evidence_artifact(
        &self,
        event_id: EventId,
        kind: ArtifactKind,
        path: &str,
    ) -> Result<()> {
        let mut state = self.state();
        if state.fail_writes {
            return Err(anyhow!("evidence store unavailable"));
        }
        state.artifacts.push(StoredArtifact {
            event_id,
            kind,
            path: path.to_string(),
        });
        Ok(())
    }

    fn get_config_value(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state().settings.get(key).cloned())
    }

    fn mark_clip_failed(&self, event_id: EventId, reason: &str) -> Result<()> {
        let mut state = self.state();
        if state.fail_writes {
            return Err(anyhow!("event store unavailable"));
        }
        let event = state
            .events
            .iter_mut()
            .find(|event| event.id == event_id)
            .ok_or_else(|| anyhow!("event {} does not exist", event_id))?;
        event.file_path.clear();
        event.description.push_str(&clip_failure_note(reason));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::new("10.0.0.5", 554, "/Streaming/Channels/101").with_credential_ref("env:CAM_5")
    }

    #[test]
    fn sqlite_round_trips_sources_events_and_settings() -> Result<()> {
        let store = SqlitePersistence::open_in_memory()?;
        let location = GeoPoint {
            latitude: -12.05,
            longitude: -77.04,
        };
        let id = store.add_source(&endpoint(), location)?;

        let source = store.get_source_by_id(id)?.expect("source exists");
        assert_eq!(source.endpoint, endpoint());
        assert_eq!(source.location, location);
        assert!(store.get_source_by_id(SourceId(999))?.is_none());

        let event_id = store.save_event(&NewEvent {
            source_id: id,
            file_path: "clips/1_20260101T000000.000Z.avi".to_string(),
            location,
            description: "severe event".to_string(),
        })?;
        store.save_evidence_artifact(event_id, ArtifactKind::Video, "clips/x.avi")?;

        let events = store.events_for_source(id, 10)?;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, event_id);
        let artifacts = store.artifacts_for_event(event_id)?;
        assert_eq!(artifacts[0].kind, ArtifactKind::Video);

        assert_eq!(store.get_config_value("cooldown_seconds")?, None);
        store.set_config_value("cooldown_seconds", "30")?;
        store.set_config_value("cooldown_seconds", "45")?;
        assert_eq!(store.get_config_value("cooldown_seconds")?.as_deref(), Some("45"));

        assert_eq!(store.list_sources()?.len(), 1);
        Ok(())
    }

    #[test]
    fn failed_clip_clears_the_event_file_path() -> Result<()> {
        let store = SqlitePersistence::open_in_memory()?;
        let id = store.add_source(&endpoint(), GeoPoint::default())?;
        let event_id = store.save_event(&NewEvent {
            source_id: id,
            file_path: "clips/1_20260101T000000.000Z.avi".to_string(),
            location: GeoPoint::default(),
            description: "severe event".to_string(),
        })?;

        store.mark_clip_failed(event_id, "disk full")?;
        let events = store.events_for_source(id, 10)?;
        assert_eq!(events[0].file_path, "");
        assert_eq!(events[0].description, "severe event [clip not written: disk full]");

        assert!(store.mark_clip_failed(EventId(event_id.0 + 1), "disk full").is_err());
        Ok(())
    }

    #[test]
    fn in_memory_store_can_fail_writes() {
        let store = InMemoryPersistence::new();
        let id = store.add_source(endpoint(), GeoPoint::default());
        store.fail_writes(true);
        let result = store.save_event(&NewEvent {
            source_id: id,
            file_path: "x".into(),
            location: GeoPoint::default(),
            description: "d".into(),
        });
        assert!(result.is_err());
        store.fail_writes(false);
        assert!(store.save_evidence_artifact(EventId(1), ArtifactKind::Image, "y").is_ok());
        assert_eq!(store.artifacts().len(), 1);
    }
}
