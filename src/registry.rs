//! In-memory session registry
//!
//! Single owner of authoritative live-session state. The map is a `DashMap`,
//! so lookups take a shard lock and mutation happens under the per-entry
//! guard; lifecycle events are emitted only after guards are released, and no
//! method here performs I/O.

use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batcher::{EventBatcher, SessionBatch};
use crate::protocol::{SessionSnapshot, SessionStart, TrackerErrorKind};

/// Subscriber to session lifecycle events. The hub implements this to fan the
/// events out over the wire; the registry holds it weakly, so there is no
/// ownership cycle between the two.
pub trait SessionEventSink: Send + Sync {
    fn session_started(&self, session_id: &str, user_id: &str, metadata: &Value);
    fn session_ended(&self, session_id: &str);
    fn events_added(&self, session_id: &str, events: &[Value]);
    fn error_added(&self, session_id: &str, kind: TrackerErrorKind, record: &Value);
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("session already ended: {0}")]
    SessionEnded(String),
}

/// Live state for one session.
#[derive(Debug, Clone)]
pub struct LiveSession {
    pub session_id: String,
    pub user_id: String,
    pub metadata: Value,
    pub is_active: bool,
    /// Tracker connection currently holding the session.
    pub owner: Option<Uuid>,
    /// Bounded buffer of the most recent events.
    pub events: Vec<Value>,
    pub errors: Vec<Value>,
    /// Cumulative counters; unlike the buffer these never shrink.
    pub total_events: u64,
    pub total_errors: u64,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LiveSession {
    fn new(session_id: String, user_id: String, metadata: Value, owner: Uuid) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            user_id,
            metadata,
            is_active: true,
            owner: Some(owner),
            events: Vec::new(),
            errors: Vec::new(),
            total_events: 0,
            total_errors: 0,
            started_at: now,
            last_activity: now,
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        let now = Utc::now();
        if now > self.last_activity {
            self.last_activity = now;
        }
        self.updated_at = self.last_activity;
    }

    fn metadata_batch(&self) -> SessionBatch {
        SessionBatch::metadata_only(
            self.session_id.clone(),
            self.user_id.clone(),
            self.metadata.clone(),
            self.is_active,
        )
    }
}

/// Outcome of a `session_start`.
#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub session_id: String,
    /// True when the requested id was held by another live tracker and a
    /// fresh one was minted.
    pub reassigned: bool,
}

/// Summary used when a viewer joins a session that is still in memory.
#[derive(Debug, Clone)]
pub struct SessionOverview {
    pub user_id: String,
    pub metadata: Value,
    pub total_events: u64,
    pub total_errors: u64,
    pub is_active: bool,
}

/// A slice of the in-memory buffer. `from_index` addresses the current
/// buffer, not the full stream; `buffered == total_events` tells the caller
/// whether the buffer still holds everything.
#[derive(Debug, Clone)]
pub struct MemoryPage {
    pub events: Vec<Value>,
    pub total_events: u64,
    pub buffered: usize,
}

pub struct SessionRegistry {
    sessions: DashMap<String, LiveSession>,
    sinks: RwLock<Vec<Weak<dyn SessionEventSink>>>,
    batcher: Arc<EventBatcher>,
    max_events_per_session: usize,
}

impl SessionRegistry {
    pub fn new(batcher: Arc<EventBatcher>, max_events_per_session: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            sinks: RwLock::new(Vec::new()),
            batcher,
            max_events_per_session: max_events_per_session.max(2),
        }
    }

    pub fn subscribe(&self, sink: Weak<dyn SessionEventSink>) {
        self.sinks.write().unwrap().push(sink);
    }

    /// Create a session, or take ownership of an existing one. A requested id
    /// that is still active under a different connection is rejected and a
    /// fresh id minted; the caller signals it back with `session_assigned`.
    /// Starting an already-ended session re-activates it in place.
    pub fn start_session(&self, connection_id: Uuid, start: SessionStart) -> StartOutcome {
        let SessionStart { session_id: requested, user_id, metadata } = start;

        let conflict = match self.sessions.entry(requested.clone()) {
            Entry::Occupied(mut occupied) => {
                let session = occupied.get_mut();
                if session.is_active && session.owner.map_or(false, |o| o != connection_id) {
                    true
                } else {
                    session.user_id = user_id.clone();
                    session.metadata = metadata.clone();
                    session.is_active = true;
                    session.owner = Some(connection_id);
                    session.touch();
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(LiveSession::new(
                    requested.clone(),
                    user_id.clone(),
                    metadata.clone(),
                    connection_id,
                ));
                false
            }
        };

        let (session_id, reassigned) = if conflict {
            let minted = mint_session_id();
            warn!(
                requested = %requested,
                assigned = %minted,
                "session id already held by another tracker, reassigning"
            );
            self.sessions.insert(
                minted.clone(),
                LiveSession::new(minted.clone(), user_id.clone(), metadata.clone(), connection_id),
            );
            (minted, true)
        } else {
            (requested, false)
        };

        info!(session_id = %session_id, user_id = %user_id, reassigned, "session started");
        self.batcher.enqueue(SessionBatch::metadata_only(
            session_id.clone(),
            user_id.clone(),
            metadata.clone(),
            true,
        ));
        self.emit(|sink| sink.session_started(&session_id, &user_id, &metadata));

        StartOutcome { session_id, reassigned }
    }

    /// Append events in arrival order. The buffer is trimmed to the newest
    /// half of the cap when it overflows; the enqueued batch always carries
    /// the full appended slice.
    pub fn append_events(&self, session_id: &str, events: Vec<Value>) -> Result<(), RegistryError> {
        if events.is_empty() {
            return Ok(());
        }

        let batch = {
            let mut entry = self
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| RegistryError::UnknownSession(session_id.to_string()))?;
            if !entry.is_active {
                return Err(RegistryError::SessionEnded(session_id.to_string()));
            }

            entry.events.extend(events.iter().cloned());
            entry.total_events += events.len() as u64;
            entry.touch();

            if entry.events.len() > self.max_events_per_session {
                let keep = self.max_events_per_session / 2;
                let dropped = entry.events.len() - keep;
                entry.events.drain(..dropped);
                warn!(
                    session_id,
                    dropped,
                    retained = keep,
                    "event buffer over cap, trimmed to newest half"
                );
            }

            let mut batch = entry.metadata_batch();
            batch.events = events.clone();
            batch
        };

        self.batcher.enqueue(batch);
        self.emit(|sink| sink.events_added(session_id, &events));
        Ok(())
    }

    pub fn append_error(
        &self,
        session_id: &str,
        kind: TrackerErrorKind,
        record: Value,
    ) -> Result<(), RegistryError> {
        let batch = {
            let mut entry = self
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| RegistryError::UnknownSession(session_id.to_string()))?;

            entry.errors.push(record.clone());
            entry.total_errors += 1;
            entry.touch();

            let mut batch = entry.metadata_batch();
            batch.errors = vec![record.clone()];
            batch
        };

        self.batcher.enqueue(batch);
        self.emit(|sink| sink.error_added(session_id, kind, &record));
        Ok(())
    }

    /// Mark a session inactive. Idempotent: ending an already-ended session
    /// emits nothing, so the disconnect path can always call this safely.
    pub fn end_session(&self, session_id: &str) -> Result<(), RegistryError> {
        let batch = {
            let mut entry = self
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| RegistryError::UnknownSession(session_id.to_string()))?;
            if !entry.is_active {
                return Ok(());
            }

            entry.is_active = false;
            entry.owner = None;
            entry.touch();
            entry.metadata_batch()
        };

        info!(session_id, "session ended");
        self.batcher.enqueue(batch);
        self.emit(|sink| sink.session_ended(session_id));
        Ok(())
    }

    /// Liveness only; bumps `last_activity`, emits nothing.
    pub fn heartbeat(&self, session_id: &str) -> Result<(), RegistryError> {
        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::UnknownSession(session_id.to_string()))?;
        entry.touch();
        Ok(())
    }

    /// Slice of the current buffer. `from_index` is a buffer index, not a
    /// stream index; once trimming has happened the two diverge and callers
    /// needing the full stream must go to the store.
    pub fn events_page(&self, session_id: &str, from_index: usize, limit: usize) -> Option<MemoryPage> {
        let entry = self.sessions.get(session_id)?;
        let events = entry
            .events
            .iter()
            .skip(from_index)
            .take(limit)
            .cloned()
            .collect();
        Some(MemoryPage {
            events,
            total_events: entry.total_events,
            buffered: entry.events.len(),
        })
    }

    pub fn session_overview(&self, session_id: &str) -> Option<SessionOverview> {
        let entry = self.sessions.get(session_id)?;
        Some(SessionOverview {
            user_id: entry.user_id.clone(),
            metadata: entry.metadata.clone(),
            total_events: entry.total_events,
            total_errors: entry.total_errors,
            is_active: entry.is_active,
        })
    }

    /// Wire-shaped snapshot of the active sessions, most recently updated
    /// first. Counts are the cumulative in-memory totals.
    pub fn active_snapshot(&self) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<(DateTime<Utc>, SessionSnapshot)> = self
            .sessions
            .iter()
            .filter(|entry| entry.is_active)
            .map(|entry| {
                (
                    entry.updated_at,
                    SessionSnapshot {
                        session_id: entry.session_id.clone(),
                        user_id: entry.user_id.clone(),
                        metadata: entry.metadata.clone(),
                        event_count: entry.total_events,
                        error_count: entry.total_errors,
                    },
                )
            })
            .collect();

        sessions.sort_by(|a, b| b.0.cmp(&a.0));
        sessions.into_iter().map(|(_, snapshot)| snapshot).collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.iter().filter(|entry| entry.is_active).count()
    }

    pub fn total_event_count(&self) -> u64 {
        self.sessions.iter().map(|entry| entry.total_events).sum()
    }

    /// Drop inactive sessions idle strictly longer than `max_idle`.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Utc::now();
        let max_idle = chrono::Duration::from_std(max_idle).unwrap_or(chrono::Duration::hours(24));
        let before = self.sessions.len();

        self.sessions
            .retain(|_, session| session.is_active || now - session.last_activity <= max_idle);

        let evicted = before - self.sessions.len();
        if evicted > 0 {
            debug!(evicted, "evicted idle sessions from memory");
        }
        evicted
    }

    fn emit<F: Fn(&dyn SessionEventSink)>(&self, notify: F) {
        let sinks = self.sinks.read().unwrap();
        for weak in sinks.iter() {
            if let Some(sink) = weak.upgrade() {
                notify(sink.as_ref());
            }
        }
    }
}

fn mint_session_id() -> String {
    let nonce = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().timestamp_millis(), &nonce[..8])
}
