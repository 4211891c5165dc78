//! Session Context Store
//!
//! Holds every live [`Session`] behind a per-session mutex. The outer map lock
//! is held (shared) while a session is operated on, so a concurrent sweep can
//! never orphan a session that is being mutated. Operations are synchronous
//! and never await.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use super::session::{Entity, EntityRecord, HistoryEntry, Session, Topic};
use crate::clock::{SharedClock, elapsed_between};
use crate::config::SessionConfig;

/// Bounded, expiring store of conversational sessions
pub struct SessionStore {
    config: SessionConfig,
    clock: SharedClock,
    sessions: RwLock<HashMap<String, Mutex<Session>>>,
}

impl SessionStore {
    /// Create an empty store
    pub fn new(config: SessionConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Store configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current time according to the store's clock
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Mutex<Session>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Mutex<Session>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(slot: &Mutex<Session>) -> MutexGuard<'_, Session> {
        slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the live session, creating it (or replacing an expired
    /// one) first.
    fn with_session<T>(&self, id: &str, f: impl FnOnce(&mut Session, DateTime<Utc>) -> T) -> T {
        let now = self.clock.now();

        {
            let sessions = self.read();
            if let Some(slot) = sessions.get(id) {
                let mut session = Self::lock(slot);
                self.expire_if_idle(&mut session, now);
                return f(&mut session, now);
            }
        }

        let mut sessions = self.write();
        let slot = sessions.entry(id.to_string()).or_insert_with(|| {
            tracing::info!(session_id = %id, "Created session");
            Mutex::new(Session::new(id, now))
        });
        let mut session = Self::lock(slot);
        self.expire_if_idle(&mut session, now);
        f(&mut session, now)
    }

    /// Run `f` against the live session without creating it; expired sessions
    /// read as absent.
    fn read_session<T>(&self, id: &str, f: impl FnOnce(&Session, DateTime<Utc>) -> T) -> Option<T> {
        let now = self.clock.now();
        let sessions = self.read();
        let session = Self::lock(sessions.get(id)?);
        if session.is_idle(now, self.config.idle_timeout) {
            return None;
        }
        Some(f(&session, now))
    }

    fn expire_if_idle(&self, session: &mut Session, now: DateTime<Utc>) {
        if session.is_idle(now, self.config.idle_timeout) {
            tracing::info!(
                session_id = %session.id(),
                idle_secs = elapsed_between(session.last_activity_at(), now).as_secs(),
                "Session expired, starting fresh"
            );
            *session = Session::new(session.id().to_string(), now);
        }
    }

    /// Return a snapshot of the session, creating a fresh one when the id is
    /// unknown or the session has expired.
    pub fn get_or_create(&self, id: &str) -> Session {
        self.with_session(id, |session, now| {
            session.touch(now);
            session.clone()
        })
    }

    /// Whether a live (non-expired) session exists
    pub fn contains(&self, id: &str) -> bool {
        self.read_session(id, |_, _| ()).is_some()
    }

    /// Snapshot of a live session
    pub fn snapshot(&self, id: &str) -> Option<Session> {
        self.read_session(id, |session, _| session.clone())
    }

    /// Install a session loaded from persistence.
    ///
    /// A live in-memory session with the same id wins and the snapshot is
    /// dropped. An installed snapshot counts as active now, so only the
    /// persistence TTL bounds how old it may be. Returns whether it was
    /// installed.
    pub fn restore(&self, mut session: Session) -> bool {
        let now = self.clock.now();
        let mut sessions = self.write();

        if let Some(slot) = sessions.get(session.id())
            && !Self::lock(slot).is_idle(now, self.config.idle_timeout)
        {
            tracing::debug!(session_id = %session.id(), "Live session kept over persisted snapshot");
            return false;
        }

        session.touch(now);
        tracing::debug!(session_id = %session.id(), turns = session.turn_count(), "Restored session");
        sessions.insert(session.id().to_string(), Mutex::new(session));
        true
    }

    /// Drop the in-memory copy of a session without logging a reset
    pub fn discard(&self, id: &str) -> bool {
        let removed = self.write().remove(id).is_some();
        if removed {
            tracing::debug!(session_id = %id, "Discarded in-memory session");
        }
        removed
    }

    /// Append to the history, keeping the last `history_limit` entries
    pub fn append_history(&self, id: &str, entry: HistoryEntry) {
        let limit = self.config.history_limit;
        self.with_session(id, |session, now| session.push_history(entry, limit, now));
    }

    /// Upsert entity observations by type
    pub fn record_entities(&self, id: &str, entities: &[Entity]) {
        if entities.is_empty() {
            return;
        }
        self.with_session(id, |session, now| session.observe_entities(entities, now));
    }

    /// Append a topic, keeping the last `topic_limit` topics
    pub fn record_topic(&self, id: &str, intent: &str, query: &str) {
        let limit = self.config.topic_limit;
        self.with_session(id, |session, now| session.push_topic(intent, query, limit, now));
    }

    /// Entity record for `entity_type` if it was seen within `max_age`
    pub fn get_entity(&self, id: &str, entity_type: &str, max_age: Duration) -> Option<EntityRecord> {
        self.read_session(id, |session, now| {
            session
                .entity(entity_type)
                .filter(|record| elapsed_between(record.last_seen, now) <= max_age)
                .cloned()
        })
        .flatten()
    }

    /// Entity record using the configured `entity_max_age`
    pub fn get_fresh_entity(&self, id: &str, entity_type: &str) -> Option<EntityRecord> {
        self.get_entity(id, entity_type, self.config.entity_max_age)
    }

    /// The last `n` topics, oldest first
    pub fn get_recent_topics(&self, id: &str, n: usize) -> Vec<Topic> {
        self.read_session(id, |session, _| session.recent_topics(n).to_vec())
            .unwrap_or_default()
    }

    /// Count a processed user message and return the new turn count
    pub fn increment_turn(&self, id: &str) -> u32 {
        self.with_session(id, |session, now| session.increment_turn(now))
    }

    /// Ordered history of a live session, empty when absent
    pub fn history(&self, id: &str) -> Vec<HistoryEntry> {
        self.read_session(id, |session, _| session.history().to_vec())
            .unwrap_or_default()
    }

    /// Remove a session; returns whether it existed
    pub fn reset(&self, id: &str) -> bool {
        let removed = self.write().remove(id).is_some();
        if removed {
            tracing::info!(session_id = %id, "Session reset");
        }
        removed
    }

    /// Remove sessions idle for longer than `max_idle`; returns the removed ids
    pub fn sweep(&self, max_idle: Duration) -> Vec<String> {
        let now = self.clock.now();
        let mut sessions = self.write();

        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, slot)| Self::lock(slot).is_idle(now, max_idle))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            sessions.remove(id);
        }

        if !expired.is_empty() {
            tracing::info!(
                removed = expired.len(),
                remaining = sessions.len(),
                "Swept idle sessions"
            );
        }
        expired
    }

    /// Sweep using the configured idle timeout
    pub fn sweep_expired(&self) -> Vec<String> {
        self.sweep(self.config.idle_timeout)
    }

    /// Number of sessions held, including ones not yet swept
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the store holds no sessions
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("sessions", &self.len())
            .field("config", &self.config)
            .finish()
    }
}
