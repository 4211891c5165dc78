//! In-memory session persistence

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

use super::{PersistedSession, SessionPersistence, StorageHealth};
use crate::clock::{SharedClock, to_chrono};
use crate::context::Session;
use crate::error::Result;

/// Process-local persistence; snapshots do not survive a restart
pub struct MemoryPersistence {
    ttl: Duration,
    clock: SharedClock,
    snapshots: RwLock<HashMap<String, PersistedSession>>,
}

impl MemoryPersistence {
    /// Create an empty backend
    pub fn new(ttl: Duration, clock: SharedClock) -> Self {
        Self {
            ttl,
            clock,
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored snapshots, including expired ones
    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }

    /// Whether no snapshots are stored
    pub async fn is_empty(&self) -> bool {
        self.snapshots.read().await.is_empty()
    }
}

#[async_trait]
impl SessionPersistence for MemoryPersistence {
    async fn save(&self, session: &Session) -> Result<()> {
        let expires_at = self.clock.now() + to_chrono(self.ttl);
        self.snapshots.write().await.insert(
            session.id().to_string(),
            PersistedSession {
                session: session.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<Session>> {
        let now = self.clock.now();
        let mut snapshots = self.snapshots.write().await;

        match snapshots.get(session_id) {
            Some(persisted) if persisted.expires_at > now => Ok(Some(persisted.session.clone())),
            Some(_) => {
                snapshots.remove(session_id);
                tracing::debug!(session_id = %session_id, "Persisted session expired");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        Ok(self.snapshots.write().await.remove(session_id).is_some())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut snapshots = self.snapshots.write().await;
        let before = snapshots.len();
        snapshots.retain(|_, persisted| persisted.expires_at > now);
        Ok(before - snapshots.len())
    }

    async fn health(&self) -> StorageHealth {
        StorageHealth {
            backend: "memory".to_string(),
            connected: true,
        }
    }
}
