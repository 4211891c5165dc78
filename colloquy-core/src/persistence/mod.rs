//! Session persistence
//!
//! Sessions are saved as whole snapshots keyed by session id and expire after
//! a TTL. Backends implement [`SessionPersistence`].

mod directory;
mod memory;

pub use directory::DirectoryPersistence;
pub use memory::MemoryPersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::clock::SharedClock;
use crate::config::{PersistenceBackend, PersistenceConfig};
use crate::context::Session;
use crate::error::Result;

/// Storage connectivity, reported by the health endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageHealth {
    /// Backend name
    pub backend: String,
    /// Whether the backend is reachable
    pub connected: bool,
}

/// A session snapshot with its expiry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSession {
    /// The saved session
    pub session: Session,
    /// When the snapshot stops being loadable
    pub expires_at: DateTime<Utc>,
}

/// Trait for session persistence backends
#[async_trait]
pub trait SessionPersistence: Send + Sync {
    /// Save a snapshot, replacing any earlier one and restarting its TTL
    async fn save(&self, session: &Session) -> Result<()>;

    /// Load a snapshot that has not expired
    async fn load(&self, session_id: &str) -> Result<Option<Session>>;

    /// Delete a snapshot; returns whether one existed
    async fn delete(&self, session_id: &str) -> Result<bool>;

    /// Remove every expired snapshot; returns how many were removed
    async fn purge_expired(&self) -> Result<usize>;

    /// Backend connectivity
    async fn health(&self) -> StorageHealth;
}

/// Build the backend selected by configuration
pub async fn from_config(
    config: &PersistenceConfig,
    clock: SharedClock,
) -> Result<Arc<dyn SessionPersistence>> {
    let persistence: Arc<dyn SessionPersistence> = match &config.backend {
        PersistenceBackend::Memory => Arc::new(MemoryPersistence::new(config.ttl, clock)),
        PersistenceBackend::Directory { path } => {
            Arc::new(DirectoryPersistence::open(path, config.ttl, clock).await?)
        }
    };
    Ok(persistence)
}
