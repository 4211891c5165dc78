//! JSON-file session persistence
//!
//! One file per session under a directory. Session ids are escaped so any id
//! maps to a single file name inside the directory.

use async_trait::async_trait;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use super::{PersistedSession, SessionPersistence, StorageHealth};
use crate::clock::{SharedClock, to_chrono};
use crate::context::Session;
use crate::error::{ColloquyError, Result};

/// Stores each session as `<dir>/<escaped-id>.json`
pub struct DirectoryPersistence {
    root: PathBuf,
    ttl: Duration,
    clock: SharedClock,
}

impl DirectoryPersistence {
    /// Open (creating if needed) a persistence directory
    pub async fn open(root: impl AsRef<Path>, ttl: Duration, clock: SharedClock) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            ColloquyError::SessionStore(format!(
                "Failed to create session directory {}: {}",
                root.display(),
                e
            ))
        })?;

        tracing::info!(path = %root.display(), "Opened session directory");
        Ok(Self { root, ttl, clock })
    }

    /// Directory holding the session files
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{}.json", escape_id(session_id)))
    }
}

/// Keep `[A-Za-z0-9_-]`, percent-encode every other byte
fn escape_id(session_id: &str) -> String {
    let mut escaped = String::with_capacity(session_id.len());
    for byte in session_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            escaped.push(byte as char);
        } else {
            let _ = write!(escaped, "%{:02X}", byte);
        }
    }
    escaped
}

fn store_error(action: &str, path: &Path, err: impl std::fmt::Display) -> ColloquyError {
    ColloquyError::SessionStore(format!("Failed to {} {}: {}", action, path.display(), err))
}

#[async_trait]
impl SessionPersistence for DirectoryPersistence {
    async fn save(&self, session: &Session) -> Result<()> {
        let persisted = PersistedSession {
            session: session.clone(),
            expires_at: self.clock.now() + to_chrono(self.ttl),
        };
        let json = serde_json::to_vec_pretty(&persisted)?;

        // Each save writes its own temp file so concurrent saves never share one
        let path = self.path_for(session.id());
        let tmp = path.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
        if let Err(e) = tokio::fs::write(&tmp, json).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(store_error("write", &tmp, e));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(store_error("replace", &path, e));
        }
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<Session>> {
        let path = self.path_for(session_id);

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(store_error("read", &path, e)),
        };

        let persisted: PersistedSession =
            serde_json::from_slice(&bytes).map_err(|e| store_error("parse", &path, e))?;

        if persisted.expires_at <= self.clock.now() {
            tracing::debug!(session_id = %session_id, "Persisted session expired");
            self.delete(session_id).await?;
            return Ok(None);
        }

        Ok(Some(persisted.session))
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        let path = self.path_for(session_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(store_error("remove", &path, e)),
        }
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| store_error("list", &self.root, e))?;

        let mut purged = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| store_error("list", &self.root, e))?
        {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }

            let expired = match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<PersistedSession>(&bytes) {
                    Ok(persisted) => persisted.expires_at <= now,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable session file");
                        false
                    }
                },
                // Removed by a concurrent delete or purge
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
                Err(e) => return Err(store_error("read", &path, e)),
            };

            if expired {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => purged += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(store_error("remove", &path, e)),
                }
            }
        }

        if purged > 0 {
            tracing::debug!(count = purged, "Purged expired session files");
        }
        Ok(purged)
    }

    async fn health(&self) -> StorageHealth {
        let connected = tokio::fs::metadata(&self.root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);

        StorageHealth {
            backend: "directory".to_string(),
            connected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::context::{Entity, HistoryEntry};
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn open(dir: &TempDir, clock: Arc<ManualClock>) -> DirectoryPersistence {
        DirectoryPersistence::open(dir.path().join("sessions"), Duration::from_secs(3600), clock)
            .await
            .unwrap()
    }

    #[test]
    fn test_escape_id() {
        assert_eq!(escape_id("abc-123_X"), "abc-123_X");
        assert_eq!(escape_id("../etc/passwd"), "%2E%2E%2Fetc%2Fpasswd");
        assert_ne!(escape_id("a/b"), escape_id("a%2Fb"));
    }

    #[tokio::test]
    async fn test_round_trip_through_files() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let persistence = open(&dir, clock.clone()).await;

        let now = clock.now();
        let mut session = Session::new("chat/42", now);
        session.push_history(HistoryEntry::user("How do I update Ubuntu?", now), 20, now);
        session.observe_entities(&[Entity::new("ubuntu_version", "22.04", 0.9)], now);
        session.increment_turn(now);
        persistence.save(&session).await.unwrap();

        assert!(persistence.root().join("chat%2F42.json").exists());

        let loaded = persistence.load("chat/42").await.unwrap().unwrap();
        assert_eq!(loaded.id(), "chat/42");
        assert_eq!(loaded.turn_count(), 1);
        assert_eq!(loaded.history()[0].content, "How do I update Ubuntu?");
        assert_eq!(loaded.entity("ubuntu_version").unwrap().value, "22.04");
    }

    #[tokio::test]
    async fn test_expired_file_is_removed() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let persistence = open(&dir, clock.clone()).await;

        persistence.save(&Session::new("s", clock.now())).await.unwrap();
        clock.advance(Duration::from_secs(3600));

        assert!(persistence.load("s").await.unwrap().is_none());
        assert!(!persistence.delete("s").await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_expired_files() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let persistence = open(&dir, clock.clone()).await;

        persistence.save(&Session::new("stale", clock.now())).await.unwrap();
        clock.advance(Duration::from_secs(1800));
        persistence.save(&Session::new("fresh", clock.now())).await.unwrap();
        std::fs::write(persistence.root().join("bad.json"), b"{not json").unwrap();
        std::fs::write(persistence.root().join("notes.txt"), b"keep").unwrap();
        clock.advance(Duration::from_secs(1800));

        assert_eq!(persistence.purge_expired().await.unwrap(), 1);
        assert!(!persistence.root().join("stale.json").exists());
        assert!(persistence.root().join("fresh.json").exists());
        assert!(persistence.root().join("bad.json").exists());
        assert!(persistence.root().join("notes.txt").exists());
        assert!(persistence.load("fresh").await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_saves_leave_a_readable_file() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let persistence = Arc::new(open(&dir, clock.clone()).await);

        let mut tasks = Vec::new();
        for turns in 1..=16u32 {
            let persistence = persistence.clone();
            let now = clock.now();
            tasks.push(tokio::spawn(async move {
                let mut session = Session::new("shared", now);
                for _ in 0..turns {
                    session.increment_turn(now);
                }
                persistence.save(&session).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let loaded = persistence.load("shared").await.unwrap().unwrap();
        assert!((1..=16).contains(&loaded.turn_count()));

        let leftovers: Vec<_> = std::fs::read_dir(persistence.root())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .filter(|name| name.to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_store_error() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let persistence = open(&dir, clock).await;

        std::fs::write(persistence.root().join("bad.json"), b"{not json").unwrap();
        assert!(matches!(
            persistence.load("bad").await,
            Err(ColloquyError::SessionStore(_))
        ));
    }

    #[tokio::test]
    async fn test_health_reports_missing_directory() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let persistence = open(&dir, clock).await;
        assert!(persistence.health().await.connected);

        std::fs::remove_dir_all(persistence.root()).unwrap();
        let health = persistence.health().await;
        assert_eq!(health.backend, "directory");
        assert!(!health.connected);

        assert!(matches!(
            persistence.save(&Session::new("s", chrono::Utc::now())).await,
            Err(ColloquyError::SessionStore(_))
        ));
    }
}
