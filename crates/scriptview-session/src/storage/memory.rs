//! In-memory retained-session storage.

use std::{collections::HashMap, sync::Arc, sync::RwLock, time::Duration};

use async_trait::async_trait;
use scriptview_core::SessionId;
use tokio::time::Instant;

use super::{SessionStorage, StorageError};
use crate::SessionLifecycle;

/// Default time a disconnected session stays eligible for reconnection.
pub const DEFAULT_TTL: Duration = Duration::from_secs(120);

/// Default maximum number of retained sessions.
pub const DEFAULT_MAX_ENTRIES: usize = 128;

struct Retained {
    session: Arc<SessionLifecycle>,
    expires_at: Instant,
}

/// In-memory storage with a TTL and a capacity bound.
///
/// Expired sessions, and the oldest ones beyond capacity, are handed back by
/// [`SessionStorage::take_expired`] so the caller can close them.
pub struct MemorySessionStorage {
    ttl: Duration,
    max_entries: usize,
    sessions: RwLock<HashMap<SessionId, Retained>>,
}

impl MemorySessionStorage {
    /// Create storage with default retention.
    #[must_use]
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_TTL, DEFAULT_MAX_ENTRIES)
    }

    /// Create storage with explicit retention.
    #[must_use]
    pub fn with_retention(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemorySessionStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStorage for MemorySessionStorage {
    async fn save(&self, session: Arc<SessionLifecycle>) -> Result<(), StorageError> {
        let retained = Retained {
            expires_at: Instant::now() + self.ttl,
            session,
        };

        self.sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .insert(retained.session.id(), retained);

        Ok(())
    }

    async fn get(&self, id: SessionId) -> Result<Option<Arc<SessionLifecycle>>, StorageError> {
        let now = Instant::now();
        Ok(self
            .sessions
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(&id)
            .filter(|r| r.expires_at > now)
            .map(|r| Arc::clone(&r.session)))
    }

    async fn delete(&self, id: SessionId) -> Result<Option<Arc<SessionLifecycle>>, StorageError> {
        Ok(self
            .sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .remove(&id)
            .map(|r| r.session))
    }

    async fn list(&self) -> Result<Vec<Arc<SessionLifecycle>>, StorageError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let mut result: Vec<&Retained> = sessions.values().collect();
        // Oldest first
        result.sort_by_key(|r| r.expires_at);

        Ok(result.into_iter().map(|r| Arc::clone(&r.session)).collect())
    }

    async fn take_expired(&self) -> Result<Vec<Arc<SessionLifecycle>>, StorageError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let now = Instant::now();
        let mut expired: Vec<SessionId> = sessions
            .iter()
            .filter(|(_, r)| r.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        let live = sessions.len() - expired.len();
        if live > self.max_entries {
            let mut oldest: Vec<(&SessionId, &Retained)> = sessions
                .iter()
                .filter(|(_, r)| r.expires_at > now)
                .collect();
            oldest.sort_by_key(|(_, r)| r.expires_at);
            expired.extend(oldest.iter().take(live - self.max_entries).map(|(id, _)| **id));
        }

        Ok(expired
            .into_iter()
            .filter_map(|id| sessions.remove(&id))
            .map(|r| r.session)
            .collect())
    }
}
