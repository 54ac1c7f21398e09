//! Storage for disconnected sessions awaiting reconnection.

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "memory")]
pub use memory::MemorySessionStorage;

use std::sync::Arc;

use async_trait::async_trait;
use scriptview_core::SessionId;
use thiserror::Error;

use crate::SessionLifecycle;

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Trait for retained-session storage backends.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Retain a disconnected session.
    async fn save(&self, session: Arc<SessionLifecycle>) -> Result<(), StorageError>;

    /// Get a retained session by ID.
    async fn get(&self, id: SessionId) -> Result<Option<Arc<SessionLifecycle>>, StorageError>;

    /// Remove a retained session, returning it if present.
    async fn delete(&self, id: SessionId) -> Result<Option<Arc<SessionLifecycle>>, StorageError>;

    /// List retained sessions.
    async fn list(&self) -> Result<Vec<Arc<SessionLifecycle>>, StorageError>;

    /// Remove sessions no longer eligible for reconnection.
    async fn take_expired(&self) -> Result<Vec<Arc<SessionLifecycle>>, StorageError>;
}

#[async_trait]
impl<T: SessionStorage + ?Sized> SessionStorage for Box<T> {
    async fn save(&self, session: Arc<SessionLifecycle>) -> Result<(), StorageError> {
        (**self).save(session).await
    }

    async fn get(&self, id: SessionId) -> Result<Option<Arc<SessionLifecycle>>, StorageError> {
        (**self).get(id).await
    }

    async fn delete(&self, id: SessionId) -> Result<Option<Arc<SessionLifecycle>>, StorageError> {
        (**self).delete(id).await
    }

    async fn list(&self) -> Result<Vec<Arc<SessionLifecycle>>, StorageError> {
        (**self).list().await
    }

    async fn take_expired(&self) -> Result<Vec<Arc<SessionLifecycle>>, StorageError> {
        (**self).take_expired().await
    }
}
