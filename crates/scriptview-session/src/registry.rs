//! Registry of active and disconnected-retained sessions.

use std::{collections::HashMap, sync::Arc};

use scriptview_core::{ScriptRunner, SessionClient, SessionId, UserInfo};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock};
use uuid::Uuid;

use crate::{
    SessionLifecycle,
    storage::{SessionStorage, StorageError},
};

/// Registry error.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Connected and receiving output.
    Active,
    /// Client gone, state retained for reconnection.
    Disconnected,
    /// Resources released.
    Closed,
}

/// A connected session and the client it delivers to.
#[derive(Clone)]
pub struct ActiveSessionInfo {
    pub session: Arc<SessionLifecycle>,
    pub client: Arc<dyn SessionClient>,
}

impl ActiveSessionInfo {
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.session.id()
    }
}

/// Outcome of [`SessionRegistry::connect_session`].
#[derive(Debug)]
pub struct ConnectedSession {
    pub id: SessionId,
    /// Whether a retained session was reactivated.
    pub reconnected: bool,
    /// Session shut down because its ID was taken over by the override.
    pub replaced: Option<Arc<SessionLifecycle>>,
}

/// Registry view of any known session.
#[derive(Clone)]
pub struct SessionRecord {
    pub session: Arc<SessionLifecycle>,
    pub client: Option<Arc<dyn SessionClient>>,
    pub status: SessionStatus,
}

impl SessionRecord {
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.session.id()
    }
}

/// Maps session IDs to their lifecycles and clients.
pub struct SessionRegistry<S>
where
    S: SessionStorage,
{
    storage: S,
    runner: Arc<dyn ScriptRunner>,
    wakeup: Arc<Notify>,
    active_sessions: RwLock<HashMap<SessionId, ActiveSessionInfo>>,
}

impl<S> SessionRegistry<S>
where
    S: SessionStorage,
{
    /// Create a new registry.
    ///
    /// Sessions it creates run scripts with `runner` and notify `wakeup`
    /// whenever they queue output.
    #[must_use]
    pub fn new(storage: S, runner: Arc<dyn ScriptRunner>, wakeup: Arc<Notify>) -> Self {
        Self {
            storage,
            runner,
            wakeup,
            active_sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Connect a client, reusing a retained session when possible.
    ///
    /// # Panics
    /// Panics if both `existing_session_id` and `session_id_override` are set.
    pub async fn connect_session(
        &self,
        client: Arc<dyn SessionClient>,
        user_info: UserInfo,
        existing_session_id: Option<SessionId>,
        session_id_override: Option<SessionId>,
    ) -> Result<ConnectedSession, RegistryError> {
        assert!(
            existing_session_id.is_none() || session_id_override.is_none(),
            "Only one of existing_session_id and session_id_override may be set"
        );

        self.close_expired().await?;
        let mut active = self.active_sessions.write().await;

        if let Some(existing_id) = existing_session_id {
            if active.contains_key(&existing_id) {
                tracing::warn!(
                    session_id = %existing_id,
                    "session is already connected, connecting to a new session"
                );
            } else if let Some(session) = self.storage.delete(existing_id).await? {
                tracing::info!(session_id = %existing_id, "session reconnected");
                active.insert(existing_id, ActiveSessionInfo { session, client });
                return Ok(ConnectedSession {
                    id: existing_id,
                    reconnected: true,
                    replaced: None,
                });
            }
        }

        let session_id = session_id_override.unwrap_or_else(Uuid::new_v4);
        let session = Arc::new(SessionLifecycle::start(
            session_id,
            Arc::clone(&self.runner),
            user_info,
            Arc::clone(&self.wakeup),
        ));

        let replaced = match active.insert(session_id, ActiveSessionInfo { session, client }) {
            Some(previous) => Some(previous.session),
            None => self.storage.delete(session_id).await?,
        };
        if let Some(previous) = &replaced {
            tracing::warn!(%session_id, "session id override replaced an existing session");
            previous.shutdown();
        }

        tracing::info!(%session_id, "session connected");
        Ok(ConnectedSession {
            id: session_id,
            reconnected: false,
            replaced,
        })
    }

    /// Move an active session to retained storage.
    ///
    /// Returns the session if it was active; unknown or already
    /// disconnected IDs are a no-op.
    pub async fn disconnect_session(
        &self,
        session_id: SessionId,
    ) -> Result<Option<Arc<SessionLifecycle>>, RegistryError> {
        let removed = self.active_sessions.write().await.remove(&session_id);
        let Some(info) = removed else {
            return Ok(None);
        };

        self.storage.save(Arc::clone(&info.session)).await?;
        tracing::info!(%session_id, "session disconnected");
        self.close_expired().await?;
        Ok(Some(info.session))
    }

    /// Close a session and release its resources.
    ///
    /// Returns the session if it was known; unknown or already closed IDs are
    /// a no-op.
    pub async fn close_session(
        &self,
        session_id: SessionId,
    ) -> Result<Option<Arc<SessionLifecycle>>, RegistryError> {
        let active = self
            .active_sessions
            .write()
            .await
            .remove(&session_id)
            .map(|info| info.session);

        let session = match active {
            Some(session) => Some(session),
            None => self.storage.delete(session_id).await?,
        };

        if let Some(session) = &session {
            session.shutdown();
            tracing::info!(%session_id, "session closed");
        }
        Ok(session)
    }

    /// Close every session, active and retained.
    pub async fn close_all(&self) -> Result<Vec<Arc<SessionLifecycle>>, RegistryError> {
        let mut closed: Vec<Arc<SessionLifecycle>> = self
            .active_sessions
            .write()
            .await
            .drain()
            .map(|(_, info)| info.session)
            .collect();

        for session in self.storage.list().await? {
            if let Some(session) = self.storage.delete(session.id()).await? {
                closed.push(session);
            }
        }

        for session in &closed {
            session.shutdown();
        }
        Ok(closed)
    }

    /// Close retained sessions that are no longer eligible for reconnection.
    async fn close_expired(&self) -> Result<(), RegistryError> {
        for session in self.storage.take_expired().await? {
            tracing::debug!(session_id = %session.id(), "retained session expired");
            session.shutdown();
        }
        Ok(())
    }

    /// Get an active session.
    pub async fn get_active_session_info(&self, session_id: SessionId) -> Option<ActiveSessionInfo> {
        self.active_sessions.read().await.get(&session_id).cloned()
    }

    /// Get an active or retained session.
    pub async fn get_session_info(
        &self,
        session_id: SessionId,
    ) -> Result<Option<SessionRecord>, RegistryError> {
        if let Some(info) = self.get_active_session_info(session_id).await {
            return Ok(Some(SessionRecord {
                session: info.session,
                client: Some(info.client),
                status: SessionStatus::Active,
            }));
        }

        Ok(self
            .storage
            .get(session_id)
            .await?
            .map(|session| SessionRecord {
                session,
                client: None,
                status: SessionStatus::Disconnected,
            }))
    }

    pub async fn is_active_session(&self, session_id: SessionId) -> bool {
        self.active_sessions.read().await.contains_key(&session_id)
    }

    /// Snapshot of active sessions.
    pub async fn list_active_sessions(&self) -> Vec<ActiveSessionInfo> {
        self.active_sessions.read().await.values().cloned().collect()
    }

    /// Snapshot of every known session.
    pub async fn list_sessions(&self) -> Result<Vec<SessionRecord>, RegistryError> {
        let mut records: Vec<SessionRecord> = self
            .list_active_sessions()
            .await
            .into_iter()
            .map(|info| SessionRecord {
                session: info.session,
                client: Some(info.client),
                status: SessionStatus::Active,
            })
            .collect();

        records.extend(self.storage.list().await?.into_iter().map(|session| {
            SessionRecord {
                session,
                client: None,
                status: SessionStatus::Disconnected,
            }
        }));
        Ok(records)
    }

    pub async fn num_active_sessions(&self) -> usize {
        self.active_sessions.read().await.len()
    }
}
