//! Producer-side context for script runs.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{Message, SessionOutbox, traits::SessionId};

/// Information about the user behind a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserInfo {
    /// Email address, when the transport knows it.
    #[serde(default)]
    pub email: Option<String>,

    /// Arbitrary metadata for app-specific needs.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl UserInfo {
    /// Create user info with just an email.
    #[must_use]
    pub fn with_email(email: impl Into<String>) -> Self {
        Self {
            email: Some(email.into()),
            metadata: HashMap::new(),
        }
    }

    /// Get a metadata value by key.
    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Set a metadata value.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }
}

/// Script-visible session variables.
///
/// Shared between the session's run and its teardown path, so every access is
/// serialized.
#[derive(Debug, Default)]
pub struct SessionState {
    values: Mutex<HashMap<String, Value>>,
}

impl SessionState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.lock().insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.lock().remove(key)
    }

    /// Apply widget values reported with a rerun request.
    pub fn merge_widget_states(&self, widget_states: &Map<String, Value>) {
        let mut values = self.lock();
        for (key, value) in widget_states {
            values.insert(key.clone(), value.clone());
        }
    }

    /// Copy of every variable.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Everything a script run may touch, passed explicitly into each run.
#[derive(Clone)]
pub struct ScriptContext {
    session_id: SessionId,
    outbox: Arc<SessionOutbox>,
    wakeup: Arc<Notify>,
    state: Arc<SessionState>,
    user_info: Arc<UserInfo>,
    stop: CancellationToken,
}

impl ScriptContext {
    /// Create a context feeding `outbox`.
    ///
    /// `wakeup` is notified on every enqueue so the dispatch loop can drain.
    #[must_use]
    pub fn new(
        session_id: SessionId,
        outbox: Arc<SessionOutbox>,
        wakeup: Arc<Notify>,
        state: Arc<SessionState>,
        user_info: Arc<UserInfo>,
    ) -> Self {
        Self {
            session_id,
            outbox,
            wakeup,
            state,
            user_info,
            stop: CancellationToken::new(),
        }
    }

    /// Use `stop` as this run's stop signal.
    #[must_use]
    pub fn with_stop_token(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    #[must_use]
    pub fn user_info(&self) -> &UserInfo {
        &self.user_info
    }

    #[must_use]
    pub fn session_state(&self) -> &SessionState {
        &self.state
    }

    /// Queue a message for this session's client.
    pub fn enqueue(&self, msg: Message) {
        self.outbox.enqueue(msg);
        self.wakeup.notify_one();
    }

    /// Whether the run has been asked to stop.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Wait until the run is asked to stop.
    pub async fn stopped(&self) {
        self.stop.cancelled().await;
    }
}
