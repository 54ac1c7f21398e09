//! Runtime coordinator: lifecycle state machine and dispatch loop.

use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use scriptview_core::{
    BackMsg, ClientError, Message, MessageCache, RerunRequest, ScriptContext,
    ScriptFinishedStatus, ScriptRunner, SessionClient, SessionId, SessionOutbox, SessionState,
    UserInfo,
};
use scriptview_session::{
    ActiveSessionInfo, MemorySessionStorage, RegistryError, SessionRegistry, SessionStorage,
};
use tokio::{
    sync::{Notify, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{RuntimeConfig, RuntimeState};

/// Set while a `Runtime` handle is alive in this process.
static INSTANCE_LIVE: AtomicBool = AtomicBool::new(false);

/// Runtime error.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Runtime stopped")]
    Stopped,
    #[error("Runtime already exists; only one may be live per process")]
    AlreadyExists,
    #[error("Runtime not started")]
    NotStarted,
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

struct InstanceGuard;

impl InstanceGuard {
    fn acquire() -> Result<Self, RuntimeError> {
        INSTANCE_LIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| Self)
            .map_err(|_| RuntimeError::AlreadyExists)
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        INSTANCE_LIVE.store(false, Ordering::SeqCst);
    }
}

struct Inner {
    config: RuntimeConfig,
    runner: Arc<dyn ScriptRunner>,
    registry: SessionRegistry<Box<dyn SessionStorage>>,
    message_cache: MessageCache,
    wakeup: Arc<Notify>,
    state: watch::Sender<RuntimeState>,
    must_stop: CancellationToken,
    /// Serializes dispatch ticks so each outbox has one consumer. Membership
    /// changes also take it, so a tick never sends to a session that has
    /// already left. Acquired before `sessions_lock`.
    dispatch_lock: tokio::sync::Mutex<()>,
    /// Serializes session membership changes with the state they imply.
    sessions_lock: tokio::sync::Mutex<()>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

/// Top-level coordinator owning the session registry and message cache.
///
/// At most one `Runtime` may be live per process; construct it explicitly and
/// pass it where needed.
pub struct Runtime {
    inner: Arc<Inner>,
    _instance: InstanceGuard,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("state", &self.state())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Create a runtime retaining disconnected sessions in memory.
    ///
    /// # Errors
    /// Returns `AlreadyExists` if another runtime is live.
    pub fn new(config: RuntimeConfig, runner: Arc<dyn ScriptRunner>) -> Result<Self, RuntimeError> {
        let storage = MemorySessionStorage::with_retention(
            config.disconnected_session_ttl(),
            config.max_retained_sessions,
        );
        Self::with_storage(config, runner, Box::new(storage))
    }

    /// Create a runtime with a custom retained-session store.
    ///
    /// # Errors
    /// Returns `AlreadyExists` if another runtime is live.
    pub fn with_storage(
        config: RuntimeConfig,
        runner: Arc<dyn ScriptRunner>,
        storage: Box<dyn SessionStorage>,
    ) -> Result<Self, RuntimeError> {
        let instance = InstanceGuard::acquire()?;
        let wakeup = Arc::new(Notify::new());
        let (state, _) = watch::channel(RuntimeState::Initial);

        let inner = Inner {
            registry: SessionRegistry::new(storage, Arc::clone(&runner), Arc::clone(&wakeup)),
            message_cache: MessageCache::new(config.cache_config()),
            config,
            runner,
            wakeup,
            state,
            must_stop: CancellationToken::new(),
            dispatch_lock: tokio::sync::Mutex::new(()),
            sessions_lock: tokio::sync::Mutex::new(()),
            loop_task: Mutex::new(None),
        };

        Ok(Self {
            inner: Arc::new(inner),
            _instance: instance,
        })
    }

    /// Whether a runtime is live in this process.
    #[must_use]
    pub fn exists() -> bool {
        INSTANCE_LIVE.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn state(&self) -> RuntimeState {
        *self.inner.state.borrow()
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn message_cache(&self) -> &MessageCache {
        &self.inner.message_cache
    }

    /// Start the dispatch loop. Must be called from within a Tokio runtime.
    ///
    /// # Panics
    /// Panics if the runtime was already started or stopped.
    pub fn start(&self) {
        assert_eq!(
            self.state(),
            RuntimeState::Initial,
            "Runtime::start called more than once"
        );
        self.inner.set_state(RuntimeState::NoSessionsConnected);

        let task = tokio::spawn(Arc::clone(&self.inner).run_loop());
        *self
            .inner
            .loop_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
        tracing::info!("runtime started");
    }

    /// Request shutdown. Sessions are closed asynchronously; await
    /// [`Self::stopped`] for completion.
    pub fn stop(&self) {
        match self.state() {
            RuntimeState::Stopping | RuntimeState::Stopped => {}
            RuntimeState::Initial => self.inner.set_state(RuntimeState::Stopped),
            RuntimeState::NoSessionsConnected | RuntimeState::OneOrMoreSessionsConnected => {
                tracing::info!("runtime stopping");
                self.inner.set_state(RuntimeState::Stopping);
                self.inner.must_stop.cancel();
            }
        }
    }

    /// Resolve once the runtime reaches `Stopped`.
    pub async fn stopped(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| *state == RuntimeState::Stopped).await;
    }

    /// Connect a client, returning its session ID.
    ///
    /// With `existing_session_id` naming a disconnected-retained session, that
    /// session is reactivated. `session_id_override` forces the new session's
    /// ID.
    ///
    /// # Errors
    /// Returns `Stopped` once stop was requested, `NotStarted` before start.
    ///
    /// # Panics
    /// Panics if both `existing_session_id` and `session_id_override` are set.
    pub async fn connect_session(
        &self,
        client: Arc<dyn SessionClient>,
        user_info: UserInfo,
        existing_session_id: Option<SessionId>,
        session_id_override: Option<SessionId>,
    ) -> Result<SessionId, RuntimeError> {
        match self.state() {
            RuntimeState::Initial => return Err(RuntimeError::NotStarted),
            state if state.is_stopping_or_stopped() => return Err(RuntimeError::Stopped),
            _ => {}
        }

        let _tick = self.inner.dispatch_lock.lock().await;
        let _sessions = self.inner.sessions_lock.lock().await;
        // Stop may have closed every session while we waited.
        if self.state().is_stopping_or_stopped() {
            return Err(RuntimeError::Stopped);
        }
        let connected = self
            .inner
            .registry
            .connect_session(client, user_info, existing_session_id, session_id_override)
            .await?;
        if let Some(replaced) = connected.replaced {
            // The new client holds none of the old client's payloads.
            self.inner.message_cache.drop_session_refs(replaced.id());
        }
        if connected.reconnected {
            // Deliver output queued while the client was away.
            self.inner.wakeup.notify_one();
        }
        self.inner.set_state(RuntimeState::OneOrMoreSessionsConnected);
        Ok(connected.id)
    }

    /// Deprecated alias for [`Self::connect_session`].
    ///
    /// # Errors
    /// Same as [`Self::connect_session`].
    #[deprecated(note = "use connect_session instead")]
    pub async fn create_session(
        &self,
        client: Arc<dyn SessionClient>,
        user_info: UserInfo,
    ) -> Result<SessionId, RuntimeError> {
        tracing::warn!("create_session is deprecated! Use connect_session instead.");
        self.connect_session(client, user_info, None, None).await
    }

    /// Disconnect a session, retaining it for reconnection.
    ///
    /// Unknown or already disconnected sessions are a no-op.
    ///
    /// # Errors
    /// Returns error only if retained-session storage fails.
    pub async fn disconnect_session(&self, session_id: SessionId) -> Result<(), RuntimeError> {
        let _tick = self.inner.dispatch_lock.lock().await;
        self.inner.disconnect_session(session_id).await
    }

    /// Close a session and release its resources.
    ///
    /// Unknown or already closed sessions are a no-op.
    ///
    /// # Errors
    /// Returns error only if retained-session storage fails.
    pub async fn close_session(&self, session_id: SessionId) -> Result<(), RuntimeError> {
        let _tick = self.inner.dispatch_lock.lock().await;
        let _sessions = self.inner.sessions_lock.lock().await;
        if let Some(session) = self.inner.registry.close_session(session_id).await? {
            self.inner.message_cache.drop_session_refs(session.id());
            self.inner.on_session_removed().await;
        }
        Ok(())
    }

    pub async fn is_active_session(&self, session_id: SessionId) -> bool {
        self.inner.registry.is_active_session(session_id).await
    }

    pub async fn num_active_sessions(&self) -> usize {
        self.inner.registry.num_active_sessions().await
    }

    /// Get an active session and its client.
    pub async fn get_active_session_info(&self, session_id: SessionId) -> Option<ActiveSessionInfo> {
        self.inner.registry.get_active_session_info(session_id).await
    }

    /// Route a client request to its session. Dropped if the session is not
    /// active.
    ///
    /// # Errors
    /// Returns `Stopped` once stop was requested.
    pub async fn handle_backmsg(&self, session_id: SessionId, msg: BackMsg) -> Result<(), RuntimeError> {
        if self.state().is_stopping_or_stopped() {
            return Err(RuntimeError::Stopped);
        }

        match self.inner.registry.get_active_session_info(session_id).await {
            Some(info) => info.session.handle_backmsg(msg),
            None => tracing::warn!(%session_id, "dropping back-message for inactive session"),
        }
        Ok(())
    }

    /// Report an undecodable client request to its session. Dropped if the
    /// session is not active.
    ///
    /// # Errors
    /// Returns `Stopped` once stop was requested.
    pub async fn handle_backmsg_deserialization_exception(
        &self,
        session_id: SessionId,
        error: impl fmt::Display + Send,
    ) -> Result<(), RuntimeError> {
        if self.state().is_stopping_or_stopped() {
            return Err(RuntimeError::Stopped);
        }

        match self.inner.registry.get_active_session_info(session_id).await {
            Some(info) => info.session.handle_backmsg_exception(error),
            None => {
                tracing::warn!(%session_id, "dropping back-message error for inactive session");
            }
        }
        Ok(())
    }

    /// Run one dispatch pass now, delivering everything currently queued.
    pub async fn flush_outboxes(&self) {
        self.inner.dispatch_pending().await;
    }

    /// Run the script once outside any session.
    ///
    /// Returns `(true, "ok")`, `(false, "error")`, or `(false, "timeout")`.
    pub async fn does_script_run_without_error(&self) -> (bool, &'static str) {
        let stop = CancellationToken::new();
        let ctx = ScriptContext::new(
            Uuid::new_v4(),
            Arc::new(SessionOutbox::new()),
            Arc::new(Notify::new()),
            Arc::new(SessionState::new()),
            Arc::new(UserInfo::default()),
        )
        .with_stop_token(stop.clone());

        let timeout = self.inner.config.script_check_timeout();
        let result = tokio::time::timeout(
            timeout,
            self.inner.runner.run(ctx, RerunRequest::default()),
        )
        .await;
        stop.cancel();

        match result {
            Err(_) => (false, "timeout"),
            Ok(Ok(ScriptFinishedStatus::FinishedWithCompileError) | Err(_)) => (false, "error"),
            Ok(Ok(_)) => (true, "ok"),
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.inner.must_stop.cancel();
        if let Some(task) = self
            .inner
            .loop_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

impl Inner {
    fn set_state(&self, next: RuntimeState) {
        self.state.send_if_modified(|state| {
            if *state == next || !state.can_transition_to(next) {
                return false;
            }
            tracing::debug!(from = ?*state, to = ?next, "runtime state change");
            *state = next;
            true
        });
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                biased;
                () = self.must_stop.cancelled() => break,
                () = self.wakeup.notified() => {}
            }
            self.dispatch_pending().await;
        }

        self.close_all_sessions().await;
        self.set_state(RuntimeState::Stopped);
        tracing::info!("runtime stopped");
    }

    async fn dispatch_pending(&self) {
        let _tick = self.dispatch_lock.lock().await;

        for info in self.registry.list_active_sessions().await {
            let mut batch = info.session.outbox().drain().into_iter();
            while let Some(msg) = batch.next() {
                if let Err(e) = self.send_message(&info, msg.clone()).await {
                    tracing::warn!(session_id = %info.id(), error = %e, "client gone during dispatch");
                    // Undelivered output waits for a reconnecting client.
                    info.session
                        .outbox()
                        .restore(std::iter::once(msg).chain(batch).collect());
                    if let Err(e) = self.disconnect_session(info.id()).await {
                        tracing::error!(session_id = %info.id(), error = %e, "failed to disconnect session");
                    }
                    break;
                }
            }
        }
    }

    async fn send_message(&self, info: &ActiveSessionInfo, msg: Message) -> Result<(), ClientError> {
        let cacheable = msg.payload_len() >= self.config.min_cached_message_size;
        let msg = msg.with_cacheable(cacheable);
        let finished = msg.finished_status();

        let outgoing = self.message_cache.prepare_for_send(info.id(), msg);
        info.client.write_message(outgoing).await?;

        if let Some(status) = finished {
            let evicted = self.message_cache.advance_run(status.run_kind());
            if evicted > 0 {
                tracing::debug!(evicted, status = status.as_str(), "evicted expired cache entries");
            }
        }
        Ok(())
    }

    /// Caller must hold `dispatch_lock`.
    async fn disconnect_session(&self, session_id: SessionId) -> Result<(), RuntimeError> {
        let _sessions = self.sessions_lock.lock().await;
        if let Some(session) = self.registry.disconnect_session(session_id).await? {
            // A reconnecting client starts with an empty cache.
            self.message_cache.drop_session_refs(session.id());
            self.on_session_removed().await;
        }
        Ok(())
    }

    /// Caller must hold `sessions_lock`.
    async fn on_session_removed(&self) {
        if self.registry.num_active_sessions().await == 0 {
            self.set_state(RuntimeState::NoSessionsConnected);
        }
    }

    async fn close_all_sessions(&self) {
        let _tick = self.dispatch_lock.lock().await;
        let _sessions = self.sessions_lock.lock().await;
        let closed = match self.registry.close_all().await {
            Ok(closed) => closed,
            Err(e) => {
                tracing::error!(error = %e, "failed to close sessions on stop");
                return;
            }
        };

        for session in closed {
            self.message_cache.drop_session_refs(session.id());
            session.closed().await;
        }
    }
}
