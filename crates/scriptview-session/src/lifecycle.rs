//! Per-session script execution and back-message handling.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use scriptview_core::{
    BackMsg, Message, RerunRequest, ScriptContext, ScriptError, ScriptFinishedStatus,
    ScriptRunner, SessionId, SessionOutbox, SessionState, UserInfo,
};
use tokio::{
    sync::{Notify, mpsc},
    task::{JoinError, JoinHandle},
};
use tokio_util::sync::CancellationToken;

/// How long a preempted run may take to observe its stop signal.
const RUN_STOP_GRACE: Duration = Duration::from_secs(2);

enum LifecycleEvent {
    BackMsg(BackMsg),
    BackMsgError(String),
}

struct ActiveRun {
    stop: CancellationToken,
    handle: JoinHandle<Result<ScriptFinishedStatus, ScriptError>>,
}

/// One session's script-execution context.
///
/// Owns a long-lived worker task that serializes back-messages and at most one
/// in-flight script run. Output flows only into this session's outbox.
pub struct SessionLifecycle {
    id: SessionId,
    outbox: Arc<SessionOutbox>,
    state: Arc<SessionState>,
    user_info: Arc<UserInfo>,
    events: mpsc::UnboundedSender<LifecycleEvent>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for SessionLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLifecycle")
            .field("id", &self.id)
            .field("pending", &self.outbox.len())
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl SessionLifecycle {
    /// Start a session. Must be called from within a Tokio runtime.
    ///
    /// `wakeup` is notified whenever the session queues output.
    #[must_use]
    pub fn start(
        id: SessionId,
        runner: Arc<dyn ScriptRunner>,
        user_info: UserInfo,
        wakeup: Arc<Notify>,
    ) -> Self {
        let outbox = Arc::new(SessionOutbox::new());
        let state = Arc::new(SessionState::new());
        let user_info = Arc::new(user_info);
        let shutdown = CancellationToken::new();
        let (events, events_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            ctx: ScriptContext::new(
                id,
                Arc::clone(&outbox),
                wakeup,
                Arc::clone(&state),
                Arc::clone(&user_info),
            ),
            runner,
            shutdown: shutdown.clone(),
            events: events_rx,
        };
        let task = tokio::spawn(worker.run());

        Self {
            id,
            outbox,
            state,
            user_info,
            events,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Pending output for this session.
    #[must_use]
    pub fn outbox(&self) -> &Arc<SessionOutbox> {
        &self.outbox
    }

    #[must_use]
    pub fn session_state(&self) -> &Arc<SessionState> {
        &self.state
    }

    #[must_use]
    pub fn user_info(&self) -> &UserInfo {
        &self.user_info
    }

    /// Route a client request to this session.
    pub fn handle_backmsg(&self, msg: BackMsg) {
        if self.events.send(LifecycleEvent::BackMsg(msg)).is_err() {
            tracing::debug!(session_id = %self.id, "dropping back-message for closed session");
        }
    }

    /// Report a client request that could not be decoded.
    pub fn handle_backmsg_exception(&self, error: impl fmt::Display) {
        let event = LifecycleEvent::BackMsgError(error.to_string());
        if self.events.send(event).is_err() {
            tracing::debug!(session_id = %self.id, "dropping back-message error for closed session");
        }
    }

    /// Stop the worker and any in-flight run, releasing pending output.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.outbox.clear();
        self.state.clear();
        tracing::debug!(session_id = %self.id, "session shut down");
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait for the worker task to exit after [`Self::shutdown`].
    pub async fn closed(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for SessionLifecycle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Worker {
    ctx: ScriptContext,
    runner: Arc<dyn ScriptRunner>,
    shutdown: CancellationToken,
    events: mpsc::UnboundedReceiver<LifecycleEvent>,
}

impl Worker {
    async fn run(mut self) {
        let mut current: Option<ActiveRun> = None;

        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                result = join_run(&mut current) => {
                    current = None;
                    self.finish_run(result);
                }
                event = self.events.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        LifecycleEvent::BackMsg(BackMsg::RerunScript(request)) => {
                            if let Some(run) = current.take() {
                                self.preempt(run).await;
                            }
                            current = Some(self.start_run(request));
                        }
                        LifecycleEvent::BackMsg(BackMsg::StopScript) => {
                            if let Some(run) = &current {
                                run.stop.cancel();
                            }
                        }
                        LifecycleEvent::BackMsg(BackMsg::ClearCache) => {
                            self.ctx.session_state().clear();
                        }
                        LifecycleEvent::BackMsg(BackMsg::AppHeartbeat) => {}
                        LifecycleEvent::BackMsgError(error) => {
                            tracing::warn!(session_id = %self.ctx.session_id(), %error, "bad back-message");
                            self.ctx.enqueue(Message::exception(error));
                        }
                    }
                }
            }
        }

        // Force-close whatever is still running.
        if let Some(run) = current {
            run.stop.cancel();
            run.handle.abort();
        }
    }

    fn start_run(&self, request: RerunRequest) -> ActiveRun {
        self.ctx
            .session_state()
            .merge_widget_states(&request.widget_states);

        let stop = self.shutdown.child_token();
        let ctx = self.ctx.clone().with_stop_token(stop.clone());
        let runner = Arc::clone(&self.runner);
        let handle = tokio::spawn(async move { runner.run(ctx, request).await });
        ActiveRun { stop, handle }
    }

    async fn preempt(&self, mut run: ActiveRun) {
        run.stop.cancel();
        if tokio::time::timeout(RUN_STOP_GRACE, &mut run.handle)
            .await
            .is_err()
        {
            tracing::warn!(session_id = %self.ctx.session_id(), "script run ignored stop signal, aborting");
            run.handle.abort();
        }
        self.ctx
            .enqueue(Message::script_finished(ScriptFinishedStatus::FinishedEarlyForRerun));
    }

    fn finish_run(&self, result: Result<Result<ScriptFinishedStatus, ScriptError>, JoinError>) {
        let status = match result {
            Ok(Ok(status)) => status,
            Ok(Err(ScriptError::Cancelled)) => ScriptFinishedStatus::FinishedSuccessfully,
            Ok(Err(ScriptError::Failed(error))) => {
                self.ctx.enqueue(Message::exception(error));
                ScriptFinishedStatus::FinishedSuccessfully
            }
            Err(e) => {
                self.ctx.enqueue(Message::exception(format!("Script run panicked: {e}")));
                ScriptFinishedStatus::FinishedSuccessfully
            }
        };
        self.ctx.enqueue(Message::script_finished(status));
    }
}

async fn join_run(
    current: &mut Option<ActiveRun>,
) -> Result<Result<ScriptFinishedStatus, ScriptError>, JoinError> {
    match current {
        Some(run) => (&mut run.handle).await,
        None => std::future::pending().await,
    }
}
