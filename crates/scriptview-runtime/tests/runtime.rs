//! Coordinator behavior: lifecycle, dispatch, caching.

use std::{
    ops::Deref,
    sync::{
        Arc, LazyLock, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use scriptview_core::{
    BackMsg, ClientError, Message, MessageBody, RerunRequest, ScriptContext, ScriptError,
    ScriptFinishedStatus, ScriptRunner, SessionClient, SessionId, UserInfo,
};
use scriptview_runtime::{Runtime, RuntimeConfig, RuntimeError, RuntimeState};
use tokio::sync::Notify;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

/// Only one runtime may be live per process.
static RUNTIME_LOCK: LazyLock<tokio::sync::Mutex<()>> =
    LazyLock::new(|| tokio::sync::Mutex::new(()));

struct Fixture {
    runtime: Runtime,
    _lock: tokio::sync::MutexGuard<'static, ()>,
}

impl Deref for Fixture {
    type Target = Runtime;

    fn deref(&self) -> &Runtime {
        &self.runtime
    }
}

async fn fixture_with(config: RuntimeConfig, runner: impl ScriptRunner + 'static) -> Fixture {
    let lock = RUNTIME_LOCK.lock().await;
    let runtime = Runtime::new(config, Arc::new(runner)).unwrap();
    Fixture {
        runtime,
        _lock: lock,
    }
}

async fn started_with(config: RuntimeConfig, runner: impl ScriptRunner + 'static) -> Fixture {
    let fixture = fixture_with(config, runner).await;
    fixture.start();
    fixture
}

async fn started() -> Fixture {
    started_with(RuntimeConfig::default(), EmitRunner).await
}

fn caching_config(max_age: u32, include_fragment_runs: bool) -> RuntimeConfig {
    RuntimeConfig {
        min_cached_message_size: 0,
        max_cached_message_age: max_age,
        include_fragment_runs_in_cache_age_count: include_fragment_runs,
        ..RuntimeConfig::default()
    }
}

/// Captures every delivered message.
#[derive(Default)]
struct RecordingClient {
    messages: Mutex<Vec<Message>>,
    gone: AtomicBool,
}

impl RecordingClient {
    fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    fn pop(&self) -> Option<Message> {
        self.messages.lock().unwrap().pop()
    }

    fn hang_up(&self) {
        self.gone.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionClient for RecordingClient {
    async fn write_message(&self, msg: Message) -> Result<(), ClientError> {
        if self.gone.load(Ordering::SeqCst) {
            return Err(ClientError::Disconnected);
        }
        self.messages.lock().unwrap().push(msg);
        Ok(())
    }
}

/// Holds its first write until released.
#[derive(Default)]
struct GatedClient {
    delivered: RecordingClient,
    held: AtomicBool,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl SessionClient for GatedClient {
    async fn write_message(&self, msg: Message) -> Result<(), ClientError> {
        if !self.held.swap(true, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.delivered.write_message(msg).await
    }
}

fn finished_runs(client: &RecordingClient) -> usize {
    client
        .messages()
        .iter()
        .filter(|m| m.finished_status().is_some())
        .count()
}

/// Emits one delta per run.
struct EmitRunner;

#[async_trait]
impl ScriptRunner for EmitRunner {
    async fn run(
        &self,
        ctx: ScriptContext,
        _request: RerunRequest,
    ) -> Result<ScriptFinishedStatus, ScriptError> {
        ctx.enqueue(Message::delta(&b"hello"[..], vec![0, 0]));
        Ok(ScriptFinishedStatus::FinishedSuccessfully)
    }
}

/// Runs until stopped.
struct BlockingRunner;

#[async_trait]
impl ScriptRunner for BlockingRunner {
    async fn run(
        &self,
        ctx: ScriptContext,
        _request: RerunRequest,
    ) -> Result<ScriptFinishedStatus, ScriptError> {
        ctx.stopped().await;
        Err(ScriptError::Cancelled)
    }
}

struct CompileErrorRunner;

#[async_trait]
impl ScriptRunner for CompileErrorRunner {
    async fn run(
        &self,
        _ctx: ScriptContext,
        _request: RerunRequest,
    ) -> Result<ScriptFinishedStatus, ScriptError> {
        Ok(ScriptFinishedStatus::FinishedWithCompileError)
    }
}

fn dataframe(values: &str, path: u32) -> Message {
    Message::delta(values.as_bytes().to_vec(), vec![0, path])
}

async fn connect(runtime: &Runtime, client: &Arc<RecordingClient>) -> SessionId {
    runtime
        .connect_session(
            Arc::clone(client) as Arc<dyn SessionClient>,
            UserInfo::default(),
            None,
            None,
        )
        .await
        .unwrap()
}

/// Queue a message as the session's script would, then dispatch.
async fn send(runtime: &Runtime, session_id: SessionId, msg: Message) {
    runtime
        .get_active_session_info(session_id)
        .await
        .unwrap()
        .session
        .outbox()
        .enqueue(msg);
    runtime.flush_outboxes().await;
}

async fn finish_script(runtime: &Runtime, session_id: SessionId, status: ScriptFinishedStatus) {
    send(runtime, session_id, Message::script_finished(status)).await;
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_single_live_instance() {
    let _lock = RUNTIME_LOCK.lock().await;
    assert!(!Runtime::exists());

    let first = Runtime::new(RuntimeConfig::default(), Arc::new(EmitRunner)).unwrap();
    assert!(Runtime::exists());
    assert!(matches!(
        Runtime::new(RuntimeConfig::default(), Arc::new(EmitRunner)),
        Err(RuntimeError::AlreadyExists)
    ));

    drop(first);
    assert!(!Runtime::exists());
    let second = assert_ok!(Runtime::new(RuntimeConfig::default(), Arc::new(EmitRunner)));
    drop(second);
}

#[tokio::test]
async fn test_start_stop() {
    let runtime = fixture_with(RuntimeConfig::default(), EmitRunner).await;
    assert_eq!(runtime.state(), RuntimeState::Initial);

    runtime.start();
    assert_eq!(runtime.state(), RuntimeState::NoSessionsConnected);

    runtime.stop();
    assert_eq!(runtime.state(), RuntimeState::Stopping);

    runtime.stopped().await;
    assert_eq!(runtime.state(), RuntimeState::Stopped);

    // Stopping again is a no-op.
    runtime.stop();
    assert_eq!(runtime.state(), RuntimeState::Stopped);
}

#[tokio::test]
#[should_panic(expected = "Runtime::start called more than once")]
async fn test_start_twice_panics() {
    let runtime = started().await;
    runtime.start();
}

#[tokio::test]
async fn test_stop_before_start() {
    let runtime = fixture_with(RuntimeConfig::default(), EmitRunner).await;
    runtime.stop();
    assert_eq!(runtime.state(), RuntimeState::Stopped);
    runtime.stopped().await;
}

#[tokio::test]
async fn test_connect_before_start() {
    let runtime = fixture_with(RuntimeConfig::default(), EmitRunner).await;
    let client = Arc::new(RecordingClient::default());
    let result = runtime
        .connect_session(client, UserInfo::default(), None, None)
        .await;
    assert!(matches!(result, Err(RuntimeError::NotStarted)));
}

#[tokio::test]
async fn test_connect_session() {
    let runtime = started().await;
    let client = Arc::new(RecordingClient::default());

    let session_id = connect(&runtime, &client).await;
    assert_eq!(runtime.state(), RuntimeState::OneOrMoreSessionsConnected);

    assert_ok!(runtime.disconnect_session(session_id).await);
    assert_eq!(runtime.state(), RuntimeState::NoSessionsConnected);
}

#[tokio::test]
#[should_panic(expected = "Only one of existing_session_id and session_id_override")]
async fn test_connect_session_with_both_session_ids_panics() {
    let runtime = started().await;
    let _ = runtime
        .connect_session(
            Arc::new(RecordingClient::default()),
            UserInfo::default(),
            Some(Uuid::new_v4()),
            Some(Uuid::new_v4()),
        )
        .await;
}

#[tokio::test]
async fn test_reconnect_with_existing_session_id() {
    let runtime = started().await;
    let client = Arc::new(RecordingClient::default());
    let session_id = connect(&runtime, &client).await;
    assert_ok!(runtime.disconnect_session(session_id).await);

    let new_client = Arc::new(RecordingClient::default());
    let reconnected = runtime
        .connect_session(new_client, UserInfo::default(), Some(session_id), None)
        .await
        .unwrap();
    assert_eq!(reconnected, session_id);
    assert!(runtime.is_active_session(session_id).await);
    assert_eq!(runtime.state(), RuntimeState::OneOrMoreSessionsConnected);
}

#[tokio::test]
async fn test_session_id_override() {
    let runtime = started().await;
    let wanted = Uuid::new_v4();
    let session_id = runtime
        .connect_session(
            Arc::new(RecordingClient::default()),
            UserInfo::default(),
            None,
            Some(wanted),
        )
        .await
        .unwrap();
    assert_eq!(session_id, wanted);
}

#[tokio::test]
#[allow(deprecated)]
async fn test_create_session_alias() {
    let runtime = started().await;
    let session_id = runtime
        .create_session(Arc::new(RecordingClient::default()), UserInfo::default())
        .await
        .unwrap();
    assert!(runtime.is_active_session(session_id).await);
}

#[tokio::test]
async fn test_multiple_sessions() {
    let runtime = started().await;
    let client = Arc::new(RecordingClient::default());

    let mut session_ids = Vec::new();
    for _ in 0..3 {
        session_ids.push(connect(&runtime, &client).await);
        assert_eq!(runtime.state(), RuntimeState::OneOrMoreSessionsConnected);
    }

    for (i, session_id) in session_ids.iter().enumerate() {
        assert_ok!(runtime.disconnect_session(*session_id).await);
        let expected = if i == session_ids.len() - 1 {
            RuntimeState::NoSessionsConnected
        } else {
            RuntimeState::OneOrMoreSessionsConnected
        };
        assert_eq!(runtime.state(), expected);
    }
}

#[tokio::test]
async fn test_state_tracks_connected_sessions() {
    let runtime = started().await;
    let client = Arc::new(RecordingClient::default());
    let mut connected: Vec<SessionId> = Vec::new();

    // Deterministic mix of connects, disconnects and closes.
    for step in 0..40_u32 {
        match step % 5 {
            0 | 1 | 3 => connected.push(connect(&runtime, &client).await),
            2 => {
                if let Some(id) = connected.pop() {
                    assert_ok!(runtime.disconnect_session(id).await);
                }
            }
            _ => {
                while let Some(id) = connected.pop() {
                    assert_ok!(runtime.close_session(id).await);
                }
            }
        }

        let expected = if connected.is_empty() {
            RuntimeState::NoSessionsConnected
        } else {
            RuntimeState::OneOrMoreSessionsConnected
        };
        assert_eq!(runtime.state(), expected, "after step {step}");
        assert_eq!(runtime.num_active_sessions().await, connected.len());
    }
}

#[tokio::test]
async fn test_disconnect_invalid_session() {
    let runtime = started().await;
    assert_ok!(runtime.disconnect_session(Uuid::new_v4()).await);
    assert_eq!(runtime.state(), RuntimeState::NoSessionsConnected);

    let client = Arc::new(RecordingClient::default());
    let session_id = connect(&runtime, &client).await;
    assert_ok!(runtime.disconnect_session(session_id).await);
    assert_ok!(runtime.disconnect_session(session_id).await);
    assert_eq!(runtime.state(), RuntimeState::NoSessionsConnected);
}

#[tokio::test]
async fn test_close_invalid_session() {
    let runtime = started().await;
    assert_ok!(runtime.close_session(Uuid::new_v4()).await);

    let client = Arc::new(RecordingClient::default());
    let session_id = connect(&runtime, &client).await;
    assert_ok!(runtime.close_session(session_id).await);
    assert_ok!(runtime.close_session(session_id).await);
    assert_eq!(runtime.state(), RuntimeState::NoSessionsConnected);
}

#[tokio::test]
async fn test_is_active_session() {
    let runtime = started().await;
    let client = Arc::new(RecordingClient::default());
    let session_id = connect(&runtime, &client).await;

    assert!(runtime.is_active_session(session_id).await);
    assert!(!runtime.is_active_session(Uuid::new_v4()).await);

    assert_ok!(runtime.disconnect_session(session_id).await);
    assert!(!runtime.is_active_session(session_id).await);
}

#[tokio::test]
async fn test_disconnect_and_close_drop_cache_refs() {
    let runtime = started_with(caching_config(2, false), EmitRunner).await;
    let client = Arc::new(RecordingClient::default());
    let msg = dataframe("[1, 2, 3]", 1);

    let a = connect(&runtime, &client).await;
    send(&runtime, a, msg.clone()).await;
    assert!(runtime.message_cache().has_message_reference(msg.hash(), a));
    assert_ok!(runtime.disconnect_session(a).await);
    assert!(!runtime.message_cache().has_message_reference(msg.hash(), a));

    let b = connect(&runtime, &client).await;
    send(&runtime, b, msg.clone()).await;
    assert_ok!(runtime.close_session(b).await);
    assert!(!runtime.message_cache().has_message_reference(msg.hash(), b));

    // Dropping references never evicts.
    assert!(runtime.message_cache().get_message(msg.hash()).is_some());
}

#[tokio::test]
async fn test_closes_sessions_on_stop() {
    let runtime = started_with(RuntimeConfig::default(), BlockingRunner).await;
    let client = Arc::new(RecordingClient::default());

    let mut sessions = Vec::new();
    for _ in 0..3 {
        let session_id = connect(&runtime, &client).await;
        assert_ok!(
            runtime
                .handle_backmsg(session_id, BackMsg::RerunScript(RerunRequest::default()))
                .await
        );
        sessions.push(runtime.get_active_session_info(session_id).await.unwrap().session);
    }

    runtime.stop();
    tokio::time::timeout(Duration::from_secs(5), runtime.stopped())
        .await
        .unwrap();

    assert_eq!(runtime.state(), RuntimeState::Stopped);
    assert_eq!(runtime.num_active_sessions().await, 0);
    assert!(sessions.iter().all(|s| s.is_shutdown()));
}

#[tokio::test]
async fn test_handle_backmsg() {
    let runtime = started().await;
    let client = Arc::new(RecordingClient::default());
    let session_id = connect(&runtime, &client).await;

    assert_ok!(
        runtime
            .handle_backmsg(session_id, BackMsg::RerunScript(RerunRequest::default()))
            .await
    );

    // The dispatch loop delivers the run's output on its own.
    eventually(|| client.messages().len() == 2).await;
    let received = client.messages();
    assert_eq!(received[0], Message::delta(&b"hello"[..], vec![0, 0]));
    assert_eq!(
        received[1].finished_status(),
        Some(ScriptFinishedStatus::FinishedSuccessfully)
    );
}

#[tokio::test]
async fn test_handle_backmsg_invalid_session() {
    let runtime = started().await;
    assert_ok!(
        runtime
            .handle_backmsg(Uuid::new_v4(), BackMsg::AppHeartbeat)
            .await
    );
}

#[tokio::test]
async fn test_handle_backmsg_deserialization_exception() {
    let runtime = started().await;
    let client = Arc::new(RecordingClient::default());
    let session_id = connect(&runtime, &client).await;

    assert_ok!(
        runtime
            .handle_backmsg_deserialization_exception(session_id, "unknown variant `explode`")
            .await
    );

    eventually(|| !client.messages().is_empty()).await;
    assert!(matches!(
        client.messages()[0].body(),
        MessageBody::Exception { message } if message.contains("explode")
    ));
}

#[tokio::test]
async fn test_handle_backmsg_exception_invalid_session() {
    let runtime = started().await;
    assert_ok!(
        runtime
            .handle_backmsg_deserialization_exception(Uuid::new_v4(), "bad")
            .await
    );
}

#[tokio::test]
async fn test_connect_session_after_stop() {
    let runtime = started().await;
    runtime.stop();

    let result = runtime
        .connect_session(
            Arc::new(RecordingClient::default()),
            UserInfo::default(),
            None,
            None,
        )
        .await;
    assert!(matches!(result, Err(RuntimeError::Stopped)));
}

#[tokio::test]
async fn test_handle_backmsg_after_stop() {
    let runtime = started().await;
    runtime.stop();

    let result = runtime
        .handle_backmsg(Uuid::new_v4(), BackMsg::AppHeartbeat)
        .await;
    assert!(matches!(assert_err!(result), RuntimeError::Stopped));
    assert!(
        runtime
            .handle_backmsg_deserialization_exception(Uuid::new_v4(), "bad")
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_handle_session_client_disconnected() {
    let runtime = started().await;
    let client = Arc::new(RecordingClient::default());
    let session_id = connect(&runtime, &client).await;

    send(&runtime, session_id, dataframe("[1, 2, 3]", 0)).await;
    assert_eq!(client.messages().len(), 1);
    assert!(runtime.is_active_session(session_id).await);

    client.hang_up();
    send(&runtime, session_id, dataframe("[1, 2, 3]", 0)).await;
    assert!(!runtime.is_active_session(session_id).await);
    assert_eq!(runtime.state(), RuntimeState::NoSessionsConnected);
}

#[tokio::test]
async fn test_disconnect_does_not_affect_other_sessions() {
    let runtime = started().await;
    let failing = Arc::new(RecordingClient::default());
    let healthy = Arc::new(RecordingClient::default());
    let a = connect(&runtime, &failing).await;
    let b = connect(&runtime, &healthy).await;
    failing.hang_up();

    for session_id in [a, b] {
        runtime
            .get_active_session_info(session_id)
            .await
            .unwrap()
            .session
            .outbox()
            .enqueue(dataframe("[4, 5, 6]", 0));
    }
    runtime.flush_outboxes().await;

    assert!(!runtime.is_active_session(a).await);
    assert!(runtime.is_active_session(b).await);
    assert_eq!(healthy.messages(), vec![dataframe("[4, 5, 6]", 0)]);
    assert_eq!(runtime.state(), RuntimeState::OneOrMoreSessionsConnected);
}

#[tokio::test]
async fn test_stable_number_of_tasks() {
    let runtime = started().await;
    let client = Arc::new(RecordingClient::default());
    let session_id = connect(&runtime, &client).await;

    // Output reaches the client through the dispatch loop only.
    for run in 1..=100 {
        assert_ok!(
            runtime
                .handle_backmsg(session_id, BackMsg::RerunScript(RerunRequest::default()))
                .await
        );
        eventually(|| finished_runs(&client) == run).await;
    }

    let alive = tokio::runtime::Handle::current().metrics().num_alive_tasks();
    assert!(alive < 10, "{alive} tasks alive");
}

#[tokio::test]
async fn test_disconnect_waits_for_in_flight_dispatch() {
    let runtime = started_with(caching_config(2, false), EmitRunner).await;
    let client = Arc::new(GatedClient::default());
    let session_id = runtime
        .connect_session(
            Arc::clone(&client) as Arc<dyn SessionClient>,
            UserInfo::default(),
            None,
            None,
        )
        .await
        .unwrap();

    let table = dataframe("[1, 2, 3]", 1);
    let outbox = Arc::clone(
        runtime
            .get_active_session_info(session_id)
            .await
            .unwrap()
            .session
            .outbox(),
    );
    outbox.enqueue(Message::exception("first"));
    outbox.enqueue(table.clone());

    let disconnect_mid_tick = async {
        client.entered.notified().await;
        let disconnect = runtime.disconnect_session(session_id);
        tokio::pin!(disconnect);
        // The tick is parked on the first write.
        assert!(
            tokio::time::timeout(Duration::from_millis(50), &mut disconnect)
                .await
                .is_err()
        );
        client.release.notify_one();
        disconnect.await
    };
    let ((), disconnected) = tokio::join!(runtime.flush_outboxes(), disconnect_mid_tick);
    assert_ok!(disconnected);
    assert_eq!(client.delivered.messages().len(), 2);
    assert!(
        !runtime
            .message_cache()
            .has_message_reference(table.hash(), session_id)
    );

    let reconnected = Arc::new(RecordingClient::default());
    let resumed = runtime
        .connect_session(reconnected.clone(), UserInfo::default(), Some(session_id), None)
        .await
        .unwrap();
    assert_eq!(resumed, session_id);

    send(&runtime, session_id, table.clone()).await;
    let received = reconnected.pop().unwrap();
    assert!(!received.is_ref_hash());
    assert_eq!(received, table.with_cacheable(true));
}

#[tokio::test]
async fn test_session_id_override_drops_previous_cache_refs() {
    let runtime = started_with(caching_config(2, false), EmitRunner).await;
    let old_client = Arc::new(RecordingClient::default());
    let session_id = connect(&runtime, &old_client).await;
    let table = dataframe("[1, 2, 3]", 1);
    send(&runtime, session_id, table.clone()).await;

    let new_client = Arc::new(RecordingClient::default());
    let replaced = runtime
        .connect_session(new_client.clone(), UserInfo::default(), None, Some(session_id))
        .await
        .unwrap();
    assert_eq!(replaced, session_id);
    assert_eq!(runtime.num_active_sessions().await, 1);
    assert!(
        !runtime
            .message_cache()
            .has_message_reference(table.hash(), session_id)
    );

    send(&runtime, session_id, table.clone()).await;
    assert_eq!(new_client.messages(), vec![table.with_cacheable(true)]);
}

#[tokio::test]
async fn test_undelivered_output_survives_client_failure() {
    let runtime = started_with(caching_config(0, false), EmitRunner).await;
    let other = Arc::new(RecordingClient::default());
    let b = connect(&runtime, &other).await;
    let table = dataframe("[1, 2, 3]", 1);
    send(&runtime, b, table.clone()).await;

    let failing = Arc::new(RecordingClient::default());
    let a = connect(&runtime, &failing).await;
    failing.hang_up();
    let outbox = Arc::clone(
        runtime
            .get_active_session_info(a)
            .await
            .unwrap()
            .session
            .outbox(),
    );
    outbox.enqueue(dataframe("result", 0));
    outbox.enqueue(Message::script_finished(
        ScriptFinishedStatus::FinishedSuccessfully,
    ));
    runtime.flush_outboxes().await;

    assert!(!runtime.is_active_session(a).await);
    assert_eq!(outbox.len(), 2);
    assert!(
        runtime.message_cache().get_message(table.hash()).is_some(),
        "no run has completed yet"
    );

    let reconnected = Arc::new(RecordingClient::default());
    let resumed = runtime
        .connect_session(reconnected.clone(), UserInfo::default(), Some(a), None)
        .await
        .unwrap();
    assert_eq!(resumed, a);
    runtime.flush_outboxes().await;

    let received = reconnected.messages();
    assert_eq!(received.len(), 2);
    assert!(!received[0].is_ref_hash());
    assert_eq!(
        received[1].finished_status(),
        Some(ScriptFinishedStatus::FinishedSuccessfully)
    );
    assert!(
        runtime.message_cache().get_message(table.hash()).is_none(),
        "the delivered completion ages the cache"
    );
}

#[tokio::test]
async fn test_outgoing_messages_carry_hash() {
    let runtime = started().await;
    let client = Arc::new(RecordingClient::default());
    let session_id = connect(&runtime, &client).await;

    let msg = dataframe("[1, 2, 3]", 0);
    send(&runtime, session_id, msg.clone()).await;

    let received = client.pop().unwrap();
    assert_eq!(received.hash(), msg.hash());
}

#[tokio::test]
async fn test_cacheable_flag_below_threshold_is_unset() {
    let config = RuntimeConfig {
        min_cached_message_size: 1000,
        ..RuntimeConfig::default()
    };
    let runtime = started_with(config, EmitRunner).await;
    let client = Arc::new(RecordingClient::default());
    let session_id = connect(&runtime, &client).await;

    send(&runtime, session_id, dataframe("[4, 5, 6]", 0)).await;
    assert!(!client.pop().unwrap().is_cacheable());
    assert!(runtime.message_cache().is_empty());
}

#[tokio::test]
async fn test_cacheable_flag_at_threshold_is_set() {
    let runtime = started_with(caching_config(2, false), EmitRunner).await;
    let client = Arc::new(RecordingClient::default());
    let session_id = connect(&runtime, &client).await;

    send(&runtime, session_id, dataframe("[1, 2, 3]", 0)).await;
    assert!(client.pop().unwrap().is_cacheable());

    // Control messages are never cached.
    finish_script(&runtime, session_id, ScriptFinishedStatus::FinishedSuccessfully).await;
    assert!(!client.pop().unwrap().is_cacheable());
    assert_eq!(runtime.message_cache().len(), 1);
}

#[tokio::test]
async fn test_duplicate_message_caching() {
    let runtime = started_with(caching_config(2, false), EmitRunner).await;
    let client = Arc::new(RecordingClient::default());
    let session_id = connect(&runtime, &client).await;

    let msg1 = dataframe("[1, 2, 3]", 1);
    send(&runtime, session_id, msg1.clone()).await;
    let uncached = client.pop().unwrap();
    assert!(matches!(uncached.body(), MessageBody::Delta { .. }));

    let msg2 = dataframe("[1, 2, 3]", 123);
    send(&runtime, session_id, msg2.clone()).await;
    let cached = client.pop().unwrap();
    let MessageBody::RefHash { hash } = cached.body() else {
        panic!("expected a hash reference, got {cached:?}");
    };
    assert_eq!(hash, msg1.hash());
    assert_eq!(hash, msg2.hash());
    assert_eq!(cached.metadata().target_path, Some(vec![0, 123]));
    assert!(cached.metadata().cacheable);
}

#[tokio::test]
async fn test_message_cache_age_eviction() {
    let runtime = started_with(caching_config(1, false), EmitRunner).await;
    let client = Arc::new(RecordingClient::default());
    let session_id = connect(&runtime, &client).await;
    let msg = dataframe("[1, 2, 3]", 0);
    let is_cached = || runtime.message_cache().get_message(msg.hash()).is_some();

    send(&runtime, session_id, msg.clone()).await;
    assert!(is_cached(), "sent cacheable message is cached");

    finish_script(&runtime, session_id, ScriptFinishedStatus::FinishedWithCompileError).await;
    assert!(is_cached(), "compile errors do not age entries");

    finish_script(&runtime, session_id, ScriptFinishedStatus::FinishedSuccessfully).await;
    assert!(is_cached(), "age 1 remains cached");

    send(&runtime, session_id, msg.clone()).await;
    assert!(is_cached(), "resending resets the age");

    finish_script(&runtime, session_id, ScriptFinishedStatus::FinishedSuccessfully).await;
    assert!(is_cached(), "age is 1 again");

    finish_script(&runtime, session_id, ScriptFinishedStatus::FinishedSuccessfully).await;
    assert!(!is_cached(), "age 2 is evicted");
}

#[tokio::test]
async fn test_fragment_runs_do_not_age_cache_by_default() {
    let runtime = started_with(caching_config(1, false), EmitRunner).await;
    let client = Arc::new(RecordingClient::default());
    let session_id = connect(&runtime, &client).await;
    let msg = dataframe("[4, 5, 6]", 0);
    let is_cached = || runtime.message_cache().get_message(msg.hash()).is_some();

    send(&runtime, session_id, msg.clone()).await;
    finish_script(&runtime, session_id, ScriptFinishedStatus::FinishedSuccessfully).await;
    for _ in 0..5 {
        finish_script(
            &runtime,
            session_id,
            ScriptFinishedStatus::FinishedFragmentRunSuccessfully,
        )
        .await;
    }
    assert!(is_cached(), "fragment runs do not evict");

    finish_script(&runtime, session_id, ScriptFinishedStatus::FinishedSuccessfully).await;
    assert!(!is_cached(), "another full run evicts");
}

#[tokio::test]
async fn test_fragment_runs_age_cache_when_enabled() {
    let runtime = started_with(caching_config(1, true), EmitRunner).await;
    let client = Arc::new(RecordingClient::default());
    let session_id = connect(&runtime, &client).await;
    let msg = dataframe("[7, 8, 9]", 0);
    let is_cached = || runtime.message_cache().get_message(msg.hash()).is_some();

    send(&runtime, session_id, msg.clone()).await;
    finish_script(
        &runtime,
        session_id,
        ScriptFinishedStatus::FinishedFragmentRunSuccessfully,
    )
    .await;
    assert!(is_cached(), "age 1 after one fragment run");

    finish_script(&runtime, session_id, ScriptFinishedStatus::FinishedSuccessfully).await;
    assert!(!is_cached(), "full run after fragment run evicts");
}

#[tokio::test]
async fn test_superseded_deltas_are_not_sent() {
    let runtime = started().await;
    let client = Arc::new(RecordingClient::default());
    let session_id = connect(&runtime, &client).await;
    let outbox = Arc::clone(
        runtime
            .get_active_session_info(session_id)
            .await
            .unwrap()
            .session
            .outbox(),
    );

    outbox.enqueue(dataframe("loading", 0));
    outbox.enqueue(dataframe("header", 1));
    outbox.enqueue(dataframe("done", 0));
    runtime.flush_outboxes().await;

    assert_eq!(
        client.messages(),
        vec![dataframe("done", 0), dataframe("header", 1)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_does_script_run_without_error() {
    let runtime = fixture_with(RuntimeConfig::default(), EmitRunner).await;
    assert_eq!(runtime.does_script_run_without_error().await, (true, "ok"));
    drop(runtime);

    let runtime = fixture_with(RuntimeConfig::default(), CompileErrorRunner).await;
    assert_eq!(runtime.does_script_run_without_error().await, (false, "error"));
    drop(runtime);

    let config = RuntimeConfig {
        script_check_timeout_secs: 1,
        ..RuntimeConfig::default()
    };
    let runtime = fixture_with(config, BlockingRunner).await;
    assert_eq!(runtime.does_script_run_without_error().await, (false, "timeout"));
}
