//! WebSocket transport for browser clients.

use std::sync::Arc;

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{Sink, SinkExt, StreamExt, future};
use scriptview_core::{SessionId, UserInfo};
use scriptview_runtime::{Runtime, RuntimeError};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};

use crate::{ChannelClient, ClientMessage, ServerMessage};

/// WebSocket handler state.
#[derive(Clone)]
pub struct WsState {
    pub runtime: Arc<Runtime>,
}

impl WsState {
    #[must_use]
    pub const fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }
}

/// Query parameters accepted on upgrade.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Session to resume after a dropped connection.
    pub session_id: Option<SessionId>,
}

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<WsState>,
    Query(params): Query<ConnectParams>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

async fn handle_socket(socket: WebSocket, state: WsState, params: ConnectParams) {
    let (sender, mut receiver) = socket.split();
    let (client, rx) = ChannelClient::new();
    let (greeting, greeting_rx) = oneshot::channel();

    // Forward outgoing messages to the socket
    let sink = sender.with(|json: String| {
        future::ready(Ok::<_, axum::Error>(Message::Text(json.into())))
    });
    let send_task = tokio::spawn(forward_outgoing(sink, greeting_rx, rx));

    let runtime = &state.runtime;
    let session_id = match runtime
        .connect_session(
            Arc::new(client.clone()),
            UserInfo::default(),
            params.session_id,
            None,
        )
        .await
    {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!("Rejecting connection: {e}");
            let _ = greeting.send(ServerMessage::Error {
                message: e.to_string(),
            });
            // Let the writer flush the error before the socket closes.
            drop(client);
            let _ = send_task.await;
            return;
        }
    };

    tracing::info!(%session_id, "websocket session connected");
    let _ = greeting.send(ServerMessage::SessionStarted {
        session_id: session_id.to_string(),
    });

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("WebSocket error: {e}");
                break;
            }
        };

        let result = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Ping) => {
                let _ = client.send(ServerMessage::Pong);
                Ok(())
            }
            Ok(msg) => match msg.into_back_msg() {
                Some(back_msg) => runtime.handle_backmsg(session_id, back_msg).await,
                None => Ok(()),
            },
            Err(e) => {
                tracing::warn!(%session_id, "Invalid client message: {e}");
                runtime
                    .handle_backmsg_deserialization_exception(session_id, e)
                    .await
            }
        };

        match result {
            Ok(()) => {}
            Err(RuntimeError::Stopped) => break,
            Err(e) => tracing::error!(%session_id, "Failed to handle client message: {e}"),
        }
    }

    if let Err(e) = runtime.disconnect_session(session_id).await {
        tracing::error!(%session_id, "Failed to disconnect session: {e}");
    }
    tracing::info!(%session_id, "websocket session disconnected");
    send_task.abort();
}

/// Write `greeting`, then everything sent to the session's client, as JSON.
///
/// Output dispatched to the client before the greeting is ready, such as a
/// resumed session's queued messages, is held back until after it.
async fn forward_outgoing<W>(
    mut sink: W,
    greeting: oneshot::Receiver<ServerMessage>,
    mut rx: mpsc::UnboundedReceiver<ServerMessage>,
) where
    W: Sink<String> + Unpin,
{
    let Ok(first) = greeting.await else {
        return;
    };
    if !send_json(&mut sink, &first).await {
        return;
    }
    while let Some(msg) = rx.recv().await {
        if !send_json(&mut sink, &msg).await {
            break;
        }
    }
}

/// Returns false once the socket is gone.
async fn send_json<W>(sink: &mut W, msg: &ServerMessage) -> bool
where
    W: Sink<String> + Unpin,
{
    match serde_json::to_string(msg) {
        Ok(json) => sink.send(json).await.is_ok(),
        Err(e) => {
            tracing::error!("Failed to serialize message: {e}");
            true
        }
    }
}

/// Create WebSocket router.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_ws_router(Arc::new(runtime)));
/// ```
#[must_use]
pub fn create_ws_router(runtime: Arc<Runtime>) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(WsState::new(runtime))
}
