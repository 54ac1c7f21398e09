//! Wire protocol for client-server communication.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use scriptview_core::{BackMsg, DeltaPath, Message, MessageBody, RerunRequest, ScriptFinishedStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Run the script again with the given widget values.
    RerunScript {
        #[serde(default)]
        widget_states: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fragment_id: Option<String>,
    },
    /// Stop the in-flight run.
    StopScript,
    /// Drop script-visible session state.
    ClearCache,
    /// Application-level keepalive, forwarded to the session.
    AppHeartbeat,
    /// Transport keepalive, answered directly.
    Ping,
}

impl ClientMessage {
    /// Convert to the request routed to the session.
    ///
    /// Returns `None` for transport-only messages.
    #[must_use]
    pub fn into_back_msg(self) -> Option<BackMsg> {
        match self {
            Self::RerunScript {
                widget_states,
                fragment_id,
            } => Some(BackMsg::RerunScript(RerunRequest {
                widget_states,
                fragment_id,
            })),
            Self::StopScript => Some(BackMsg::StopScript),
            Self::ClearCache => Some(BackMsg::ClearCache),
            Self::AppHeartbeat => Some(BackMsg::AppHeartbeat),
            Self::Ping => None,
        }
    }
}

/// Message from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// UI delta (base64 encoded).
    Delta {
        hash: String,
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_path: Option<DeltaPath>,
        #[serde(default)]
        cacheable: bool,
    },
    /// Reference to a delta the client already holds.
    RefHash {
        hash: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_path: Option<DeltaPath>,
        #[serde(default)]
        cacheable: bool,
    },
    /// Script run finished.
    ScriptFinished { status: ScriptFinishedStatus },
    /// Error raised by the script or by a bad request.
    Exception { message: String },
    /// Session connected.
    SessionStarted { session_id: String },
    /// Transport error.
    Error { message: String },
    /// Pong response.
    Pong,
}

impl ServerMessage {
    /// Decode delta data from base64.
    #[must_use]
    pub fn decode_delta(&self) -> Option<Vec<u8>> {
        if let Self::Delta { data, .. } = self {
            BASE64.decode(data).ok()
        } else {
            None
        }
    }
}

impl From<&Message> for ServerMessage {
    fn from(msg: &Message) -> Self {
        let target_path = msg.metadata().target_path.clone();
        match msg.body() {
            MessageBody::Delta { data } => Self::Delta {
                hash: msg.hash().to_string(),
                data: BASE64.encode(data),
                target_path,
                cacheable: msg.is_cacheable(),
            },
            MessageBody::RefHash { hash } => Self::RefHash {
                hash: hash.to_string(),
                target_path,
                cacheable: msg.is_cacheable(),
            },
            MessageBody::ScriptFinished { status } => Self::ScriptFinished { status: *status },
            MessageBody::Exception { message } => Self::Exception {
                message: message.clone(),
            },
        }
    }
}
