//! Core traits for message delivery and script execution.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::{Message, RerunRequest, ScriptContext, ScriptFinishedStatus};

/// Session identifier.
pub type SessionId = Uuid;

/// Delivery error.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Client disconnected")]
    Disconnected,
}

/// Transport-side handle for one connected client.
///
/// The runtime never retries a failed write; an error means the session's
/// client is gone. Writes happen inside a dispatch tick, so an implementation
/// must not await the runtime's connect, disconnect or close operations.
#[async_trait]
pub trait SessionClient: Send + Sync {
    /// Deliver one message to the client.
    async fn write_message(&self, msg: Message) -> Result<(), ClientError>;
}

/// Script error.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Script failed: {0}")]
    Failed(String),
    #[error("Script run cancelled")]
    Cancelled,
}

/// Trait for script execution units.
///
/// A run emits output through [`ScriptContext::enqueue`] only and should
/// return promptly once [`ScriptContext::is_stopped`] turns true.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Execute one run of the script.
    async fn run(
        &self,
        ctx: ScriptContext,
        request: RerunRequest,
    ) -> Result<ScriptFinishedStatus, ScriptError>;
}
