//! Channel-backed session client.

use async_trait::async_trait;
use scriptview_core::{ClientError, Message, SessionClient};
use tokio::sync::mpsc;

use crate::ServerMessage;

/// `SessionClient` that encodes messages onto an mpsc channel.
///
/// The receiving half is typically drained by a socket writer task. Once it
/// is dropped, writes fail with [`ClientError::Disconnected`].
#[derive(Debug, Clone)]
pub struct ChannelClient {
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ChannelClient {
    /// Create a client and the receiver its messages arrive on.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Send a transport-level message that bypasses the runtime.
    ///
    /// # Errors
    /// Returns `Disconnected` if the receiver is gone.
    pub fn send(&self, msg: ServerMessage) -> Result<(), ClientError> {
        self.tx.send(msg).map_err(|_| ClientError::Disconnected)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
impl SessionClient for ChannelClient {
    async fn write_message(&self, msg: Message) -> Result<(), ClientError> {
        self.send(ServerMessage::from(&msg))
    }
}
