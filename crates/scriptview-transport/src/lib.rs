//! Client transports for the scriptview runtime.
//!
//! Provides:
//! - Wire protocol (JSON + base64)
//! - `ChannelClient` - `SessionClient` over an mpsc channel
//! - WebSocket transport (feature: websocket)

pub mod client;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use client::ChannelClient;
pub use protocol::{ClientMessage, ServerMessage};
