//! Core abstractions for scriptview sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `Message` - Content-addressed unit of script output
//! - `SessionOutbox` - Per-session pending queue with path coalescing
//! - `MessageCache` - Cross-session dedup store with run-scoped eviction
//! - `ScriptContext` - Explicit producer-side context for script runs
//! - Client and script runner traits

pub mod back_msg;
pub mod context;
pub mod message;
pub mod msg_cache;
pub mod outbox;
pub mod traits;

pub use back_msg::{BackMsg, RerunRequest};
pub use context::{ScriptContext, SessionState, UserInfo};
pub use message::{
    DeltaPath, Message, MessageBody, MessageHash, MessageMetadata, RunKind, ScriptFinishedStatus,
};
pub use msg_cache::{CacheConfig, CacheStats, MessageCache};
pub use outbox::SessionOutbox;
pub use traits::{ClientError, ScriptError, ScriptRunner, SessionClient, SessionId};
