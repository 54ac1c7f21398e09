//! Session lifecycle and registry for scriptview.
//!
//! Provides:
//! - `SessionLifecycle` - Owns one session's script runs and back-messages
//! - `SessionRegistry` - Active and disconnected-retained sessions
//! - Storage implementations for retained sessions (memory)

pub mod lifecycle;
pub mod registry;
pub mod storage;

pub use lifecycle::SessionLifecycle;
pub use registry::{
    ActiveSessionInfo, ConnectedSession, RegistryError, SessionRecord, SessionRegistry,
    SessionStatus,
};
pub use storage::{SessionStorage, StorageError};

#[cfg(feature = "memory")]
pub use storage::MemorySessionStorage;
