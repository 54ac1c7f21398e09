//! Runtime coordinator for scriptview.
//!
//! Provides:
//! - `Runtime` - Lifecycle state machine and message dispatch loop
//! - `RuntimeConfig` - Cache and session retention options

pub mod config;
pub mod runtime;
pub mod state;

pub use config::{ConfigError, RuntimeConfig};
pub use runtime::{Runtime, RuntimeError};
pub use state::RuntimeState;
