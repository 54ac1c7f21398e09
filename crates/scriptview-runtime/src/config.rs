//! Runtime configuration.

use std::time::Duration;

use scriptview_core::CacheConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Config parse error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid runtime config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Options recognized by the runtime. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    /// Deltas smaller than this many bytes are never cached.
    pub min_cached_message_size: usize,
    /// Completed runs a cached message survives without being resent.
    pub max_cached_message_age: u32,
    /// Whether fragment runs age cached messages.
    pub include_fragment_runs_in_cache_age_count: bool,
    /// How long a disconnected session stays eligible for reconnection.
    pub disconnected_session_ttl_secs: u64,
    /// Upper bound on retained disconnected sessions.
    pub max_retained_sessions: usize,
    /// Time limit for `Runtime::does_script_run_without_error`.
    pub script_check_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            min_cached_message_size: 10 * 1024,
            max_cached_message_age: 2,
            include_fragment_runs_in_cache_age_count: false,
            disconnected_session_ttl_secs: 120,
            max_retained_sessions: 128,
            script_check_timeout_secs: 60,
        }
    }
}

impl RuntimeConfig {
    /// Parse a JSON config document.
    ///
    /// # Errors
    /// Returns error if the document is not valid JSON or has mistyped fields.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Eviction policy for the message cache.
    #[must_use]
    pub const fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_cached_message_age: self.max_cached_message_age,
            include_fragment_runs: self.include_fragment_runs_in_cache_age_count,
        }
    }

    #[must_use]
    pub const fn disconnected_session_ttl(&self) -> Duration {
        Duration::from_secs(self.disconnected_session_ttl_secs)
    }

    #[must_use]
    pub const fn script_check_timeout(&self) -> Duration {
        Duration::from_secs(self.script_check_timeout_secs)
    }
}
