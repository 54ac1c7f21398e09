//! Inbound client requests.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Parameters for a script rerun.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RerunRequest {
    /// Widget values reported by the client.
    #[serde(default)]
    pub widget_states: Map<String, Value>,
    /// Restrict the run to a single fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment_id: Option<String>,
}

impl RerunRequest {
    #[must_use]
    pub const fn is_fragment_run(&self) -> bool {
        self.fragment_id.is_some()
    }
}

/// Message from a client to its session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackMsg {
    /// Run the script again.
    RerunScript(RerunRequest),
    /// Stop the in-flight run.
    StopScript,
    /// Drop script-visible session state.
    ClearCache,
    /// Keepalive.
    AppHeartbeat,
}
