//! Runtime lifecycle states.

use serde::Serialize;

/// Process-wide runtime state.
///
/// States only move forward, except between `NoSessionsConnected` and
/// `OneOrMoreSessionsConnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    Initial,
    NoSessionsConnected,
    OneOrMoreSessionsConnected,
    Stopping,
    Stopped,
}

impl RuntimeState {
    /// Whether `next` is a legal successor of this state.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use RuntimeState::{
            Initial, NoSessionsConnected, OneOrMoreSessionsConnected, Stopped, Stopping,
        };
        matches!(
            (self, next),
            (Initial, NoSessionsConnected | Stopped)
                | (NoSessionsConnected, OneOrMoreSessionsConnected)
                | (OneOrMoreSessionsConnected, NoSessionsConnected)
                | (NoSessionsConnected | OneOrMoreSessionsConnected, Stopping)
                | (Stopping, Stopped)
        )
    }

    /// Whether `stop()` has been requested.
    #[must_use]
    pub const fn is_stopping_or_stopped(self) -> bool {
        matches!(self, Self::Stopping | Self::Stopped)
    }
}
