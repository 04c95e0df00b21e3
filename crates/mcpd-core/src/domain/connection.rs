//! Connection lifecycle state.

use serde::{Deserialize, Serialize};

/// Runtime state of the transport to one server definition.
///
/// `Stopped → Starting → Running ⇄ (Error | Stopped)`. A server owns at
/// most one non-disposed connection at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not running.
    #[default]
    Stopped,
    /// Launch/handshake in progress.
    Starting,
    /// Session established and usable.
    Running,
    /// Failed; the message is user-presentable.
    Error(String),
}

impl ConnectionState {
    /// Terminal states: a waiter observing one of these will not see the
    /// connection become usable without a new `start()`.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error(_))
    }

    /// Whether `start()` may proceed without disposing this connection's
    /// owner first.
    pub const fn is_startable(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error(_))
    }
}
