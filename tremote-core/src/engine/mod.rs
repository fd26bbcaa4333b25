//! RPC engine: connection state machine driven by a tokio actor
//!
//! `Rpc` owns the connection status, the torrent list and the request
//! router. It runs inside a single actor task (`spawn_rpc`) and is driven
//! by commands from `RpcHandle`s, transport completions, locality probe
//! results and its two timers. Observers receive `RpcEvent`s.

pub mod actor;
pub mod commands;
pub mod core;
pub mod events;
pub mod handle;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_mocks;

pub use actor::spawn_rpc;
pub use commands::{AddTorrentOptions, QueueMovement, RpcCommand, TorrentProperty};
pub use self::core::Rpc;
pub use events::RpcEvent;
pub use handle::RpcHandle;

use serde::Serialize;

use crate::rpc::RpcErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Connection status, replaced as a whole on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Status {
    pub connection_state: ConnectionState,
    pub error: Option<RpcErrorKind>,
    pub message: String,
    pub detailed_message: String,
}

impl Status {
    pub fn connecting() -> Self {
        Self {
            connection_state: ConnectionState::Connecting,
            ..Default::default()
        }
    }

    pub fn connected() -> Self {
        Self {
            connection_state: ConnectionState::Connected,
            ..Default::default()
        }
    }

    /// Disconnected because of `error`.
    pub fn failed(
        error: RpcErrorKind,
        message: impl Into<String>,
        detailed_message: impl Into<String>,
    ) -> Self {
        Self {
            connection_state: ConnectionState::Disconnected,
            error: Some(error),
            message: message.into(),
            detailed_message: detailed_message.into(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.connection_state, self.error) {
            (ConnectionState::Disconnected, Some(error)) if self.message.is_empty() => {
                write!(f, "Disconnected: {error}")
            }
            (ConnectionState::Disconnected, Some(error)) => {
                write!(f, "Disconnected: {error} ({})", self.message)
            }
            (state, _) => write!(f, "{state:?}"),
        }
    }
}
