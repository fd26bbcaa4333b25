//! Tremote Core - Remote control engine for Transmission daemons
//!
//! This crate keeps a live mirror of a remote daemon's torrents, settings
//! and statistics over its HTTP/JSON RPC interface: request transport with
//! session token rotation and retries, a polling connection state machine,
//! and identity preserving reconciliation of the fetched snapshots.

pub mod config;
pub mod engine;
pub mod locality;
pub mod model;
pub mod reconcile;
pub mod rpc;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::{ConfigError, TremoteConfig};
pub use engine::{RpcEvent, RpcHandle, spawn_rpc};
pub use reconcile::{ListDelta, ListUpdater};
pub use rpc::{RequestFailure, RpcErrorKind};

/// Errors surfaced by the engine handle.
///
/// Connection failures are not errors at this level: they are reported
/// through `RpcEvent::StatusChanged`.
#[derive(Debug, thiserror::Error)]
pub enum TremoteError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("RPC engine has shut down")]
    EngineShutdown,
}

impl TremoteError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            TremoteError::Configuration(e) => match e {
                ConfigError::InvalidServerUrl { url, .. } => {
                    format!("Invalid server address: {url}")
                }
                ConfigError::InvalidCertificate { .. } => {
                    "Server certificate is not valid PEM".to_string()
                }
                ConfigError::InvalidProxy { .. } => "Invalid proxy configuration".to_string(),
                ConfigError::ClientConstruction { .. } => {
                    "Client certificate or key is not valid".to_string()
                }
            },
            TremoteError::Io(_) => "File system error occurred".to_string(),
            TremoteError::EngineShutdown => "Connection engine is not running".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(self, TremoteError::Configuration(_))
    }
}

pub type Result<T> = std::result::Result<T, TremoteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_errors() {
        let error = TremoteError::from(ConfigError::InvalidServerUrl {
            url: "http://bad host:9091/".to_string(),
            reason: "invalid domain character".to_string(),
        });
        assert!(error.is_user_error());
        assert_eq!(
            error.user_message(),
            "Invalid server address: http://bad host:9091/"
        );
        assert!(!TremoteError::EngineShutdown.is_user_error());
    }
}
