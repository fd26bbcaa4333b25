//! Integration tests for Tremote
//!
//! Drive the public engine API through the real HTTP client against a
//! fake daemon listening on a local port.

#[path = "integration/daemon.rs"]
mod daemon;

#[path = "integration/connection.rs"]
mod connection;
#[path = "integration/workflow.rs"]
mod workflow;

use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tremote_core::config::TremoteConfig;
use tremote_core::engine::Status;
use tremote_core::{RpcEvent, RpcHandle, spawn_rpc};

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Spawns an engine for `config` and waits for the first final status.
pub async fn connect(config: TremoteConfig) -> (RpcHandle, UnboundedReceiver<RpcEvent>, Status) {
    let (handle, mut events) = spawn_rpc();
    handle.set_server(config).await.unwrap();
    handle.connect().await.unwrap();

    let status = next_matching(&mut events, |event| match event {
        RpcEvent::StatusChanged(status) if status.is_connected() || status.error.is_some() => {
            Some(status.clone())
        }
        _ => None,
    })
    .await;
    (handle, events, status)
}

/// Waits for the first event `select` maps to a value.
pub async fn next_matching<T>(
    events: &mut UnboundedReceiver<RpcEvent>,
    mut select: impl FnMut(&RpcEvent) -> Option<T>,
) -> T {
    timeout(EVENT_TIMEOUT, async {
        loop {
            let event = events.recv().await.expect("Engine stopped");
            if let Some(value) = select(&event) {
                return value;
            }
        }
    })
    .await
    .expect("Timed out waiting for event")
}
