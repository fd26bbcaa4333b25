//! Actor implementation for the RPC engine.

use futures::future;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::commands::RpcCommand;
use super::core::Rpc;
use super::events::RpcEvent;
use super::handle::RpcHandle;
use crate::locality::LocalityResult;
use crate::rpc::TransportEvent;

/// Spawns a disconnected RPC engine actor.
///
/// Returns the handle driving it and the receiver of its events. The actor
/// stops once every handle is dropped or `RpcHandle::shutdown` is called.
///
/// # Examples
/// ```rust,no_run
/// # #[tokio::main]
/// # async fn main() -> tremote_core::Result<()> {
/// use tremote_core::{TremoteConfig, spawn_rpc};
///
/// let (handle, mut events) = spawn_rpc();
/// handle.set_server(TremoteConfig::from_env()).await?;
/// handle.connect().await?;
/// while let Some(event) = events.recv().await {
///     println!("{event:?}");
/// }
/// # Ok(())
/// # }
/// ```
pub fn spawn_rpc() -> (RpcHandle, mpsc::UnboundedReceiver<RpcEvent>) {
    let (sender, receiver) = mpsc::channel(100);
    let (event_sender, event_receiver) = mpsc::unbounded_channel();
    let (rpc, transport, locality) = Rpc::new(event_sender);

    tokio::spawn(async move {
        run_actor_loop(rpc, receiver, transport, locality).await;
    });

    (RpcHandle::new(sender), event_receiver)
}

/// Processes commands, request completions, locality results and timer
/// expiries one at a time until shutdown.
async fn run_actor_loop(
    mut rpc: Rpc,
    mut receiver: mpsc::Receiver<RpcCommand>,
    mut transport: mpsc::UnboundedReceiver<TransportEvent>,
    mut locality: mpsc::UnboundedReceiver<LocalityResult>,
) {
    tracing::debug!("RPC actor started");
    let mut idle_waiters: Vec<oneshot::Sender<()>> = Vec::new();

    loop {
        let update_deadline = rpc.update_deadline();
        let reconnect_deadline = rpc.reconnect_deadline();

        tokio::select! {
            command = receiver.recv() => match command {
                Some(command) => {
                    if !handle_command(&mut rpc, command, &mut idle_waiters) {
                        break;
                    }
                }
                None => break,
            },
            Some(event) = transport.recv() => rpc.handle_transport_event(event),
            Some(result) = locality.recv() => rpc.handle_locality_result(result),
            _ = wait_until(update_deadline) => rpc.on_update_timer(),
            _ = wait_until(reconnect_deadline) => rpc.on_reconnect_timer(),
        }

        if !idle_waiters.is_empty() && rpc.is_idle() {
            for waiter in idle_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    rpc.disconnect();
    tracing::debug!("RPC actor stopped");
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

/// Handles a single command for the RPC engine.
/// Returns true to continue processing, false to shutdown.
fn handle_command(
    rpc: &mut Rpc,
    command: RpcCommand,
    idle_waiters: &mut Vec<oneshot::Sender<()>>,
) -> bool {
    match command {
        RpcCommand::SetServer {
            server,
            connection,
            client,
            responder,
        } => {
            let result = rpc.set_server(*server, connection, client);
            let _ = responder.send(result);
        }
        RpcCommand::ResetServer => rpc.reset_server(),
        RpcCommand::Connect => rpc.connect(),
        RpcCommand::Disconnect => rpc.disconnect(),
        RpcCommand::SetUpdateDisabled(disabled) => rpc.set_update_disabled(disabled),
        RpcCommand::UpdateData => rpc.update_data(true),

        RpcCommand::AddTorrentLink { link, options } => rpc.add_torrent_link(link, options),
        RpcCommand::AddTorrentFile { metainfo, options } => {
            rpc.add_torrent_file(metainfo, options)
        }
        RpcCommand::StartTorrents { ids, now } => rpc.start_torrents(ids, now),
        RpcCommand::StopTorrents { ids } => rpc.stop_torrents(ids),
        RpcCommand::RemoveTorrents { ids, delete_files } => {
            rpc.remove_torrents(ids, delete_files)
        }
        RpcCommand::VerifyTorrents { ids } => rpc.verify_torrents(ids),
        RpcCommand::MoveTorrentsInQueue { ids, movement } => {
            rpc.move_torrents_in_queue(ids, movement)
        }
        RpcCommand::ReannounceTorrents { ids } => rpc.reannounce_torrents(ids),
        RpcCommand::SetSessionProperties { properties } => {
            rpc.set_session_properties(properties)
        }
        RpcCommand::SetTorrentProperty { id, property } => {
            rpc.set_torrent_property(id, property)
        }
        RpcCommand::SetTorrentsLocation {
            ids,
            location,
            move_files,
        } => rpc.set_torrents_location(ids, location, move_files),
        RpcCommand::RenameTorrentFile {
            torrent_id,
            path,
            new_name,
        } => rpc.rename_torrent_file(torrent_id, path, new_name),
        RpcCommand::SetTorrentFilesEnabled { id, enabled } => {
            rpc.set_torrent_files_enabled(id, enabled)
        }
        RpcCommand::SetTorrentPeersEnabled { id, enabled } => {
            rpc.set_torrent_peers_enabled(id, enabled)
        }
        RpcCommand::GetDownloadDirFreeSpace => rpc.get_download_dir_free_space(),
        RpcCommand::GetFreeSpaceForPath { path } => rpc.get_free_space_for_path(path),
        RpcCommand::ShutdownServer => rpc.shutdown_server(),

        RpcCommand::GetStatus { responder } => {
            let _ = responder.send(rpc.status().clone());
        }
        RpcCommand::GetTorrents { responder } => {
            let _ = responder.send(rpc.torrents().to_vec());
        }
        RpcCommand::GetTorrent { id, responder } => {
            let _ = responder.send(rpc.torrent(id).cloned());
        }
        RpcCommand::GetServerSettings { responder } => {
            let _ = responder.send(rpc.server_settings().clone());
        }
        RpcCommand::GetServerStats { responder } => {
            let _ = responder.send(*rpc.server_stats());
        }
        RpcCommand::IsServerLocal { responder } => {
            let _ = responder.send(rpc.server_is_local());
        }

        RpcCommand::WaitIdle { responder } => idle_waiters.push(responder),

        RpcCommand::Shutdown { responder } => {
            tracing::debug!("RPC actor shutting down");
            rpc.disconnect();
            let _ = responder.send(());
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::timeout;

    use super::*;
    use crate::TremoteError;
    use crate::config::TremoteConfig;
    use crate::engine::Status;
    use crate::engine::test_mocks::{FakeDaemon, ScriptedClient, network_error};
    use crate::rpc::NetworkErrorKind;

    async fn wait_for_event(
        events: &mut mpsc::UnboundedReceiver<RpcEvent>,
        expected: &RpcEvent,
    ) {
        timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                if &event == expected {
                    return;
                }
            }
            panic!("event channel closed");
        })
        .await
        .unwrap_or_else(|_| panic!("no {expected:?} event"));
    }

    #[tokio::test]
    async fn test_actor_connects_and_serves_snapshot() {
        let daemon = Arc::new(FakeDaemon::new());
        daemon.set_torrents(vec![json!({"id": 1}), json!({"id": 2})]);

        let (handle, mut events) = spawn_rpc();
        handle
            .set_server_with_client(TremoteConfig::for_testing("127.0.0.1", 9091), daemon)
            .await
            .unwrap();
        handle.connect().await.unwrap();
        wait_for_event(&mut events, &RpcEvent::StatusChanged(Status::connected())).await;

        assert!(handle.status().await.unwrap().is_connected());
        assert_eq!(handle.torrents().await.unwrap().len(), 2);
        assert!(handle.torrent(2).await.unwrap().is_some());
        assert!(handle.torrent(3).await.unwrap().is_none());
        assert_eq!(handle.is_server_local().await.unwrap(), Some(true));
        assert_eq!(handle.server_settings().await.unwrap().rpc_version, 17);
        assert_eq!(handle.server_stats().await.unwrap().download_speed, 2048);
    }

    #[tokio::test]
    async fn test_update_timer_polls_again() {
        let daemon = Arc::new(FakeDaemon::new());
        let (handle, mut events) = spawn_rpc();
        handle
            .set_server_with_client(
                TremoteConfig::for_testing("127.0.0.1", 9091),
                daemon.clone(),
            )
            .await
            .unwrap();
        handle.connect().await.unwrap();
        wait_for_event(&mut events, &RpcEvent::StatusChanged(Status::connected())).await;

        timeout(Duration::from_secs(5), async {
            loop {
                let polls = daemon
                    .methods()
                    .iter()
                    .filter(|method| *method == "session-stats")
                    .count();
                if polls >= 3 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("update timer did not fire");
    }

    #[tokio::test]
    async fn test_reconnect_timer_connects_again() {
        let client = Arc::new(ScriptedClient::new());
        client.push(Err(network_error(NetworkErrorKind::Connection)));
        client.push(Err(network_error(NetworkErrorKind::Connection)));

        let mut config = TremoteConfig::for_testing("127.0.0.1", 9091);
        config.connection.retry_attempts = 0;
        config.connection.auto_reconnect_enabled = true;
        config.connection.auto_reconnect_interval = Duration::from_millis(100);

        let (handle, _events) = spawn_rpc();
        handle
            .set_server_with_client(config, client.clone())
            .await
            .unwrap();
        handle.connect().await.unwrap();

        timeout(Duration::from_secs(5), async {
            while client.request_count() < 2 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("reconnect timer did not fire");
    }

    #[tokio::test]
    async fn test_wait_idle_covers_follow_up_poll() {
        let daemon = Arc::new(FakeDaemon::new());
        daemon.set_torrents(vec![json!({"id": 7})]);
        let (handle, mut events) = spawn_rpc();
        handle
            .set_server_with_client(
                TremoteConfig::for_testing("127.0.0.1", 9091),
                daemon.clone(),
            )
            .await
            .unwrap();
        handle.set_update_disabled(true).await.unwrap();
        handle.connect().await.unwrap();
        wait_for_event(&mut events, &RpcEvent::StatusChanged(Status::connected())).await;
        daemon.clear_requests();

        handle.stop_torrents(vec![7]).await.unwrap();
        timeout(Duration::from_secs(5), handle.wait_idle())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            daemon.methods(),
            ["torrent-stop", "torrent-get", "session-stats"]
        );
    }

    #[tokio::test]
    async fn test_shutdown_stops_actor() {
        let (handle, _events) = spawn_rpc();
        assert!(handle.is_running());

        handle.shutdown().await.unwrap();

        assert!(matches!(
            handle.status().await,
            Err(TremoteError::EngineShutdown)
        ));
        assert!(!handle.is_running());
    }
}
