//! Handle for communicating with the RPC engine actor.

use std::path::Path;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::{mpsc, oneshot};

use super::commands::{AddTorrentOptions, QueueMovement, RpcCommand, TorrentProperty};
use super::Status;
use crate::config::TremoteConfig;
use crate::model::{JsonObject, ServerSettings, ServerStats, Torrent};
use crate::rpc::{HttpClient, ReqwestClient};
use crate::{Result, TremoteError};

/// Handle for communicating with the RPC engine actor.
///
/// Cheap to clone. Mutations return as soon as the actor accepted them;
/// their outcome arrives as `RpcEvent`s and in the next snapshot.
#[derive(Clone)]
pub struct RpcHandle {
    sender: mpsc::Sender<RpcCommand>,
}

impl RpcHandle {
    /// Creates a new handle with the given command sender.
    pub fn new(sender: mpsc::Sender<RpcCommand>) -> Self {
        Self { sender }
    }

    /// Points the engine at the daemon described by `config`, using a
    /// `reqwest` client. Disconnects from the previous daemon.
    ///
    /// # Errors
    /// - `TremoteError::Configuration` - Address, proxy or certificates are invalid
    /// - `TremoteError::EngineShutdown` - Actor is not running
    pub async fn set_server(&self, config: TremoteConfig) -> Result<()> {
        let client = ReqwestClient::new(&config.server, &config.connection)?;
        self.set_server_with_client(config, Arc::new(client)).await
    }

    /// Like `set_server`, with a caller supplied HTTP client.
    ///
    /// # Errors
    /// - `TremoteError::Configuration` - Address or pinned certificates are invalid
    /// - `TremoteError::EngineShutdown` - Actor is not running
    pub async fn set_server_with_client(
        &self,
        config: TremoteConfig,
        client: Arc<dyn HttpClient>,
    ) -> Result<()> {
        let result = self
            .request(|responder| RpcCommand::SetServer {
                server: Box::new(config.server),
                connection: config.connection,
                client,
                responder,
            })
            .await?;
        Ok(result?)
    }

    pub async fn reset_server(&self) -> Result<()> {
        self.send(RpcCommand::ResetServer).await
    }

    pub async fn connect(&self) -> Result<()> {
        self.send(RpcCommand::Connect).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.send(RpcCommand::Disconnect).await
    }

    pub async fn set_update_disabled(&self, disabled: bool) -> Result<()> {
        self.send(RpcCommand::SetUpdateDisabled(disabled)).await
    }

    /// Polls now instead of waiting for the update timer.
    pub async fn update_data(&self) -> Result<()> {
        self.send(RpcCommand::UpdateData).await
    }

    pub async fn add_torrent_link(&self, link: &str, options: AddTorrentOptions) -> Result<()> {
        self.send(RpcCommand::AddTorrentLink {
            link: link.to_string(),
            options,
        })
        .await
    }

    /// Uploads a local torrent file. The file is read and encoded here,
    /// off the actor task.
    ///
    /// # Errors
    /// - `TremoteError::Io` - File could not be read
    /// - `TremoteError::EngineShutdown` - Actor is not running
    pub async fn add_torrent_file(&self, path: &Path, options: AddTorrentOptions) -> Result<()> {
        let data = tokio::fs::read(path).await?;
        let metainfo = tokio::task::spawn_blocking(move || BASE64.encode(data))
            .await
            .map_err(std::io::Error::other)?;
        self.send(RpcCommand::AddTorrentFile { metainfo, options })
            .await
    }

    /// Starts torrents, skipping the queue when `now` is set.
    pub async fn start_torrents(&self, ids: Vec<i64>, now: bool) -> Result<()> {
        self.send(RpcCommand::StartTorrents { ids, now }).await
    }

    pub async fn stop_torrents(&self, ids: Vec<i64>) -> Result<()> {
        self.send(RpcCommand::StopTorrents { ids }).await
    }

    pub async fn remove_torrents(&self, ids: Vec<i64>, delete_files: bool) -> Result<()> {
        self.send(RpcCommand::RemoveTorrents { ids, delete_files })
            .await
    }

    pub async fn verify_torrents(&self, ids: Vec<i64>) -> Result<()> {
        self.send(RpcCommand::VerifyTorrents { ids }).await
    }

    pub async fn move_torrents_in_queue(
        &self,
        ids: Vec<i64>,
        movement: QueueMovement,
    ) -> Result<()> {
        self.send(RpcCommand::MoveTorrentsInQueue { ids, movement })
            .await
    }

    pub async fn reannounce_torrents(&self, ids: Vec<i64>) -> Result<()> {
        self.send(RpcCommand::ReannounceTorrents { ids }).await
    }

    /// Sends `session-set` with the given daemon keys.
    pub async fn set_session_properties(&self, properties: JsonObject) -> Result<()> {
        self.send(RpcCommand::SetSessionProperties { properties })
            .await
    }

    pub async fn set_torrent_property(&self, id: i64, property: TorrentProperty) -> Result<()> {
        self.send(RpcCommand::SetTorrentProperty { id, property })
            .await
    }

    pub async fn set_torrents_location(
        &self,
        ids: Vec<i64>,
        location: &str,
        move_files: bool,
    ) -> Result<()> {
        self.send(RpcCommand::SetTorrentsLocation {
            ids,
            location: location.to_string(),
            move_files,
        })
        .await
    }

    pub async fn rename_torrent_file(
        &self,
        torrent_id: i64,
        path: &str,
        new_name: &str,
    ) -> Result<()> {
        self.send(RpcCommand::RenameTorrentFile {
            torrent_id,
            path: path.to_string(),
            new_name: new_name.to_string(),
        })
        .await
    }

    pub async fn set_torrent_files_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        self.send(RpcCommand::SetTorrentFilesEnabled { id, enabled })
            .await
    }

    pub async fn set_torrent_peers_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        self.send(RpcCommand::SetTorrentPeersEnabled { id, enabled })
            .await
    }

    /// Result arrives as `RpcEvent::DownloadDirFreeSpace`.
    pub async fn get_download_dir_free_space(&self) -> Result<()> {
        self.send(RpcCommand::GetDownloadDirFreeSpace).await
    }

    /// Result arrives as `RpcEvent::FreeSpaceForPath`.
    pub async fn get_free_space_for_path(&self, path: &str) -> Result<()> {
        self.send(RpcCommand::GetFreeSpaceForPath {
            path: path.to_string(),
        })
        .await
    }

    /// Asks the daemon to exit. The engine disconnects once it agreed.
    pub async fn shutdown_server(&self) -> Result<()> {
        self.send(RpcCommand::ShutdownServer).await
    }

    pub async fn status(&self) -> Result<Status> {
        self.request(|responder| RpcCommand::GetStatus { responder })
            .await
    }

    /// Snapshot of every torrent, child lists included.
    pub async fn torrents(&self) -> Result<Vec<Torrent>> {
        self.request(|responder| RpcCommand::GetTorrents { responder })
            .await
    }

    pub async fn torrent(&self, id: i64) -> Result<Option<Torrent>> {
        self.request(|responder| RpcCommand::GetTorrent { id, responder })
            .await
    }

    pub async fn server_settings(&self) -> Result<ServerSettings> {
        self.request(|responder| RpcCommand::GetServerSettings { responder })
            .await
    }

    pub async fn server_stats(&self) -> Result<ServerStats> {
        self.request(|responder| RpcCommand::GetServerStats { responder })
            .await
    }

    /// `None` until the locality probe of the current connection finished.
    pub async fn is_server_local(&self) -> Result<Option<bool>> {
        self.request(|responder| RpcCommand::IsServerLocal { responder })
            .await
    }

    /// Waits until every request issued so far, and the requests they
    /// triggered, completed.
    pub async fn wait_idle(&self) -> Result<()> {
        self.request(|responder| RpcCommand::WaitIdle { responder })
            .await
    }

    /// Disconnects and stops the actor.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|responder| RpcCommand::Shutdown { responder })
            .await
    }

    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    async fn send(&self, command: RpcCommand) -> Result<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| TremoteError::EngineShutdown)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> RpcCommand,
    ) -> Result<T> {
        let (responder, rx) = oneshot::channel();
        self.send(command(responder)).await?;
        rx.await.map_err(|_| TremoteError::EngineShutdown)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::timeout;

    use super::*;
    use crate::engine::spawn_rpc;
    use crate::engine::test_mocks::FakeDaemon;

    #[tokio::test]
    async fn test_invalid_server_is_rejected() {
        let (handle, _events) = spawn_rpc();
        let config = TremoteConfig::for_testing("bad host name", 9091);

        let error = handle.set_server(config).await.unwrap_err();
        assert!(error.is_user_error());
    }

    #[tokio::test]
    async fn test_add_torrent_file_sends_base64() {
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
        timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                if event == crate::RpcEvent::StatusChanged(Status::connected()) {
                    break;
                }
            }
        })
        .await
        .unwrap();

        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"hello").unwrap();
        handle
            .add_torrent_file(file.path(), AddTorrentOptions::default())
            .await
            .unwrap();

        timeout(Duration::from_secs(5), async {
            while daemon.arguments_of("torrent-add").is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            daemon.arguments_of("torrent-add")[0].get("metainfo"),
            Some(&json!("aGVsbG8="))
        );
    }

    #[tokio::test]
    async fn test_missing_torrent_file_is_io_error() {
        let (handle, _events) = spawn_rpc();
        let result = handle
            .add_torrent_file(Path::new("/nonexistent/file.torrent"), AddTorrentOptions::default())
            .await;
        assert!(matches!(result, Err(TremoteError::Io(_))));
    }
}
