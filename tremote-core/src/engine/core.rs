//! Connection state machine and poll cycle.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::events::RpcEvent;
use super::{AddTorrentOptions, ConnectionState, QueueMovement, Status, TorrentProperty};
use crate::config::{ConfigError, ConnectionConfig, ServerConfig};
use crate::locality::{LocalityProbe, LocalityResult};
use crate::model::json::{self, JsonObject};
use crate::model::torrent::TORRENT_FIELDS;
use crate::model::{ServerSettings, ServerStats, Torrent, TorrentsUpdater};
use crate::reconcile::{ListDelta, ListUpdater};
use crate::rpc::{
    HttpClient, RequestFailure, RequestRouter, Response, RouterOutput, RpcErrorKind,
    TransportEvent,
};

/// What to do with the outcome of a request.
#[derive(Debug)]
enum RequestKind {
    ServerSettings,
    Torrents,
    TorrentFiles { id: i64 },
    TorrentPeers { id: i64 },
    CheckSingleFile,
    ServerStats,
    AddTorrent { renamed_files: BTreeMap<String, String> },
    /// Poll once the daemon accepted the change
    UpdateOnSuccess,
    Fire,
    TorrentSet { update_if_successful: bool },
    RenameFile {
        torrent_id: i64,
        path: String,
        new_name: String,
    },
    DownloadDirFreeSpace,
    FreeSpaceForPath,
    ShutdownServer,
}

/// Mirror of a daemon's state, kept in sync by polling.
///
/// All methods run on the actor task. Requests complete through
/// `handle_transport_event`, locality probes through
/// `handle_locality_result`, and the two timers through
/// `on_update_timer` and `on_reconnect_timer` once their deadline passed.
pub struct Rpc {
    connection: ConnectionConfig,
    router: RequestRouter<RequestKind>,
    events: mpsc::UnboundedSender<RpcEvent>,
    status: Status,

    /// A poll cycle is in progress
    updating: bool,
    update_disabled: bool,
    rpc_version_checked: bool,
    server_settings_updated: bool,
    torrent_list_received: bool,
    torrents_updated: bool,
    server_stats_updated: bool,

    server_settings: ServerSettings,
    server_stats: ServerStats,
    torrents: Vec<Torrent>,
    /// Torrents reported by the first cycle, held back until connected
    pending_initial_delta: Option<ListDelta>,

    update_deadline: Option<Instant>,
    reconnect_deadline: Option<Instant>,

    locality_probe: LocalityProbe,
    locality_generation: u64,
    locality_task: Option<JoinHandle<()>>,
    locality_sender: mpsc::UnboundedSender<LocalityResult>,
    server_is_local: Option<bool>,
}

impl Rpc {
    /// Creates a disconnected engine publishing to `events`.
    ///
    /// The returned receivers carry transport completions and locality
    /// probe results; the owner feeds them back into this engine.
    pub fn new(
        events: mpsc::UnboundedSender<RpcEvent>,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<TransportEvent>,
        mpsc::UnboundedReceiver<LocalityResult>,
    ) {
        let (router, transport_receiver) = RequestRouter::new();
        let (locality_sender, locality_receiver) = mpsc::unbounded_channel();
        let rpc = Self {
            connection: ConnectionConfig::default(),
            router,
            events,
            status: Status::default(),
            updating: false,
            update_disabled: false,
            rpc_version_checked: false,
            server_settings_updated: false,
            torrent_list_received: false,
            torrents_updated: false,
            server_stats_updated: false,
            server_settings: ServerSettings::default(),
            server_stats: ServerStats::default(),
            torrents: Vec::new(),
            pending_initial_delta: None,
            update_deadline: None,
            reconnect_deadline: None,
            locality_probe: LocalityProbe::default(),
            locality_generation: 0,
            locality_task: None,
            locality_sender,
            server_is_local: None,
        };
        (rpc, transport_receiver, locality_receiver)
    }

    pub fn set_locality_probe(&mut self, probe: LocalityProbe) {
        self.locality_probe = probe;
    }

    /// Disconnects and points the engine at another daemon.
    ///
    /// # Errors
    /// - `ConfigError::InvalidServerUrl` - Address does not form a valid URL
    /// - `ConfigError::InvalidCertificate` - Pinned chain is not valid PEM
    pub fn set_server(
        &mut self,
        server: ServerConfig,
        connection: ConnectionConfig,
        client: Arc<dyn HttpClient>,
    ) -> Result<(), ConfigError> {
        self.disconnect();
        if let Err(e) = self.router.set_configuration(&server, &connection, client) {
            self.router.reset_configuration();
            return Err(e);
        }
        self.connection = connection;
        Ok(())
    }

    /// Disconnects and forgets the daemon.
    pub fn reset_server(&mut self) {
        self.disconnect();
        self.router.reset_configuration();
    }

    pub fn is_configured(&self) -> bool {
        self.router.is_configured()
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    pub fn torrents(&self) -> &[Torrent] {
        &self.torrents
    }

    pub fn torrent(&self, id: i64) -> Option<&Torrent> {
        self.torrents.iter().find(|torrent| torrent.id() == id)
    }

    pub fn server_settings(&self) -> &ServerSettings {
        &self.server_settings
    }

    pub fn server_stats(&self) -> &ServerStats {
        &self.server_stats
    }

    /// Whether the daemon runs on this machine, once probed.
    pub fn server_is_local(&self) -> Option<bool> {
        self.server_is_local
    }

    /// True when no request is in flight.
    pub fn is_idle(&self) -> bool {
        !self.router.has_pending_requests()
    }

    pub fn update_deadline(&self) -> Option<Instant> {
        self.update_deadline
    }

    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.reconnect_deadline
    }

    pub fn connect(&mut self) {
        if self.status.connection_state != ConnectionState::Disconnected {
            return;
        }
        let Some(url) = self.router.url() else {
            tracing::warn!("Cannot connect: no server configured");
            return;
        };

        tracing::info!("Connecting to {url}");
        self.reconnect_deadline = None;
        self.set_status(Status::connecting());
        self.get_server_settings();
    }

    pub fn disconnect(&mut self) {
        self.reconnect_deadline = None;
        self.set_status(Status::default());
    }

    /// Stops or resumes polling. Disabling also cancels a pending reconnect.
    pub fn set_update_disabled(&mut self, disabled: bool) {
        if disabled == self.update_disabled {
            return;
        }
        self.update_disabled = disabled;
        if disabled {
            tracing::debug!("Updates disabled");
            self.reconnect_deadline = None;
            self.update_deadline = None;
        } else {
            tracing::debug!("Updates enabled");
            self.update_data(true);
        }
    }

    /// Starts a poll cycle unless one is running.
    pub fn update_data(&mut self, update_server_settings: bool) {
        if !self.is_connected() || self.updating {
            return;
        }
        tracing::debug!("Updating data");

        self.update_deadline = None;
        self.updating = true;
        self.server_settings_updated = !update_server_settings;
        self.torrent_list_received = false;
        self.torrents_updated = false;
        self.server_stats_updated = false;

        if update_server_settings {
            self.get_server_settings();
        }
        self.get_torrents();
        self.get_server_stats();
    }

    pub fn on_update_timer(&mut self) {
        self.update_deadline = None;
        self.update_data(true);
    }

    pub fn on_reconnect_timer(&mut self) {
        self.reconnect_deadline = None;
        tracing::info!("Reconnecting");
        self.connect();
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match self.router.on_event(event) {
            Some(RouterOutput::Response {
                tag,
                method,
                response,
            }) => {
                tracing::trace!("Handling '{method}' response");
                self.on_response(tag, response);
            }
            Some(RouterOutput::Failed {
                tag,
                method,
                failure,
            }) => {
                tracing::warn!("'{method}' request failed ({tag:?}): {failure}");
                self.fail(failure);
            }
            None => {}
        }
    }

    pub fn handle_locality_result(&mut self, result: LocalityResult) {
        if result.generation != self.locality_generation {
            tracing::debug!("Discarding stale locality result");
            return;
        }
        self.locality_task = None;
        self.server_is_local = Some(result.is_local);
        self.maybe_finish_update();
    }

    pub fn add_torrent_link(&mut self, link: String, options: AddTorrentOptions) {
        let mut arguments = arguments(json!({
            "filename": link,
            "bandwidthPriority": options.bandwidth_priority.to_rpc(),
            "paused": !options.start,
        }));
        if let Some(directory) = options.download_directory {
            arguments.insert("download-dir".to_string(), directory.into());
        }
        self.post_command(
            "torrent-add",
            arguments,
            RequestKind::AddTorrent {
                renamed_files: options.renamed_files,
            },
        );
    }

    /// Adds a torrent file; `metainfo` is its base64 encoded content.
    pub fn add_torrent_file(&mut self, metainfo: String, options: AddTorrentOptions) {
        let mut arguments = arguments(json!({
            "metainfo": metainfo,
            "files-unwanted": options.unwanted_files,
            "priority-high": options.high_priority_files,
            "priority-low": options.low_priority_files,
            "bandwidthPriority": options.bandwidth_priority.to_rpc(),
            "paused": !options.start,
        }));
        if let Some(directory) = options.download_directory {
            arguments.insert("download-dir".to_string(), directory.into());
        }
        self.post_command(
            "torrent-add",
            arguments,
            RequestKind::AddTorrent {
                renamed_files: options.renamed_files,
            },
        );
    }

    pub fn start_torrents(&mut self, ids: Vec<i64>, now: bool) {
        let method = if now {
            "torrent-start-now"
        } else {
            "torrent-start"
        };
        self.post_command(method, arguments(json!({"ids": ids})), RequestKind::UpdateOnSuccess);
    }

    pub fn stop_torrents(&mut self, ids: Vec<i64>) {
        self.post_command(
            "torrent-stop",
            arguments(json!({"ids": ids})),
            RequestKind::UpdateOnSuccess,
        );
    }

    pub fn remove_torrents(&mut self, ids: Vec<i64>, delete_files: bool) {
        self.post_command(
            "torrent-remove",
            arguments(json!({"ids": ids, "delete-local-data": delete_files})),
            RequestKind::UpdateOnSuccess,
        );
    }

    pub fn verify_torrents(&mut self, ids: Vec<i64>) {
        self.post_command(
            "torrent-verify",
            arguments(json!({"ids": ids})),
            RequestKind::UpdateOnSuccess,
        );
    }

    pub fn move_torrents_in_queue(&mut self, ids: Vec<i64>, movement: QueueMovement) {
        self.post_command(
            movement.method(),
            arguments(json!({"ids": ids})),
            RequestKind::UpdateOnSuccess,
        );
    }

    pub fn reannounce_torrents(&mut self, ids: Vec<i64>) {
        self.post_command(
            "torrent-reannounce",
            arguments(json!({"ids": ids})),
            RequestKind::Fire,
        );
    }

    pub fn set_session_properties(&mut self, properties: JsonObject) {
        self.post_command("session-set", properties, RequestKind::Fire);
    }

    pub fn set_torrent_property(&mut self, id: i64, property: TorrentProperty) {
        let (key, value) = property.key_value();
        let mut arguments = arguments(json!({"ids": [id]}));
        arguments.insert(key.to_string(), value);
        self.post_command(
            "torrent-set",
            arguments,
            RequestKind::TorrentSet {
                update_if_successful: property.updates_on_success(),
            },
        );
    }

    pub fn set_torrents_location(&mut self, ids: Vec<i64>, location: String, move_files: bool) {
        self.post_command(
            "torrent-set-location",
            arguments(json!({"ids": ids, "location": location, "move": move_files})),
            RequestKind::UpdateOnSuccess,
        );
    }

    pub fn rename_torrent_file(&mut self, torrent_id: i64, path: String, new_name: String) {
        let arguments = arguments(json!({"ids": [torrent_id], "path": path, "name": new_name}));
        self.post_command(
            "torrent-rename-path",
            arguments,
            RequestKind::RenameFile {
                torrent_id,
                path,
                new_name,
            },
        );
    }

    pub fn get_download_dir_free_space(&mut self) {
        self.post_command(
            "session-get",
            arguments(json!({"fields": ["download-dir-free-space"]})),
            RequestKind::DownloadDirFreeSpace,
        );
    }

    pub fn get_free_space_for_path(&mut self, path: String) {
        self.post_command(
            "free-space",
            arguments(json!({"path": path})),
            RequestKind::FreeSpaceForPath,
        );
    }

    /// Asks the daemon to exit.
    pub fn shutdown_server(&mut self) {
        self.post_command("session-close", JsonObject::new(), RequestKind::ShutdownServer);
    }

    /// Enabling fetches the file list right away; disabling drops it.
    pub fn set_torrent_files_enabled(&mut self, id: i64, enabled: bool) {
        let Some(torrent) = self.torrents.iter_mut().find(|torrent| torrent.id() == id) else {
            return;
        };
        if torrent.files_enabled() == enabled {
            return;
        }

        let delta = torrent.set_files_enabled(enabled);
        if enabled {
            if self.is_connected() {
                self.get_torrent_files(id);
            }
        } else {
            if !delta.is_empty() {
                self.emit(RpcEvent::TorrentFilesUpdated {
                    torrent_id: id,
                    delta,
                });
            }
            self.check_if_torrents_updated();
            self.maybe_finish_update();
        }
    }

    pub fn set_torrent_peers_enabled(&mut self, id: i64, enabled: bool) {
        let Some(torrent) = self.torrents.iter_mut().find(|torrent| torrent.id() == id) else {
            return;
        };
        if torrent.peers_enabled() == enabled {
            return;
        }

        let delta = torrent.set_peers_enabled(enabled);
        if enabled {
            if self.is_connected() {
                self.get_torrent_peers(id);
            }
        } else {
            if !delta.is_empty() {
                self.emit(RpcEvent::TorrentPeersUpdated {
                    torrent_id: id,
                    delta,
                });
            }
            self.check_if_torrents_updated();
            self.maybe_finish_update();
        }
    }

    fn emit(&self, event: RpcEvent) {
        let _ = self.events.send(event);
    }

    fn post(&mut self, method: &str, arguments: JsonObject, kind: RequestKind) {
        self.router.post_request(method, arguments, kind);
    }

    /// Mutations and one-off queries only make sense while connected.
    fn post_command(&mut self, method: &str, arguments: JsonObject, kind: RequestKind) {
        if !self.is_connected() {
            tracing::debug!("Ignoring '{method}' while not connected");
            return;
        }
        self.post(method, arguments, kind);
    }

    fn set_status(&mut self, status: Status) {
        if status == self.status {
            return;
        }
        let was_connected = self.status.is_connected();
        self.status = status;

        match self.status.connection_state {
            ConnectionState::Disconnected => {
                tracing::info!("Disconnected");
                self.router.cancel_all();
                self.updating = false;
                self.rpc_version_checked = false;
                self.server_settings_updated = false;
                self.torrent_list_received = false;
                self.torrents_updated = false;
                self.server_stats_updated = false;
                self.update_deadline = None;
                self.pending_initial_delta = None;
                self.abort_locality_probe();
            }
            ConnectionState::Connecting => {
                self.updating = true;
            }
            ConnectionState::Connected => {
                if let Some(url) = self.router.url() {
                    tracing::info!("Connected to {url}");
                }
            }
        }

        self.emit(RpcEvent::StatusChanged(self.status.clone()));

        match self.status.connection_state {
            ConnectionState::Disconnected => {
                if was_connected && !self.torrents.is_empty() {
                    self.emit(RpcEvent::TorrentsUpdated(ListDelta::all_removed(
                        self.torrents.len(),
                    )));
                }
                self.torrents.clear();
            }
            ConnectionState::Connected => {
                if let Some(delta) = self.pending_initial_delta.take() {
                    self.emit(RpcEvent::TorrentsUpdated(delta));
                }
            }
            ConnectionState::Connecting => {}
        }
    }

    /// Drops the connection after a terminal failure, arming the reconnect
    /// timer unless the daemon speaks an unsupported protocol version.
    fn fail(&mut self, failure: RequestFailure) {
        let recoverable = !matches!(
            failure.kind,
            RpcErrorKind::ServerTooOld | RpcErrorKind::ServerTooNew
        );
        self.set_status(Status::failed(
            failure.kind,
            failure.message,
            failure.detailed_message,
        ));

        if recoverable && self.connection.auto_reconnect_enabled && !self.update_disabled {
            tracing::info!(
                "Reconnecting in {:?}",
                self.connection.auto_reconnect_interval
            );
            self.reconnect_deadline = Some(Instant::now() + self.connection.auto_reconnect_interval);
        }
    }

    fn get_server_settings(&mut self) {
        self.post("session-get", JsonObject::new(), RequestKind::ServerSettings);
    }

    fn get_torrents(&mut self) {
        self.post(
            "torrent-get",
            arguments(json!({"fields": TORRENT_FIELDS})),
            RequestKind::Torrents,
        );
    }

    fn get_torrent_files(&mut self, id: i64) {
        self.post(
            "torrent-get",
            arguments(json!({"fields": ["files", "fileStats"], "ids": [id]})),
            RequestKind::TorrentFiles { id },
        );
    }

    fn get_torrent_peers(&mut self, id: i64) {
        self.post(
            "torrent-get",
            arguments(json!({"fields": ["peers"], "ids": [id]})),
            RequestKind::TorrentPeers { id },
        );
    }

    fn get_server_stats(&mut self) {
        self.post("session-stats", JsonObject::new(), RequestKind::ServerStats);
    }

    fn start_locality_probe(&mut self) {
        let Some(url) = self.router.url().cloned() else {
            return;
        };
        self.abort_locality_probe();

        let generation = self.locality_generation;
        let session_id = self.router.session_id().map(str::to_string);
        let probe = self.locality_probe.clone();
        let sender = self.locality_sender.clone();
        self.locality_task = Some(tokio::spawn(async move {
            let is_local = probe.is_local(&url, session_id.as_deref()).await;
            let _ = sender.send(LocalityResult {
                generation,
                is_local,
            });
        }));
    }

    fn abort_locality_probe(&mut self) {
        self.locality_generation += 1;
        if let Some(task) = self.locality_task.take() {
            task.abort();
        }
        self.server_is_local = None;
    }

    fn on_response(&mut self, kind: RequestKind, response: Response) {
        match kind {
            RequestKind::ServerSettings => self.on_server_settings(response),
            RequestKind::Torrents => self.on_torrents(response),
            RequestKind::TorrentFiles { id } => self.on_torrent_files(id, response),
            RequestKind::TorrentPeers { id } => self.on_torrent_peers(id, response),
            RequestKind::CheckSingleFile => self.on_single_file_check(response),
            RequestKind::ServerStats => {
                if response.success {
                    self.server_stats.update(&response.arguments);
                    self.emit(RpcEvent::ServerStatsUpdated(self.server_stats));
                }
                self.server_stats_updated = true;
                self.maybe_finish_update();
            }
            RequestKind::AddTorrent { renamed_files } => {
                self.on_torrent_added(renamed_files, response)
            }
            RequestKind::UpdateOnSuccess => {
                if response.success {
                    self.update_data(false);
                }
            }
            RequestKind::Fire => {}
            RequestKind::TorrentSet {
                update_if_successful,
            } => {
                if response.success && update_if_successful {
                    self.update_data(false);
                }
            }
            RequestKind::RenameFile {
                torrent_id,
                path,
                new_name,
            } => {
                if response.success {
                    self.emit(RpcEvent::TorrentFileRenamed {
                        torrent_id,
                        path,
                        new_name,
                    });
                    self.update_data(false);
                }
            }
            RequestKind::DownloadDirFreeSpace => {
                if response.success {
                    self.emit(RpcEvent::DownloadDirFreeSpace(json::int(
                        &response.arguments,
                        "download-dir-free-space",
                    )));
                }
            }
            RequestKind::FreeSpaceForPath => {
                let bytes = if response.success {
                    json::int(&response.arguments, "size-bytes")
                } else {
                    -1
                };
                self.emit(RpcEvent::FreeSpaceForPath {
                    path: json::string(&response.arguments, "path"),
                    success: response.success,
                    bytes,
                });
            }
            RequestKind::ShutdownServer => {
                if response.success {
                    tracing::info!("Successfully sent shutdown request, disconnecting");
                    self.disconnect();
                }
            }
        }
    }

    fn on_server_settings(&mut self, response: Response) {
        if !response.success {
            if !self.rpc_version_checked {
                self.fail(RequestFailure::new(
                    RpcErrorKind::ConnectionError,
                    format!("Failed to get server settings: {}", response.result),
                ));
                return;
            }
            self.server_settings_updated = true;
            self.maybe_finish_update();
            return;
        }

        if self.server_settings.update(&response.arguments) {
            self.emit(RpcEvent::ServerSettingsChanged(Box::new(
                self.server_settings.clone(),
            )));
        }
        self.server_settings_updated = true;

        if self.rpc_version_checked {
            self.maybe_finish_update();
            return;
        }

        self.rpc_version_checked = true;
        let settings = &self.server_settings;
        if settings.is_too_new() {
            tracing::warn!(
                "Server is too new, it requires RPC version {} or later",
                settings.minimum_rpc_version
            );
            self.fail(RequestFailure::new(
                RpcErrorKind::ServerTooNew,
                RpcErrorKind::ServerTooNew.description(),
            ));
        } else if settings.is_too_old() {
            tracing::warn!("Server is too old, RPC version is {}", settings.rpc_version);
            self.fail(RequestFailure::new(
                RpcErrorKind::ServerTooOld,
                RpcErrorKind::ServerTooOld.description(),
            ));
        } else {
            tracing::debug!("RPC version is {}", settings.rpc_version);
            self.get_torrents();
            self.get_server_stats();
            self.start_locality_probe();
        }
    }

    fn on_torrents(&mut self, response: Response) {
        self.torrent_list_received = true;
        if !response.success {
            self.torrents_updated = true;
            self.maybe_finish_update();
            return;
        }

        let mut reply_arguments = response.arguments;
        let snapshot: Vec<(i64, JsonObject)> = match reply_arguments.remove("torrents") {
            Some(Value::Array(torrents)) => torrents
                .into_iter()
                .filter_map(|torrent| match torrent {
                    Value::Object(torrent) => Some((json::int(&torrent, "id"), torrent)),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };

        let mut updater = TorrentsUpdater::default();
        let delta = updater.update(&mut self.torrents, snapshot);

        for &id in &updater.finished {
            self.emit(RpcEvent::TorrentFinished { id });
        }
        if self.is_connected() {
            for &id in &updater.added {
                self.emit(RpcEvent::TorrentAdded { id });
            }
        }
        if !delta.is_empty() {
            if self.status.connection_state == ConnectionState::Connecting {
                self.pending_initial_delta = Some(delta);
            } else {
                self.emit(RpcEvent::TorrentsUpdated(delta));
            }
        }

        let children: Vec<(i64, bool, bool)> = self
            .torrents
            .iter()
            .filter(|torrent| torrent.files_enabled() || torrent.peers_enabled())
            .map(|torrent| (torrent.id(), torrent.files_enabled(), torrent.peers_enabled()))
            .collect();
        for (id, files, peers) in children {
            if files {
                self.get_torrent_files(id);
            }
            if peers {
                self.get_torrent_peers(id);
            }
        }

        self.check_if_torrents_updated();
        self.maybe_finish_update();

        if !updater.metadata_completed.is_empty() {
            self.post(
                "torrent-get",
                arguments(json!({
                    "fields": ["id", "priorities"],
                    "ids": updater.metadata_completed,
                })),
                RequestKind::CheckSingleFile,
            );
        }
    }

    fn on_torrent_files(&mut self, id: i64, response: Response) {
        if let Some(index) = self.torrent_index(id) {
            let torrent = &mut self.torrents[index];
            match first_torrent(&response) {
                Some(entry) if torrent.files_enabled() => {
                    let delta = torrent.update_files(entry);
                    if !delta.is_empty() {
                        self.emit(RpcEvent::TorrentFilesUpdated {
                            torrent_id: id,
                            delta,
                        });
                    }
                }
                _ => torrent.mark_files_updated(),
            }
        }
        self.check_if_torrents_updated();
        self.maybe_finish_update();
    }

    fn on_torrent_peers(&mut self, id: i64, response: Response) {
        if let Some(index) = self.torrent_index(id) {
            let torrent = &mut self.torrents[index];
            match first_torrent(&response) {
                Some(entry) if torrent.peers_enabled() => {
                    let delta = torrent.update_peers(entry);
                    if !delta.is_empty() {
                        self.emit(RpcEvent::TorrentPeersUpdated {
                            torrent_id: id,
                            delta,
                        });
                    }
                }
                _ => torrent.mark_peers_updated(),
            }
        }
        self.check_if_torrents_updated();
        self.maybe_finish_update();
    }

    fn on_single_file_check(&mut self, response: Response) {
        if !response.success {
            return;
        }
        let mut changed = Vec::new();
        for entry in json::array(&response.arguments, "torrents")
            .iter()
            .filter_map(Value::as_object)
        {
            let Some(index) = self.torrent_index(json::int(entry, "id")) else {
                continue;
            };
            if self.torrents[index].check_single_file(entry) {
                changed.push(index..index + 1);
            }
        }

        if self.is_connected() && !changed.is_empty() {
            self.emit(RpcEvent::TorrentsUpdated(ListDelta {
                changed,
                ..Default::default()
            }));
        }
    }

    fn on_torrent_added(&mut self, renamed_files: BTreeMap<String, String>, response: Response) {
        if !response.success {
            self.emit(RpcEvent::TorrentAddError {
                message: response.result,
            });
            return;
        }
        if response.arguments.contains_key("torrent-duplicate") {
            self.emit(RpcEvent::TorrentAddDuplicate);
            return;
        }

        if !renamed_files.is_empty() {
            match json::object(&response.arguments, "torrent-added") {
                Some(added) => {
                    let id = json::int(added, "id");
                    for (path, new_name) in renamed_files {
                        self.rename_torrent_file(id, path, new_name);
                    }
                }
                None => tracing::warn!("Added torrent is missing from reply, cannot rename files"),
            }
        }
        self.update_data(false);
    }

    /// Sets the torrents flag once the list and every enabled child list
    /// of this cycle arrived.
    fn check_if_torrents_updated(&mut self) {
        if !self.updating || !self.torrent_list_received || self.torrents_updated {
            return;
        }
        if self.torrents.iter().all(Torrent::is_updated) {
            self.torrents_updated = true;
        }
    }

    fn maybe_finish_update(&mut self) {
        if !self.updating
            || !self.server_settings_updated
            || !self.torrents_updated
            || !self.server_stats_updated
        {
            return;
        }

        if self.status.connection_state == ConnectionState::Connecting {
            if self.server_is_local.is_none() {
                return;
            }
            self.set_status(Status::connected());
        }

        self.updating = false;
        if !self.update_disabled {
            self.update_deadline = Some(Instant::now() + self.connection.update_interval);
        }
    }

    fn torrent_index(&self, id: i64) -> Option<usize> {
        self.torrents.iter().position(|torrent| torrent.id() == id)
    }
}

fn arguments(value: Value) -> JsonObject {
    match value {
        Value::Object(arguments) => arguments,
        _ => JsonObject::new(),
    }
}

fn first_torrent(response: &Response) -> Option<&JsonObject> {
    if !response.success {
        return None;
    }
    json::array(&response.arguments, "torrents")
        .first()
        .and_then(Value::as_object)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio::time::timeout;
    use tokio_test::assert_ok;

    use super::*;
    use crate::engine::test_mocks::{FakeDaemon, ScriptedClient, network_error, reply};
    use crate::rpc::NetworkErrorKind;

    const QUIET_PERIOD: Duration = Duration::from_millis(200);

    struct Harness {
        rpc: Rpc,
        transport: mpsc::UnboundedReceiver<TransportEvent>,
        locality: mpsc::UnboundedReceiver<LocalityResult>,
        events: mpsc::UnboundedReceiver<RpcEvent>,
        _marker_directory: TempDir,
    }

    impl Harness {
        fn new(client: Arc<dyn HttpClient>, connection: ConnectionConfig) -> Self {
            let (sender, events) = mpsc::unbounded_channel();
            let (mut rpc, transport, locality) = Rpc::new(sender);
            let marker_directory = tempfile::tempdir().unwrap();
            rpc.set_locality_probe(LocalityProbe::with_marker_directory(marker_directory.path()));
            assert_ok!(rpc.set_server(ServerConfig::new("127.0.0.1", 9091), connection, client));
            Self {
                rpc,
                transport,
                locality,
                events,
                _marker_directory: marker_directory,
            }
        }

        fn with_daemon(daemon: &Arc<FakeDaemon>) -> Self {
            Self::new(daemon.clone(), ConnectionConfig::default())
        }

        /// Handles one background completion. Returns false after `wait`
        /// without any.
        async fn step(&mut self, wait: Duration) -> bool {
            tokio::select! {
                Some(event) = self.transport.recv() => {
                    self.rpc.handle_transport_event(event);
                    true
                }
                Some(result) = self.locality.recv() => {
                    self.rpc.handle_locality_result(result);
                    true
                }
                _ = tokio::time::sleep(wait) => false,
            }
        }

        /// Handles completions until nothing happens for a while.
        async fn settle(&mut self) {
            while self.step(QUIET_PERIOD).await {}
        }

        async fn connect(&mut self) {
            self.rpc.connect();
            timeout(Duration::from_secs(5), async {
                while !self.rpc.is_connected() {
                    self.step(Duration::from_secs(5)).await;
                }
            })
            .await
            .expect("engine did not connect");
            self.settle().await;
        }

        fn take_events(&mut self) -> Vec<RpcEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn daemon_with_torrents(torrents: Vec<Value>) -> Arc<FakeDaemon> {
        let daemon = Arc::new(FakeDaemon::new());
        daemon.set_torrents(torrents);
        daemon
    }

    fn is_structural(event: &RpcEvent) -> bool {
        matches!(event, RpcEvent::StatusChanged(_) | RpcEvent::TorrentsUpdated(_))
    }

    #[tokio::test]
    async fn test_connect_reaches_connected_before_reporting_torrents() {
        let daemon = daemon_with_torrents(vec![
            json!({"id": 1, "name": "first"}),
            json!({"id": 2, "name": "second"}),
        ]);
        let mut harness = Harness::with_daemon(&daemon);

        harness.connect().await;

        let events: Vec<RpcEvent> = harness.take_events().into_iter().filter(is_structural).collect();
        assert_eq!(
            events,
            vec![
                RpcEvent::StatusChanged(Status::connecting()),
                RpcEvent::StatusChanged(Status::connected()),
                RpcEvent::TorrentsUpdated(ListDelta {
                    added: 2,
                    ..Default::default()
                }),
            ]
        );
        assert!(harness.rpc.update_deadline().is_some());
        assert_eq!(harness.rpc.server_is_local(), Some(true));
        assert_eq!(harness.rpc.torrents().len(), 2);
        assert_eq!(daemon.methods()[0], "session-get");
    }

    #[tokio::test]
    async fn test_missing_torrent_list_keeps_connecting() {
        let daemon = daemon_with_torrents(vec![json!({"id": 1})]);
        daemon.hold_requests(|method, _| method == "torrent-get");
        let mut harness = Harness::with_daemon(&daemon);

        harness.rpc.connect();
        harness.settle().await;

        assert_eq!(
            harness.rpc.status().connection_state,
            ConnectionState::Connecting
        );
        assert!(harness.rpc.update_deadline().is_none());
        assert!(harness.rpc.server_is_local().is_some());
        assert!(
            !harness
                .take_events()
                .contains(&RpcEvent::StatusChanged(Status::connected()))
        );
    }

    #[tokio::test]
    async fn test_enabled_files_gate_cycle_completion() {
        let daemon = daemon_with_torrents(vec![json!({
            "id": 1,
            "files": [{"name": "a/1", "length": 10}, {"name": "a/2", "length": 20}],
            "fileStats": [
                {"bytesCompleted": 0, "wanted": true, "priority": 0},
                {"bytesCompleted": 0, "wanted": true, "priority": 0},
            ],
        })]);
        let mut harness = Harness::with_daemon(&daemon);
        harness.connect().await;
        harness.take_events();

        harness.rpc.set_torrent_files_enabled(1, true);
        harness.settle().await;
        assert!(harness.take_events().contains(&RpcEvent::TorrentFilesUpdated {
            torrent_id: 1,
            delta: ListDelta {
                added: 2,
                ..Default::default()
            },
        }));
        assert_eq!(harness.rpc.torrent(1).unwrap().files().len(), 2);

        daemon.hold_requests(|method, arguments| {
            method == "torrent-get" && arguments.contains_key("ids")
        });
        daemon.clear_requests();
        harness.rpc.on_update_timer();
        harness.settle().await;

        assert_eq!(
            daemon.arguments_of("torrent-get").len(),
            2,
            "list fetch followed by the file fetch"
        );
        assert!(
            harness.rpc.update_deadline().is_none(),
            "cycle must wait for the file list"
        );
    }

    #[tokio::test]
    async fn test_disabling_files_drops_file_list() {
        let daemon = daemon_with_torrents(vec![json!({
            "id": 1,
            "files": [{"name": "a", "length": 10}],
            "fileStats": [{"bytesCompleted": 0, "wanted": true, "priority": 0}],
        })]);
        let mut harness = Harness::with_daemon(&daemon);
        harness.connect().await;
        harness.rpc.set_torrent_files_enabled(1, true);
        harness.settle().await;
        harness.take_events();

        harness.rpc.set_torrent_files_enabled(1, false);

        assert_eq!(
            harness.take_events(),
            vec![RpcEvent::TorrentFilesUpdated {
                torrent_id: 1,
                delta: ListDelta::all_removed(1),
            }]
        );
        assert!(harness.rpc.torrent(1).unwrap().files().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_removes_all_torrents() {
        let daemon = daemon_with_torrents(vec![json!({"id": 1}), json!({"id": 2})]);
        let mut harness = Harness::with_daemon(&daemon);
        harness.connect().await;
        harness.take_events();

        harness.rpc.disconnect();

        assert_eq!(
            harness.take_events(),
            vec![
                RpcEvent::StatusChanged(Status::default()),
                RpcEvent::TorrentsUpdated(ListDelta::all_removed(2)),
            ]
        );
        assert!(harness.rpc.torrents().is_empty());
        assert!(harness.rpc.update_deadline().is_none());
        assert!(harness.rpc.server_is_local().is_none());
    }

    #[tokio::test]
    async fn test_unsupported_rpc_versions_are_rejected() {
        let daemon = Arc::new(FakeDaemon::new().with_rpc_version(13, 1));
        let mut harness = Harness::with_daemon(&daemon);
        harness.rpc.connect();
        harness.settle().await;

        assert_eq!(harness.rpc.status().error, Some(RpcErrorKind::ServerTooOld));
        assert_eq!(
            harness.rpc.status().connection_state,
            ConnectionState::Disconnected
        );
        assert!(!daemon.methods().contains(&"torrent-get".to_string()));

        let daemon = Arc::new(FakeDaemon::new().with_rpc_version(20, 15));
        let mut harness = Harness::with_daemon(&daemon);
        harness.rpc.connect();
        harness.settle().await;

        assert_eq!(harness.rpc.status().error, Some(RpcErrorKind::ServerTooNew));
    }

    #[tokio::test]
    async fn test_connection_failure_arms_reconnect_when_enabled() {
        for enabled in [true, false] {
            let client = Arc::new(ScriptedClient::new());
            client.push(Err(network_error(NetworkErrorKind::Connection)));
            let connection = ConnectionConfig {
                retry_attempts: 0,
                auto_reconnect_enabled: enabled,
                ..Default::default()
            };
            let mut harness = Harness::new(client, connection);

            harness.rpc.connect();
            harness.settle().await;

            assert_eq!(
                harness.rpc.status().error,
                Some(RpcErrorKind::ConnectionError)
            );
            assert_eq!(harness.rpc.reconnect_deadline().is_some(), enabled);
        }
    }

    #[tokio::test]
    async fn test_authentication_and_parse_failures_arm_reconnect() {
        for (status, body, kind) in [
            (401, "", RpcErrorKind::AuthenticationError),
            (200, "<html>", RpcErrorKind::ParseError),
        ] {
            let client = Arc::new(ScriptedClient::new());
            client.push(Ok(reply(status, "", body)));
            let connection = ConnectionConfig {
                auto_reconnect_enabled: true,
                ..Default::default()
            };
            let mut harness = Harness::new(client, connection);

            harness.rpc.connect();
            harness.settle().await;

            assert_eq!(harness.rpc.status().error, Some(kind));
            assert!(harness.rpc.reconnect_deadline().is_some());
        }
    }

    #[tokio::test]
    async fn test_unsupported_version_does_not_reconnect() {
        let daemon = Arc::new(FakeDaemon::new().with_rpc_version(13, 1));
        let mut harness = Harness::new(
            daemon.clone(),
            ConnectionConfig {
                auto_reconnect_enabled: true,
                ..Default::default()
            },
        );

        harness.rpc.connect();
        harness.settle().await;

        assert_eq!(harness.rpc.status().error, Some(RpcErrorKind::ServerTooOld));
        assert!(harness.rpc.reconnect_deadline().is_none());
    }

    #[tokio::test]
    async fn test_explicit_disconnect_cancels_reconnect() {
        let client = Arc::new(ScriptedClient::new());
        client.push(Err(network_error(NetworkErrorKind::TimedOut)));
        let connection = ConnectionConfig {
            retry_attempts: 0,
            auto_reconnect_enabled: true,
            ..Default::default()
        };
        let mut harness = Harness::new(client, connection);
        harness.rpc.connect();
        harness.settle().await;
        assert_eq!(harness.rpc.status().error, Some(RpcErrorKind::TimedOut));
        assert!(harness.rpc.reconnect_deadline().is_some());

        harness.rpc.disconnect();
        assert!(harness.rpc.reconnect_deadline().is_none());
    }

    #[tokio::test]
    async fn test_stale_locality_result_is_ignored() {
        let daemon = daemon_with_torrents(Vec::new());
        let mut harness = Harness::with_daemon(&daemon);
        harness.connect().await;
        let generation = harness.rpc.locality_generation;

        harness.rpc.disconnect();
        harness.rpc.handle_locality_result(LocalityResult {
            generation,
            is_local: false,
        });

        assert_eq!(harness.rpc.server_is_local(), None);
    }

    #[tokio::test]
    async fn test_poll_cycle_reports_differences() {
        let daemon = daemon_with_torrents(vec![
            json!({"id": 1, "name": "first"}),
            json!({"id": 2, "name": "second", "leftUntilDone": 10}),
        ]);
        let mut harness = Harness::with_daemon(&daemon);
        harness.connect().await;
        harness.take_events();

        daemon.set_torrents(vec![
            json!({"id": 2, "name": "second", "leftUntilDone": 0}),
            json!({"id": 3, "name": "third"}),
        ]);
        harness.rpc.on_update_timer();
        harness.settle().await;

        let events = harness.take_events();
        assert!(events.contains(&RpcEvent::TorrentFinished { id: 2 }));
        assert!(events.contains(&RpcEvent::TorrentAdded { id: 3 }));
        assert!(events.contains(&RpcEvent::TorrentsUpdated(ListDelta {
            removed: vec![0..1],
            changed: vec![0..1],
            added: 1,
        })));
        let ids: Vec<i64> = harness.rpc.torrents().iter().map(Torrent::id).collect();
        assert_eq!(ids, [2, 3]);
        assert!(harness.rpc.update_deadline().is_some());
    }

    #[tokio::test]
    async fn test_session_rotation_while_connected() {
        let daemon = daemon_with_torrents(vec![json!({"id": 1})]);
        let mut harness = Harness::with_daemon(&daemon);
        harness.connect().await;

        daemon.set_session_id("rotated");
        harness.rpc.on_update_timer();
        harness.settle().await;

        assert!(harness.rpc.is_connected());
        assert!(harness.rpc.update_deadline().is_some());
    }

    #[tokio::test]
    async fn test_single_file_check_after_metadata() {
        let daemon = daemon_with_torrents(vec![json!({
            "id": 1,
            "metadataPercentComplete": 1.0,
            "priorities": [0],
        })]);
        let mut harness = Harness::with_daemon(&daemon);
        harness.connect().await;

        let check = daemon.arguments_of("torrent-get").into_iter().find(|arguments| {
            arguments.get("fields") == Some(&json!(["id", "priorities"]))
        });
        assert_eq!(check.unwrap().get("ids"), Some(&json!([1])));
        assert!(harness.rpc.torrent(1).unwrap().data().single_file);
    }

    #[tokio::test]
    async fn test_update_disable_stops_polling() {
        let daemon = daemon_with_torrents(Vec::new());
        let mut harness = Harness::with_daemon(&daemon);
        harness.connect().await;
        assert!(harness.rpc.update_deadline().is_some());

        harness.rpc.set_update_disabled(true);
        assert!(harness.rpc.update_deadline().is_none());

        daemon.clear_requests();
        harness.rpc.set_update_disabled(false);
        harness.settle().await;
        assert_eq!(
            daemon.methods(),
            ["session-get", "torrent-get", "session-stats"]
        );
        assert!(harness.rpc.update_deadline().is_some());
    }

    #[tokio::test]
    async fn test_commands_ignored_while_disconnected() {
        let daemon = daemon_with_torrents(Vec::new());
        let mut harness = Harness::with_daemon(&daemon);

        harness.rpc.start_torrents(vec![1], false);
        harness.rpc.get_free_space_for_path("/".to_string());
        harness.settle().await;

        assert!(daemon.methods().is_empty());
    }

    #[tokio::test]
    async fn test_add_torrent_renames_files_then_polls() {
        let daemon = daemon_with_torrents(Vec::new());
        let mut harness = Harness::with_daemon(&daemon);
        harness.connect().await;
        daemon.clear_requests();
        harness.take_events();

        let options = AddTorrentOptions {
            download_directory: Some("/data".to_string()),
            renamed_files: BTreeMap::from([("dir/a.txt".to_string(), "b.txt".to_string())]),
            ..Default::default()
        };
        harness
            .rpc
            .add_torrent_link("magnet:?xt=urn:btih:abc".to_string(), options);
        harness.settle().await;

        let add = &daemon.arguments_of("torrent-add")[0];
        assert_eq!(add.get("download-dir"), Some(&json!("/data")));
        assert_eq!(add.get("paused"), Some(&json!(true)));

        let rename = &daemon.arguments_of("torrent-rename-path")[0];
        assert_eq!(rename.get("ids"), Some(&json!([100])));
        assert_eq!(rename.get("name"), Some(&json!("b.txt")));

        assert!(harness.take_events().contains(&RpcEvent::TorrentFileRenamed {
            torrent_id: 100,
            path: "dir/a.txt".to_string(),
            new_name: "b.txt".to_string(),
        }));
        assert!(daemon.methods().contains(&"torrent-get".to_string()));
    }

    #[tokio::test]
    async fn test_add_torrent_duplicate_and_error() {
        let daemon = daemon_with_torrents(Vec::new());
        let mut harness = Harness::with_daemon(&daemon);
        harness.connect().await;
        harness.take_events();

        daemon.set_reply(
            "torrent-add",
            json!({"result": "success", "arguments": {"torrent-duplicate": {"id": 1}}}),
        );
        harness
            .rpc
            .add_torrent_file("ZGF0YQ==".to_string(), AddTorrentOptions::default());
        harness.settle().await;
        assert!(harness.take_events().contains(&RpcEvent::TorrentAddDuplicate));

        daemon.set_reply(
            "torrent-add",
            json!({"result": "invalid or corrupt torrent file", "arguments": {}}),
        );
        harness
            .rpc
            .add_torrent_file("ZGF0YQ==".to_string(), AddTorrentOptions::default());
        harness.settle().await;
        assert!(harness.take_events().contains(&RpcEvent::TorrentAddError {
            message: "invalid or corrupt torrent file".to_string()
        }));
        assert!(harness.rpc.is_connected(), "a rejected add keeps the connection");
    }

    #[tokio::test]
    async fn test_free_space_queries() {
        let daemon = daemon_with_torrents(Vec::new());
        let mut harness = Harness::with_daemon(&daemon);
        harness.connect().await;
        harness.take_events();

        harness.rpc.get_download_dir_free_space();
        harness.rpc.get_free_space_for_path("/data".to_string());
        harness.settle().await;

        let events = harness.take_events();
        assert!(events.contains(&RpcEvent::DownloadDirFreeSpace(1 << 30)));
        assert!(events.contains(&RpcEvent::FreeSpaceForPath {
            path: "/data".to_string(),
            success: true,
            bytes: 1 << 30,
        }));
    }

    #[tokio::test]
    async fn test_torrent_property_request() {
        let daemon = daemon_with_torrents(vec![json!({"id": 4})]);
        let mut harness = Harness::with_daemon(&daemon);
        harness.connect().await;
        daemon.clear_requests();

        harness
            .rpc
            .set_torrent_property(4, TorrentProperty::AddTrackers(vec!["udp://t:1".to_string()]));
        harness.settle().await;

        let set = &daemon.arguments_of("torrent-set")[0];
        assert_eq!(set.get("ids"), Some(&json!([4])));
        assert_eq!(set.get("trackerAdd"), Some(&json!(["udp://t:1"])));
        assert_eq!(
            daemon.methods()[1..],
            ["torrent-get", "session-stats"],
            "tracker edits poll on success"
        );
    }

    #[tokio::test]
    async fn test_shutdown_server_disconnects() {
        let daemon = daemon_with_torrents(Vec::new());
        let mut harness = Harness::with_daemon(&daemon);
        harness.connect().await;

        harness.rpc.shutdown_server();
        harness.settle().await;

        assert_eq!(*harness.rpc.status(), Status::default());
        assert!(daemon.methods().contains(&"session-close".to_string()));
    }
}
