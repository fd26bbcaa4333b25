//! Command definitions for the RPC engine actor.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::oneshot;

use crate::config::{ConfigError, ConnectionConfig, ServerConfig};
use crate::engine::Status;
use crate::model::{JsonObject, LimitMode, Priority, ServerSettings, ServerStats, Torrent};
use crate::rpc::HttpClient;

/// Options of a `torrent-add` call.
///
/// The file selection fields only apply when adding a torrent file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddTorrentOptions {
    /// Daemon default when `None`
    pub download_directory: Option<String>,
    pub bandwidth_priority: Priority,
    pub start: bool,
    pub unwanted_files: Vec<usize>,
    pub high_priority_files: Vec<usize>,
    pub low_priority_files: Vec<usize>,
    /// Paths inside the torrent mapped to their new names
    pub renamed_files: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMovement {
    Top,
    Up,
    Down,
    Bottom,
}

impl QueueMovement {
    pub fn method(self) -> &'static str {
        match self {
            QueueMovement::Top => "queue-move-top",
            QueueMovement::Up => "queue-move-up",
            QueueMovement::Down => "queue-move-down",
            QueueMovement::Bottom => "queue-move-bottom",
        }
    }
}

/// A single `torrent-set` property.
#[derive(Debug, Clone, PartialEq)]
pub enum TorrentProperty {
    DownloadSpeedLimited(bool),
    /// KiB/s
    DownloadSpeedLimit(i64),
    UploadSpeedLimited(bool),
    UploadSpeedLimit(i64),
    RatioLimitMode(LimitMode),
    RatioLimit(f64),
    PeersLimit(i64),
    HonorSessionLimits(bool),
    BandwidthPriority(Priority),
    IdleSeedingLimitMode(LimitMode),
    /// Minutes
    IdleSeedingLimit(i64),
    FilesWanted(Vec<usize>),
    FilesUnwanted(Vec<usize>),
    FilesPriority(Priority, Vec<usize>),
    AddTrackers(Vec<String>),
    ReplaceTracker { id: i64, announce: String },
    RemoveTrackers(Vec<i64>),
}

impl TorrentProperty {
    /// Argument name and value of the property.
    pub fn key_value(&self) -> (&'static str, Value) {
        match self {
            TorrentProperty::DownloadSpeedLimited(limited) => ("downloadLimited", json!(limited)),
            TorrentProperty::DownloadSpeedLimit(limit) => ("downloadLimit", json!(limit)),
            TorrentProperty::UploadSpeedLimited(limited) => ("uploadLimited", json!(limited)),
            TorrentProperty::UploadSpeedLimit(limit) => ("uploadLimit", json!(limit)),
            TorrentProperty::RatioLimitMode(mode) => ("seedRatioMode", json!(mode.to_rpc())),
            TorrentProperty::RatioLimit(limit) => ("seedRatioLimit", json!(limit)),
            TorrentProperty::PeersLimit(limit) => ("peer-limit", json!(limit)),
            TorrentProperty::HonorSessionLimits(honor) => ("honorsSessionLimits", json!(honor)),
            TorrentProperty::BandwidthPriority(priority) => {
                ("bandwidthPriority", json!(priority.to_rpc()))
            }
            TorrentProperty::IdleSeedingLimitMode(mode) => ("seedIdleMode", json!(mode.to_rpc())),
            TorrentProperty::IdleSeedingLimit(limit) => ("seedIdleLimit", json!(limit)),
            TorrentProperty::FilesWanted(files) => ("files-wanted", json!(files)),
            TorrentProperty::FilesUnwanted(files) => ("files-unwanted", json!(files)),
            TorrentProperty::FilesPriority(priority, files) => {
                let key = match priority {
                    Priority::Low => "priority-low",
                    Priority::Normal => "priority-normal",
                    Priority::High => "priority-high",
                };
                (key, json!(files))
            }
            TorrentProperty::AddTrackers(announces) => ("trackerAdd", json!(announces)),
            TorrentProperty::ReplaceTracker { id, announce } => {
                ("trackerReplace", json!([id, announce]))
            }
            TorrentProperty::RemoveTrackers(ids) => ("trackerRemove", json!(ids)),
        }
    }

    /// Properties whose effect only shows up in the next poll.
    pub fn updates_on_success(&self) -> bool {
        matches!(
            self,
            TorrentProperty::FilesWanted(_)
                | TorrentProperty::FilesUnwanted(_)
                | TorrentProperty::FilesPriority(..)
                | TorrentProperty::AddTrackers(_)
                | TorrentProperty::ReplaceTracker { .. }
                | TorrentProperty::RemoveTrackers(_)
        )
    }
}

/// Commands that can be sent to the RPC engine actor.
///
/// Mutations carry no responder: their outcome shows up as `RpcEvent`s
/// and in the next poll.
pub enum RpcCommand {
    SetServer {
        server: Box<ServerConfig>,
        connection: ConnectionConfig,
        client: Arc<dyn HttpClient>,
        responder: oneshot::Sender<Result<(), ConfigError>>,
    },
    ResetServer,
    Connect,
    Disconnect,
    SetUpdateDisabled(bool),
    /// Start a poll cycle now
    UpdateData,

    AddTorrentLink {
        link: String,
        options: AddTorrentOptions,
    },
    /// `metainfo` is the base64 encoded torrent file
    AddTorrentFile {
        metainfo: String,
        options: AddTorrentOptions,
    },
    StartTorrents {
        ids: Vec<i64>,
        now: bool,
    },
    StopTorrents {
        ids: Vec<i64>,
    },
    RemoveTorrents {
        ids: Vec<i64>,
        delete_files: bool,
    },
    VerifyTorrents {
        ids: Vec<i64>,
    },
    MoveTorrentsInQueue {
        ids: Vec<i64>,
        movement: QueueMovement,
    },
    ReannounceTorrents {
        ids: Vec<i64>,
    },
    SetSessionProperties {
        properties: JsonObject,
    },
    SetTorrentProperty {
        id: i64,
        property: TorrentProperty,
    },
    SetTorrentsLocation {
        ids: Vec<i64>,
        location: String,
        move_files: bool,
    },
    RenameTorrentFile {
        torrent_id: i64,
        path: String,
        new_name: String,
    },
    SetTorrentFilesEnabled {
        id: i64,
        enabled: bool,
    },
    SetTorrentPeersEnabled {
        id: i64,
        enabled: bool,
    },
    GetDownloadDirFreeSpace,
    GetFreeSpaceForPath {
        path: String,
    },
    ShutdownServer,

    GetStatus {
        responder: oneshot::Sender<Status>,
    },
    GetTorrents {
        responder: oneshot::Sender<Vec<Torrent>>,
    },
    GetTorrent {
        id: i64,
        responder: oneshot::Sender<Option<Torrent>>,
    },
    GetServerSettings {
        responder: oneshot::Sender<ServerSettings>,
    },
    GetServerStats {
        responder: oneshot::Sender<ServerStats>,
    },
    /// `None` until the locality probe of this connection finished
    IsServerLocal {
        responder: oneshot::Sender<Option<bool>>,
    },
    /// Answered once no request is in flight.
    WaitIdle {
        responder: oneshot::Sender<()>,
    },
    /// Disconnect and stop the actor.
    Shutdown {
        responder: oneshot::Sender<()>,
    },
}
