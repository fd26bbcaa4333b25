//! Notifications emitted by the RPC engine.

use crate::engine::Status;
use crate::model::{ServerSettings, ServerStats};
use crate::reconcile::ListDelta;

#[derive(Debug, Clone, PartialEq)]
pub enum RpcEvent {
    StatusChanged(Status),
    /// Structural changes of the torrent list
    TorrentsUpdated(ListDelta),
    /// A torrent appeared while connected
    TorrentAdded { id: i64 },
    TorrentFinished { id: i64 },
    TorrentFilesUpdated { torrent_id: i64, delta: ListDelta },
    TorrentPeersUpdated { torrent_id: i64, delta: ListDelta },
    TorrentFileRenamed {
        torrent_id: i64,
        path: String,
        new_name: String,
    },
    TorrentAddDuplicate,
    TorrentAddError { message: String },
    DownloadDirFreeSpace(i64),
    FreeSpaceForPath {
        path: String,
        success: bool,
        bytes: i64,
    },
    ServerSettingsChanged(Box<ServerSettings>),
    ServerStatsUpdated(ServerStats),
}
