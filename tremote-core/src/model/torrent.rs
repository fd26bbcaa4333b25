//! Torrents and their child collections
//!
//! A `Torrent` owns its files, peers and trackers. Trackers arrive with
//! every `torrent-get` poll; files and peers are fetched per torrent, and
//! only while their fetching is enabled.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::file::TorrentFile;
use super::json::{self, JsonObject, fuzzy_eq, set_changed, set_changed_float};
use super::peer::Peer;
use super::tracker::Tracker;
use super::Priority;
use crate::reconcile::{ListDelta, ListUpdater};

/// Fields requested for every torrent on each poll cycle.
pub const TORRENT_FIELDS: &[&str] = &[
    "activityDate",
    "addedDate",
    "bandwidthPriority",
    "comment",
    "creator",
    "dateCreated",
    "doneDate",
    "downloadDir",
    "downloadedEver",
    "downloadLimit",
    "downloadLimited",
    "error",
    "errorString",
    "eta",
    "hashString",
    "haveValid",
    "honorsSessionLimits",
    "id",
    "leftUntilDone",
    "magnetLink",
    "metadataPercentComplete",
    "name",
    "peer-limit",
    "peersConnected",
    "peersGettingFromUs",
    "peersSendingToUs",
    "percentDone",
    "queuePosition",
    "rateDownload",
    "rateUpload",
    "recheckProgress",
    "seedIdleLimit",
    "seedIdleMode",
    "seedRatioLimit",
    "seedRatioMode",
    "sizeWhenDone",
    "status",
    "totalSize",
    "trackerStats",
    "uploadedEver",
    "uploadLimit",
    "uploadLimited",
    "uploadRatio",
    "webseedsSendingToUs",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum TorrentStatus {
    #[default]
    Paused,
    QueuedForChecking,
    Checking,
    QueuedForDownloading,
    Downloading,
    QueuedForSeeding,
    Seeding,
}

impl TorrentStatus {
    pub fn from_rpc(value: i64) -> Self {
        match value {
            1 => TorrentStatus::QueuedForChecking,
            2 => TorrentStatus::Checking,
            3 => TorrentStatus::QueuedForDownloading,
            4 => TorrentStatus::Downloading,
            5 => TorrentStatus::QueuedForSeeding,
            6 => TorrentStatus::Seeding,
            _ => TorrentStatus::Paused,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum TorrentErrorKind {
    #[default]
    None,
    TrackerWarning,
    TrackerError,
    LocalError,
}

impl TorrentErrorKind {
    pub fn from_rpc(value: i64) -> Self {
        match value {
            1 => TorrentErrorKind::TrackerWarning,
            2 => TorrentErrorKind::TrackerError,
            3 => TorrentErrorKind::LocalError,
            _ => TorrentErrorKind::None,
        }
    }
}

/// Mode of a per-torrent ratio or idle seeding limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum LimitMode {
    /// Follow the session-wide limit
    #[default]
    Global,
    Single,
    Unlimited,
}

impl LimitMode {
    pub fn from_rpc(value: i64) -> Self {
        match value {
            1 => LimitMode::Single,
            2 => LimitMode::Unlimited,
            _ => LimitMode::Global,
        }
    }

    pub fn to_rpc(self) -> i64 {
        match self {
            LimitMode::Global => 0,
            LimitMode::Single => 1,
            LimitMode::Unlimited => 2,
        }
    }
}

/// Attributes of a torrent refreshed on every poll.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TorrentData {
    pub id: i64,
    pub hash_string: String,
    pub name: String,
    pub magnet_link: String,
    pub status: TorrentStatus,
    pub error: TorrentErrorKind,
    pub error_string: String,
    pub queue_position: i64,

    pub total_size: i64,
    pub completed_size: i64,
    pub left_until_done: i64,
    pub size_when_done: i64,
    pub percent_done: f64,
    pub recheck_progress: f64,
    /// Seconds, negative when unknown
    pub eta: i64,
    pub metadata_complete: bool,

    pub download_speed: i64,
    pub upload_speed: i64,
    pub download_speed_limited: bool,
    pub download_speed_limit: i64,
    pub upload_speed_limited: bool,
    pub upload_speed_limit: i64,
    pub total_downloaded: i64,
    pub total_uploaded: i64,
    pub ratio: f64,
    pub ratio_limit_mode: LimitMode,
    pub ratio_limit: f64,

    pub seeders: i64,
    pub leechers: i64,
    pub peers_connected: i64,
    pub active_web_seeders: i64,
    pub peers_limit: i64,

    pub added_date: Option<DateTime<Utc>>,
    pub activity_date: Option<DateTime<Utc>>,
    pub done_date: Option<DateTime<Utc>>,
    pub creation_date: Option<DateTime<Utc>>,

    pub idle_seeding_limit_mode: LimitMode,
    /// Minutes
    pub idle_seeding_limit: i64,
    pub download_directory: String,
    pub comment: String,
    pub creator: String,
    pub bandwidth_priority: Priority,
    pub honor_session_limits: bool,
    pub single_file: bool,
    pub trackers: Vec<Tracker>,
}

impl TorrentData {
    /// Applies one `torrent-get` entry. Returns true if anything changed.
    pub fn update(&mut self, torrent: &JsonObject) -> bool {
        let mut changed = false;
        let int = |key| json::int(torrent, key);
        let string = |key| json::string(torrent, key);

        set_changed(&mut self.id, int("id"), &mut changed);
        set_changed(&mut self.hash_string, string("hashString"), &mut changed);
        set_changed(&mut self.name, string("name"), &mut changed);
        set_changed(&mut self.magnet_link, string("magnetLink"), &mut changed);
        set_changed(
            &mut self.status,
            TorrentStatus::from_rpc(int("status")),
            &mut changed,
        );
        set_changed(
            &mut self.error,
            TorrentErrorKind::from_rpc(int("error")),
            &mut changed,
        );
        set_changed(&mut self.error_string, string("errorString"), &mut changed);
        set_changed(&mut self.queue_position, int("queuePosition"), &mut changed);

        set_changed(&mut self.total_size, int("totalSize"), &mut changed);
        set_changed(&mut self.completed_size, int("haveValid"), &mut changed);
        set_changed(&mut self.left_until_done, int("leftUntilDone"), &mut changed);
        set_changed(&mut self.size_when_done, int("sizeWhenDone"), &mut changed);
        set_changed_float(
            &mut self.percent_done,
            json::float(torrent, "percentDone"),
            &mut changed,
        );
        set_changed_float(
            &mut self.recheck_progress,
            json::float(torrent, "recheckProgress"),
            &mut changed,
        );
        set_changed(&mut self.eta, int("eta"), &mut changed);
        set_changed(
            &mut self.metadata_complete,
            fuzzy_eq(json::float(torrent, "metadataPercentComplete"), 1.0),
            &mut changed,
        );

        set_changed(&mut self.download_speed, int("rateDownload"), &mut changed);
        set_changed(&mut self.upload_speed, int("rateUpload"), &mut changed);
        set_changed(
            &mut self.download_speed_limited,
            json::boolean(torrent, "downloadLimited"),
            &mut changed,
        );
        set_changed(&mut self.download_speed_limit, int("downloadLimit"), &mut changed);
        set_changed(
            &mut self.upload_speed_limited,
            json::boolean(torrent, "uploadLimited"),
            &mut changed,
        );
        set_changed(&mut self.upload_speed_limit, int("uploadLimit"), &mut changed);
        set_changed(&mut self.total_downloaded, int("downloadedEver"), &mut changed);
        set_changed(&mut self.total_uploaded, int("uploadedEver"), &mut changed);
        set_changed_float(
            &mut self.ratio,
            json::float(torrent, "uploadRatio"),
            &mut changed,
        );
        set_changed(
            &mut self.ratio_limit_mode,
            LimitMode::from_rpc(int("seedRatioMode")),
            &mut changed,
        );
        set_changed_float(
            &mut self.ratio_limit,
            json::float(torrent, "seedRatioLimit"),
            &mut changed,
        );

        set_changed(&mut self.seeders, int("peersSendingToUs"), &mut changed);
        set_changed(&mut self.leechers, int("peersGettingFromUs"), &mut changed);
        set_changed(&mut self.peers_connected, int("peersConnected"), &mut changed);
        set_changed(
            &mut self.active_web_seeders,
            int("webseedsSendingToUs"),
            &mut changed,
        );
        set_changed(&mut self.peers_limit, int("peer-limit"), &mut changed);

        set_changed(
            &mut self.added_date,
            json::date(torrent, "addedDate"),
            &mut changed,
        );
        set_changed(
            &mut self.activity_date,
            json::date(torrent, "activityDate"),
            &mut changed,
        );
        set_changed(
            &mut self.done_date,
            json::date(torrent, "doneDate"),
            &mut changed,
        );
        set_changed(
            &mut self.creation_date,
            json::date(torrent, "dateCreated"),
            &mut changed,
        );

        set_changed(
            &mut self.idle_seeding_limit_mode,
            LimitMode::from_rpc(int("seedIdleMode")),
            &mut changed,
        );
        set_changed(&mut self.idle_seeding_limit, int("seedIdleLimit"), &mut changed);
        set_changed(&mut self.download_directory, string("downloadDir"), &mut changed);
        set_changed(&mut self.comment, string("comment"), &mut changed);
        set_changed(&mut self.creator, string("creator"), &mut changed);
        set_changed(
            &mut self.bandwidth_priority,
            Priority::from_rpc(int("bandwidthPriority")),
            &mut changed,
        );
        set_changed(
            &mut self.honor_session_limits,
            json::boolean(torrent, "honorsSessionLimits"),
            &mut changed,
        );

        let trackers: Vec<(i64, &JsonObject)> = json::array(torrent, "trackerStats")
            .iter()
            .filter_map(Value::as_object)
            .map(|tracker| (json::int(tracker, "id"), tracker))
            .collect();
        if !TrackersUpdater.update(&mut self.trackers, trackers).is_empty() {
            changed = true;
        }

        changed
    }

    pub fn is_finished(&self) -> bool {
        self.left_until_done == 0
    }

    pub fn is_downloading_stalled(&self) -> bool {
        self.status == TorrentStatus::Downloading
            && self.seeders == 0
            && self.active_web_seeders == 0
    }

    pub fn is_seeding_stalled(&self) -> bool {
        self.status == TorrentStatus::Seeding && self.leechers == 0
    }

    pub fn is_stalled(&self) -> bool {
        self.is_downloading_stalled() || self.is_seeding_stalled()
    }
}

struct TrackersUpdater;

impl<'a> ListUpdater<Tracker, (i64, &'a JsonObject)> for TrackersUpdater {
    fn find_new_item(&self, new_items: &[(i64, &'a JsonObject)], item: &Tracker) -> Option<usize> {
        new_items.iter().position(|(id, _)| *id == item.id)
    }

    fn update_item(&mut self, item: &mut Tracker, (_, tracker): (i64, &'a JsonObject)) -> bool {
        item.update(tracker)
    }

    fn create_item(&mut self, (id, tracker): (i64, &'a JsonObject)) -> Tracker {
        Tracker::new(id, tracker)
    }
}

struct FileEntry<'a> {
    index: usize,
    file: Option<&'a JsonObject>,
    stats: &'a JsonObject,
}

struct FilesUpdater;

impl<'a> ListUpdater<TorrentFile, FileEntry<'a>> for FilesUpdater {
    fn find_new_item(&self, new_items: &[FileEntry<'a>], item: &TorrentFile) -> Option<usize> {
        new_items.iter().position(|entry| entry.index == item.id)
    }

    fn update_item(&mut self, item: &mut TorrentFile, entry: FileEntry<'a>) -> bool {
        item.update(entry.stats)
    }

    fn create_item(&mut self, entry: FileEntry<'a>) -> TorrentFile {
        let empty = JsonObject::new();
        TorrentFile::new(entry.index, entry.file.unwrap_or(&empty), entry.stats)
    }
}

struct PeersUpdater;

impl<'a> ListUpdater<Peer, (String, &'a JsonObject)> for PeersUpdater {
    fn find_new_item(&self, new_items: &[(String, &'a JsonObject)], item: &Peer) -> Option<usize> {
        new_items
            .iter()
            .position(|(address, _)| *address == item.address)
    }

    fn update_item(&mut self, item: &mut Peer, (_, peer): (String, &'a JsonObject)) -> bool {
        item.update(peer)
    }

    fn create_item(&mut self, (address, peer): (String, &'a JsonObject)) -> Peer {
        Peer::new(address, peer)
    }
}

/// A torrent together with the child lists fetched on demand.
#[derive(Debug, Clone, Serialize)]
pub struct Torrent {
    data: TorrentData,
    files: Vec<TorrentFile>,
    files_enabled: bool,
    files_updated: bool,
    peers: Vec<Peer>,
    peers_enabled: bool,
    peers_updated: bool,
}

impl Torrent {
    pub fn new(torrent: &JsonObject) -> Self {
        let mut created = Self {
            data: TorrentData::default(),
            files: Vec::new(),
            files_enabled: false,
            files_updated: false,
            peers: Vec::new(),
            peers_enabled: false,
            peers_updated: false,
        };
        created.update(torrent);
        created
    }

    pub fn id(&self) -> i64 {
        self.data.id
    }

    pub fn data(&self) -> &TorrentData {
        &self.data
    }

    pub fn files(&self) -> &[TorrentFile] {
        &self.files
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn files_enabled(&self) -> bool {
        self.files_enabled
    }

    pub fn peers_enabled(&self) -> bool {
        self.peers_enabled
    }

    pub fn is_finished(&self) -> bool {
        self.data.is_finished()
    }

    /// Applies a poll cycle entry and marks the child lists as stale.
    pub fn update(&mut self, torrent: &JsonObject) -> bool {
        self.files_updated = false;
        self.peers_updated = false;
        self.data.update(torrent)
    }

    /// True once every enabled child list was fetched in the current cycle.
    pub fn is_updated(&self) -> bool {
        (!self.files_enabled || self.files_updated) && (!self.peers_enabled || self.peers_updated)
    }

    /// Merges the `files` and `fileStats` arrays of a per-torrent reply.
    pub fn update_files(&mut self, torrent: &JsonObject) -> ListDelta {
        self.files_updated = true;

        let files = json::array(torrent, "files");
        let entries: Vec<FileEntry<'_>> = json::array(torrent, "fileStats")
            .iter()
            .enumerate()
            .filter_map(|(index, stats)| {
                Some(FileEntry {
                    index,
                    file: files.get(index).and_then(Value::as_object),
                    stats: stats.as_object()?,
                })
            })
            .collect();
        FilesUpdater.update(&mut self.files, entries)
    }

    /// Merges the `peers` array of a per-torrent reply.
    pub fn update_peers(&mut self, torrent: &JsonObject) -> ListDelta {
        self.peers_updated = true;

        let peers: Vec<(String, &JsonObject)> = json::array(torrent, "peers")
            .iter()
            .filter_map(Value::as_object)
            .map(|peer| (json::string(peer, "address"), peer))
            .collect();
        PeersUpdater.update(&mut self.peers, peers)
    }

    /// Marks the file list as fetched without touching it.
    pub(crate) fn mark_files_updated(&mut self) {
        self.files_updated = true;
    }

    pub(crate) fn mark_peers_updated(&mut self) {
        self.peers_updated = true;
    }

    /// Enables or disables file fetching. Disabling drops the file list
    /// and returns the corresponding removal.
    pub fn set_files_enabled(&mut self, enabled: bool) -> ListDelta {
        self.files_enabled = enabled;
        if enabled {
            return ListDelta::default();
        }
        self.files_updated = false;
        let delta = ListDelta::all_removed(self.files.len());
        self.files.clear();
        delta
    }

    pub fn set_peers_enabled(&mut self, enabled: bool) -> ListDelta {
        self.peers_enabled = enabled;
        if enabled {
            return ListDelta::default();
        }
        self.peers_updated = false;
        let delta = ListDelta::all_removed(self.peers.len());
        self.peers.clear();
        delta
    }

    /// Applies a `priorities` reply: a torrent with one priority entry has one file.
    pub fn check_single_file(&mut self, torrent: &JsonObject) -> bool {
        let single_file = json::array(torrent, "priorities").len() == 1;
        let mut changed = false;
        set_changed(&mut self.data.single_file, single_file, &mut changed);
        changed
    }
}

/// Reconciles the torrent list and records the transitions the
/// orchestrator reacts to.
#[derive(Debug, Default)]
pub struct TorrentsUpdater {
    /// Torrents that finished downloading during this update
    pub finished: Vec<i64>,
    /// Torrents that need a single-file check
    pub metadata_completed: Vec<i64>,
    pub added: Vec<i64>,
}

impl ListUpdater<Torrent, (i64, JsonObject)> for TorrentsUpdater {
    fn find_new_item(&self, new_items: &[(i64, JsonObject)], item: &Torrent) -> Option<usize> {
        new_items.iter().position(|(id, _)| *id == item.id())
    }

    fn update_item(&mut self, item: &mut Torrent, (_, torrent): (i64, JsonObject)) -> bool {
        let was_finished = item.is_finished();
        let had_metadata = item.data.metadata_complete;

        let changed = item.update(&torrent);
        if changed {
            if !was_finished && item.is_finished() {
                self.finished.push(item.id());
            }
            if !had_metadata && item.data.metadata_complete {
                self.metadata_completed.push(item.id());
            }
        }
        changed
    }

    fn create_item(&mut self, (_, torrent): (i64, JsonObject)) -> Torrent {
        Torrent::new(&torrent)
    }

    fn on_added_items(&mut self, items: &[Torrent]) {
        for torrent in items {
            self.added.push(torrent.id());
            if torrent.data.metadata_complete {
                self.metadata_completed.push(torrent.id());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn object(value: Value) -> JsonObject {
        value.as_object().cloned().unwrap()
    }

    fn snapshot(entries: &[Value]) -> Vec<(i64, JsonObject)> {
        entries
            .iter()
            .map(|entry| {
                let entry = object(entry.clone());
                (json::int(&entry, "id"), entry)
            })
            .collect()
    }

    #[test]
    fn test_torrent_fields_are_mapped() {
        let torrent = Torrent::new(&object(json!({
            "id": 7,
            "name": "debian.iso",
            "status": 4,
            "error": 9,
            "percentDone": 0.5,
            "leftUntilDone": 100,
            "metadataPercentComplete": 1,
            "seedRatioMode": 2,
            "bandwidthPriority": -1,
            "addedDate": 0,
            "doneDate": 1_600_000_000,
            "peersSendingToUs": 0,
            "webseedsSendingToUs": 1,
        })));

        let data = torrent.data();
        assert_eq!(torrent.id(), 7);
        assert_eq!(data.status, TorrentStatus::Downloading);
        assert_eq!(data.error, TorrentErrorKind::None);
        assert_eq!(data.ratio_limit_mode, LimitMode::Unlimited);
        assert_eq!(data.bandwidth_priority, Priority::Low);
        assert!(data.metadata_complete);
        assert_eq!(data.added_date, None);
        assert!(data.done_date.is_some());
        assert!(!torrent.is_finished());
        assert!(!data.is_stalled(), "an active web seed keeps a download alive");
    }

    #[test]
    fn test_stalled_predicate() {
        let mut data = TorrentData {
            status: TorrentStatus::Downloading,
            ..Default::default()
        };
        assert!(data.is_stalled());

        data.status = TorrentStatus::Seeding;
        data.seeders = 0;
        data.leechers = 2;
        assert!(!data.is_stalled());

        data.leechers = 0;
        assert!(data.is_seeding_stalled());

        data.status = TorrentStatus::Paused;
        assert!(!data.is_stalled());
    }

    #[test]
    fn test_identical_entry_reports_no_change() {
        let entry = object(json!({"id": 1, "name": "a", "ratio": 0.3, "trackerStats": [
            {"id": 0, "announce": "http://t.example.org/announce"}
        ]}));
        let mut torrent = Torrent::new(&entry);

        assert_eq!(torrent.data().trackers.len(), 1);
        assert!(!torrent.update(&entry));
    }

    #[test]
    fn test_trackers_are_reconciled_by_id() {
        let mut torrent = Torrent::new(&object(json!({"id": 1, "trackerStats": [
            {"id": 0, "announce": "http://a.example.org/announce"},
            {"id": 1, "announce": "http://b.example.org/announce"},
        ]})));

        let changed = torrent.update(&object(json!({"id": 1, "trackerStats": [
            {"id": 1, "announce": "http://b.example.org/announce"},
            {"id": 2, "announce": "http://c.example.org/announce"},
        ]})));

        assert!(changed);
        let ids: Vec<i64> = torrent.data().trackers.iter().map(|t| t.id).collect();
        assert_eq!(ids, [1, 2]);
    }

    #[test]
    fn test_updater_records_transitions() {
        let mut torrents = Vec::new();
        let mut updater = TorrentsUpdater::default();
        updater.update(
            &mut torrents,
            snapshot(&[
                json!({"id": 1, "leftUntilDone": 10, "metadataPercentComplete": 0.5}),
                json!({"id": 2, "leftUntilDone": 10, "metadataPercentComplete": 1.0}),
            ]),
        );

        assert_eq!(updater.added, [1, 2]);
        assert_eq!(updater.metadata_completed, [2]);
        assert!(updater.finished.is_empty());

        let mut updater = TorrentsUpdater::default();
        let delta = updater.update(
            &mut torrents,
            snapshot(&[
                json!({"id": 1, "leftUntilDone": 0, "metadataPercentComplete": 1.0}),
                json!({"id": 2, "leftUntilDone": 10, "metadataPercentComplete": 1.0}),
            ]),
        );

        assert_eq!(updater.finished, [1]);
        assert_eq!(updater.metadata_completed, [1]);
        assert!(updater.added.is_empty());
        assert_eq!(delta.changed, vec![0..1]);
    }

    #[test]
    fn test_files_update_and_child_completion() {
        let mut torrent = Torrent::new(&object(json!({"id": 3})));
        assert!(torrent.is_updated());

        torrent.set_files_enabled(true);
        assert!(!torrent.is_updated());

        let delta = torrent.update_files(&object(json!({
            "id": 3,
            "files": [{"name": "dir/a", "length": 10}, {"name": "dir/b", "length": 20}],
            "fileStats": [
                {"bytesCompleted": 10, "wanted": true, "priority": 0},
                {"bytesCompleted": 0, "wanted": false, "priority": 1},
            ],
        })));

        assert_eq!(delta.added, 2);
        assert!(torrent.is_updated());
        assert_eq!(torrent.files()[1].name(), "b");

        torrent.update(&object(json!({"id": 3})));
        assert!(!torrent.is_updated(), "a new poll makes the file list stale");

        let delta = torrent.set_files_enabled(false);
        assert_eq!(delta, ListDelta::all_removed(2));
        assert!(torrent.files().is_empty());
        assert!(torrent.is_updated());
    }

    #[test]
    fn test_peers_are_keyed_by_address() {
        let mut torrent = Torrent::new(&object(json!({"id": 3})));
        torrent.set_peers_enabled(true);
        torrent.update_peers(&object(json!({"peers": [
            {"address": "10.0.0.1", "clientName": "qB", "progress": 0.1},
            {"address": "10.0.0.2", "clientName": "TR", "progress": 0.2},
        ]})));

        let delta = torrent.update_peers(&object(json!({"peers": [
            {"address": "10.0.0.2", "clientName": "TR", "progress": 0.3},
        ]})));

        assert_eq!(delta.removed, vec![0..1]);
        assert_eq!(delta.changed, vec![0..1]);
        assert_eq!(torrent.peers()[0].address, "10.0.0.2");
    }

    #[test]
    fn test_single_file_check() {
        let mut torrent = Torrent::new(&object(json!({"id": 3})));

        assert!(torrent.check_single_file(&object(json!({"id": 3, "priorities": [0]}))));
        assert!(torrent.data().single_file);
        assert!(!torrent.check_single_file(&object(json!({"id": 3, "priorities": [0]}))));
    }
}
