//! Local mirror of daemon entities
//!
//! Plain value types filled from `torrent-get`, `session-get` and
//! `session-stats` replies. Each `update` call reports whether anything
//! observable changed so redundant notifications can be skipped.

pub mod file;
pub mod json;
pub mod peer;
pub mod settings;
pub mod stats;
pub mod torrent;
pub mod tracker;

pub use file::TorrentFile;
pub use json::JsonObject;
pub use peer::Peer;
pub use settings::{EncryptionMode, ServerSettings};
pub use stats::{ServerStats, SessionStats};
pub use torrent::{
    LimitMode, Torrent, TorrentData, TorrentErrorKind, TorrentStatus, TorrentsUpdater,
};
pub use tracker::{Tracker, TrackerStatus};

use serde::{Deserialize, Serialize};

/// Priority shared by torrents (bandwidth) and files (download order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Maps the daemon's -1/0/1 encoding. Unknown values are `Normal`.
    pub fn from_rpc(value: i64) -> Self {
        match value {
            -1 => Priority::Low,
            1 => Priority::High,
            _ => Priority::Normal,
        }
    }

    pub fn to_rpc(self) -> i64 {
        match self {
            Priority::Low => -1,
            Priority::Normal => 0,
            Priority::High => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_mapping() {
        assert_eq!(Priority::from_rpc(-1), Priority::Low);
        assert_eq!(Priority::from_rpc(1), Priority::High);
        assert_eq!(Priority::from_rpc(7), Priority::Normal);
        assert_eq!(Priority::High.to_rpc(), 1);
    }
}
