use serde::Serialize;

use super::Priority;
use super::json::{self, JsonObject, set_changed};

/// One file of a torrent. Identity is its index in the torrent's file list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TorrentFile {
    pub id: usize,
    /// Path components relative to the torrent's download directory
    pub path: Vec<String>,
    pub size: i64,
    pub completed_size: i64,
    pub priority: Priority,
    pub wanted: bool,
}

impl TorrentFile {
    /// Builds a file from its `files` entry and its `fileStats` entry.
    pub fn new(id: usize, file: &JsonObject, stats: &JsonObject) -> Self {
        let mut created = Self {
            id,
            path: split_path(&json::string(file, "name")),
            size: json::int(file, "length"),
            completed_size: 0,
            priority: Priority::Normal,
            wanted: false,
        };
        created.update(stats);
        created
    }

    /// Refreshes the mutable attributes from a `fileStats` entry.
    pub fn update(&mut self, stats: &JsonObject) -> bool {
        let mut changed = false;
        set_changed(
            &mut self.completed_size,
            json::int(stats, "bytesCompleted"),
            &mut changed,
        );
        set_changed(&mut self.wanted, json::boolean(stats, "wanted"), &mut changed);
        set_changed(
            &mut self.priority,
            Priority::from_rpc(json::int(stats, "priority")),
            &mut changed,
        );
        changed
    }

    pub fn name(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or_default()
    }

    pub fn path_string(&self) -> String {
        self.path.join("/")
    }

    pub fn is_complete(&self) -> bool {
        self.completed_size >= self.size
    }

    pub fn progress(&self) -> f64 {
        if self.size > 0 {
            self.completed_size as f64 / self.size as f64
        } else {
            1.0
        }
    }
}

fn split_path(name: &str) -> Vec<String> {
    name.split('/')
        .filter(|part| !part.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_file_from_json() {
        let file = json!({"name": "album//cd1/track.flac", "length": 400});
        let stats = json!({"bytesCompleted": 100, "wanted": true, "priority": 1});

        let file = TorrentFile::new(
            3,
            file.as_object().unwrap(),
            stats.as_object().unwrap(),
        );

        assert_eq!(file.path, ["album", "cd1", "track.flac"]);
        assert_eq!(file.name(), "track.flac");
        assert_eq!(file.path_string(), "album/cd1/track.flac");
        assert_eq!(file.priority, Priority::High);
        assert!(file.wanted);
        assert_eq!(file.progress(), 0.25);
    }

    #[test]
    fn test_file_update_reports_changes() {
        let stats = json!({"bytesCompleted": 0, "wanted": true, "priority": 0});
        let stats = stats.as_object().unwrap();
        let mut file = TorrentFile::new(0, &JsonObject::new(), stats);

        assert!(!file.update(stats));

        let unwanted = json!({"bytesCompleted": 0, "wanted": false, "priority": 0});
        assert!(file.update(unwanted.as_object().unwrap()));
        assert!(!file.wanted);
    }
}
