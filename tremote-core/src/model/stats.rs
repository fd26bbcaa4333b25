use serde::Serialize;

use super::json::{self, JsonObject};

/// Transfer totals for one period (current session or all time).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub downloaded: i64,
    pub uploaded: i64,
    pub seconds_active: i64,
    pub session_count: i64,
}

impl SessionStats {
    fn from_json(stats: Option<&JsonObject>) -> Self {
        let Some(stats) = stats else {
            return Self::default();
        };
        Self {
            downloaded: json::int(stats, "downloadedBytes"),
            uploaded: json::int(stats, "uploadedBytes"),
            seconds_active: json::int(stats, "secondsActive"),
            session_count: json::int(stats, "sessionCount"),
        }
    }

    pub fn ratio(&self) -> Option<f64> {
        (self.downloaded > 0).then(|| self.uploaded as f64 / self.downloaded as f64)
    }
}

/// Reply of `session-stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    pub download_speed: i64,
    pub upload_speed: i64,
    pub current_session: SessionStats,
    pub total: SessionStats,
}

impl ServerStats {
    pub fn update(&mut self, stats: &JsonObject) {
        *self = Self {
            download_speed: json::int(stats, "downloadSpeed"),
            upload_speed: json::int(stats, "uploadSpeed"),
            current_session: SessionStats::from_json(json::object(stats, "current-stats")),
            total: SessionStats::from_json(json::object(stats, "cumulative-stats")),
        };
    }
}
