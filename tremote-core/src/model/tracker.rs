use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use url::Url;

use super::json::{self, JsonObject, set_changed};

/// Announce state of a tracker as seen from the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum TrackerStatus {
    #[default]
    Inactive,
    /// Waiting for the next announce
    Waiting,
    Queued,
    /// Announcing right now
    Active,
    /// The last announce or scrape failed
    Error,
}

impl TrackerStatus {
    fn from_rpc(announce_state: i64) -> Self {
        match announce_state {
            1 => TrackerStatus::Waiting,
            2 => TrackerStatus::Queued,
            3 => TrackerStatus::Active,
            _ => TrackerStatus::Inactive,
        }
    }
}

/// One entry of a torrent's `trackerStats`. Identity is its id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tracker {
    pub id: i64,
    pub announce: String,
    /// Host of the announce URL reduced to its registrable part
    pub site: String,
    pub status: TrackerStatus,
    pub error_message: String,
    pub peers: i64,
    pub seeders: i64,
    pub leechers: i64,
    pub next_update_time: Option<DateTime<Utc>>,
}

impl Tracker {
    pub fn new(id: i64, tracker: &JsonObject) -> Self {
        let mut created = Self {
            id,
            announce: String::new(),
            site: String::new(),
            status: TrackerStatus::Inactive,
            error_message: String::new(),
            peers: 0,
            seeders: 0,
            leechers: 0,
            next_update_time: None,
        };
        created.update(tracker);
        created
    }

    pub fn update(&mut self, tracker: &JsonObject) -> bool {
        let mut changed = false;

        let announce = json::string(tracker, "announce");
        if announce != self.announce {
            self.site = site_of(&announce);
            self.announce = announce;
            changed = true;
        }

        let scrape_failed = json::boolean(tracker, "hasScraped")
            && !json::boolean(tracker, "lastScrapeSucceeded");
        let announce_failed = json::boolean(tracker, "hasAnnounced")
            && !json::boolean(tracker, "lastAnnounceSucceeded");

        let (status, error_message) = if announce_failed {
            (
                TrackerStatus::Error,
                json::string(tracker, "lastAnnounceResult"),
            )
        } else if scrape_failed {
            (TrackerStatus::Error, json::string(tracker, "lastScrapeResult"))
        } else {
            (
                TrackerStatus::from_rpc(json::int(tracker, "announceState")),
                String::new(),
            )
        };
        set_changed(&mut self.status, status, &mut changed);
        set_changed(&mut self.error_message, error_message, &mut changed);

        set_changed(
            &mut self.peers,
            json::int(tracker, "lastAnnouncePeerCount"),
            &mut changed,
        );
        set_changed(&mut self.seeders, json::int(tracker, "seederCount"), &mut changed);
        set_changed(&mut self.leechers, json::int(tracker, "leecherCount"), &mut changed);
        set_changed(
            &mut self.next_update_time,
            json::date(tracker, "nextAnnounceTime"),
            &mut changed,
        );

        changed
    }
}

fn site_of(announce: &str) -> String {
    let Some(host) = Url::parse(announce)
        .ok()
        .and_then(|url| url.host_str().map(str::to_owned))
    else {
        return String::new();
    };

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if bare.parse::<IpAddr>().is_ok() {
        return host;
    }

    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() > 2 {
        labels[labels.len() - 2..].join(".")
    } else {
        host
    }
}
