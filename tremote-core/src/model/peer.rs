use serde::Serialize;

use super::json::{self, JsonObject, set_changed, set_changed_float};

/// A peer connected to a torrent. Identity is its address.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Peer {
    pub address: String,
    pub client: String,
    /// Bytes per second we receive from the peer
    pub download_speed: i64,
    /// Bytes per second we send to the peer
    pub upload_speed: i64,
    pub progress: f64,
    pub flags: String,
}

impl Peer {
    pub fn new(address: String, peer: &JsonObject) -> Self {
        let mut created = Self {
            address,
            client: String::new(),
            download_speed: 0,
            upload_speed: 0,
            progress: 0.0,
            flags: String::new(),
        };
        created.update(peer);
        created
    }

    pub fn update(&mut self, peer: &JsonObject) -> bool {
        let mut changed = false;
        set_changed(&mut self.client, json::string(peer, "clientName"), &mut changed);
        set_changed(
            &mut self.download_speed,
            json::int(peer, "rateToClient"),
            &mut changed,
        );
        set_changed(
            &mut self.upload_speed,
            json::int(peer, "rateToPeer"),
            &mut changed,
        );
        set_changed_float(&mut self.progress, json::float(peer, "progress"), &mut changed);
        set_changed(&mut self.flags, json::string(peer, "flagStr"), &mut changed);
        changed
    }
}
