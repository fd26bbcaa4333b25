//! Daemon session settings as reported by `session-get`

use serde::Serialize;

use super::json::{self, JsonObject, set_changed, set_changed_float};

/// Lowest RPC version this client speaks.
pub const MINIMUM_RPC_VERSION: i64 = 14;

/// Version that introduced `torrent-rename-path` and `free-space`.
const RENAME_AND_FREE_SPACE_RPC_VERSION: i64 = 15;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum EncryptionMode {
    AllowedEncryption,
    #[default]
    PreferredEncryption,
    RequiredEncryption,
}

impl EncryptionMode {
    fn from_rpc(value: &str) -> Self {
        match value {
            "tolerated" => EncryptionMode::AllowedEncryption,
            "required" => EncryptionMode::RequiredEncryption,
            _ => EncryptionMode::PreferredEncryption,
        }
    }

    pub fn to_rpc(self) -> &'static str {
        match self {
            EncryptionMode::AllowedEncryption => "tolerated",
            EncryptionMode::PreferredEncryption => "preferred",
            EncryptionMode::RequiredEncryption => "required",
        }
    }
}

/// Speed limits are in kB/s or KiB/s depending on `units_speed_bytes`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerSettings {
    pub rpc_version: i64,
    pub minimum_rpc_version: i64,
    pub units_speed_bytes: i64,

    pub download_directory: String,
    pub trash_torrent_files: bool,
    pub start_added_torrents: bool,
    pub rename_incomplete_files: bool,
    pub incomplete_directory_enabled: bool,
    pub incomplete_directory: String,

    pub ratio_limited: bool,
    pub ratio_limit: f64,
    pub idle_seeding_limited: bool,
    pub idle_seeding_limit: i64,

    pub download_queue_enabled: bool,
    pub download_queue_size: i64,
    pub seed_queue_enabled: bool,
    pub seed_queue_size: i64,
    pub idle_queue_limited: bool,
    pub idle_queue_limit: i64,

    pub download_speed_limited: bool,
    pub download_speed_limit: i64,
    pub upload_speed_limited: bool,
    pub upload_speed_limit: i64,
    pub alternative_speed_limits_enabled: bool,
    pub alternative_download_speed_limit: i64,
    pub alternative_upload_speed_limit: i64,
    pub alternative_speed_limits_scheduled: bool,
    /// Minutes since midnight
    pub alternative_speed_limits_begin_time: i64,
    pub alternative_speed_limits_end_time: i64,
    /// Bit mask, Sunday is bit 0
    pub alternative_speed_limits_days: i64,

    pub peer_port: i64,
    pub random_port_enabled: bool,
    pub port_forwarding_enabled: bool,
    pub encryption_mode: EncryptionMode,
    pub utp_enabled: bool,
    pub pex_enabled: bool,
    pub dht_enabled: bool,
    pub lpd_enabled: bool,
    pub maximum_peers_per_torrent: i64,
    pub maximum_peers_globally: i64,
}

impl ServerSettings {
    /// Applies a `session-get` reply. Returns true if anything changed.
    pub fn update(&mut self, settings: &JsonObject) -> bool {
        let mut changed = false;
        let int = |key| json::int(settings, key);
        let boolean = |key| json::boolean(settings, key);

        set_changed(&mut self.rpc_version, int("rpc-version"), &mut changed);
        set_changed(
            &mut self.minimum_rpc_version,
            int("rpc-version-minimum"),
            &mut changed,
        );
        if let Some(units) = json::object(settings, "units") {
            set_changed(
                &mut self.units_speed_bytes,
                json::int(units, "speed-bytes"),
                &mut changed,
            );
        }

        set_changed(
            &mut self.download_directory,
            json::string(settings, "download-dir"),
            &mut changed,
        );
        set_changed(
            &mut self.trash_torrent_files,
            boolean("trash-original-torrent-files"),
            &mut changed,
        );
        set_changed(
            &mut self.start_added_torrents,
            boolean("start-added-torrents"),
            &mut changed,
        );
        set_changed(
            &mut self.rename_incomplete_files,
            boolean("rename-partial-files"),
            &mut changed,
        );
        set_changed(
            &mut self.incomplete_directory_enabled,
            boolean("incomplete-dir-enabled"),
            &mut changed,
        );
        set_changed(
            &mut self.incomplete_directory,
            json::string(settings, "incomplete-dir"),
            &mut changed,
        );

        set_changed(&mut self.ratio_limited, boolean("seedRatioLimited"), &mut changed);
        set_changed_float(
            &mut self.ratio_limit,
            json::float(settings, "seedRatioLimit"),
            &mut changed,
        );
        set_changed(
            &mut self.idle_seeding_limited,
            boolean("idle-seeding-limit-enabled"),
            &mut changed,
        );
        set_changed(
            &mut self.idle_seeding_limit,
            int("idle-seeding-limit"),
            &mut changed,
        );

        set_changed(
            &mut self.download_queue_enabled,
            boolean("download-queue-enabled"),
            &mut changed,
        );
        set_changed(
            &mut self.download_queue_size,
            int("download-queue-size"),
            &mut changed,
        );
        set_changed(
            &mut self.seed_queue_enabled,
            boolean("seed-queue-enabled"),
            &mut changed,
        );
        set_changed(&mut self.seed_queue_size, int("seed-queue-size"), &mut changed);
        set_changed(
            &mut self.idle_queue_limited,
            boolean("queue-stalled-enabled"),
            &mut changed,
        );
        set_changed(
            &mut self.idle_queue_limit,
            int("queue-stalled-minutes"),
            &mut changed,
        );

        set_changed(
            &mut self.download_speed_limited,
            boolean("speed-limit-down-enabled"),
            &mut changed,
        );
        set_changed(
            &mut self.download_speed_limit,
            int("speed-limit-down"),
            &mut changed,
        );
        set_changed(
            &mut self.upload_speed_limited,
            boolean("speed-limit-up-enabled"),
            &mut changed,
        );
        set_changed(
            &mut self.upload_speed_limit,
            int("speed-limit-up"),
            &mut changed,
        );
        set_changed(
            &mut self.alternative_speed_limits_enabled,
            boolean("alt-speed-enabled"),
            &mut changed,
        );
        set_changed(
            &mut self.alternative_download_speed_limit,
            int("alt-speed-down"),
            &mut changed,
        );
        set_changed(
            &mut self.alternative_upload_speed_limit,
            int("alt-speed-up"),
            &mut changed,
        );
        set_changed(
            &mut self.alternative_speed_limits_scheduled,
            boolean("alt-speed-time-enabled"),
            &mut changed,
        );
        set_changed(
            &mut self.alternative_speed_limits_begin_time,
            int("alt-speed-time-begin"),
            &mut changed,
        );
        set_changed(
            &mut self.alternative_speed_limits_end_time,
            int("alt-speed-time-end"),
            &mut changed,
        );
        set_changed(
            &mut self.alternative_speed_limits_days,
            int("alt-speed-time-day"),
            &mut changed,
        );

        set_changed(&mut self.peer_port, int("peer-port"), &mut changed);
        set_changed(
            &mut self.random_port_enabled,
            boolean("peer-port-random-on-start"),
            &mut changed,
        );
        set_changed(
            &mut self.port_forwarding_enabled,
            boolean("port-forwarding-enabled"),
            &mut changed,
        );
        set_changed(
            &mut self.encryption_mode,
            EncryptionMode::from_rpc(&json::string(settings, "encryption")),
            &mut changed,
        );
        set_changed(&mut self.utp_enabled, boolean("utp-enabled"), &mut changed);
        set_changed(&mut self.pex_enabled, boolean("pex-enabled"), &mut changed);
        set_changed(&mut self.dht_enabled, boolean("dht-enabled"), &mut changed);
        set_changed(&mut self.lpd_enabled, boolean("lpd-enabled"), &mut changed);
        set_changed(
            &mut self.maximum_peers_per_torrent,
            int("peer-limit-per-torrent"),
            &mut changed,
        );
        set_changed(
            &mut self.maximum_peers_globally,
            int("peer-limit-global"),
            &mut changed,
        );

        changed
    }

    /// Whether speed values use 1000 (kB) rather than 1024 (KiB) byte units.
    pub fn uses_decimal_units(&self) -> bool {
        self.units_speed_bytes == 1000
    }

    /// Converts a limit in the daemon's speed units to KiB/s.
    pub fn to_kibibytes_per_second(&self, speed: i64) -> i64 {
        if self.uses_decimal_units() {
            speed * 1000 / 1024
        } else {
            speed
        }
    }

    /// Converts KiB/s to the daemon's speed units.
    pub fn from_kibibytes_per_second(&self, speed: i64) -> i64 {
        if self.uses_decimal_units() {
            speed * 1024 / 1000
        } else {
            speed
        }
    }

    pub fn is_too_new(&self) -> bool {
        self.minimum_rpc_version > MINIMUM_RPC_VERSION
    }

    pub fn is_too_old(&self) -> bool {
        self.rpc_version < MINIMUM_RPC_VERSION
    }

    pub fn can_rename_files(&self) -> bool {
        self.rpc_version >= RENAME_AND_FREE_SPACE_RPC_VERSION
    }

    pub fn can_show_free_space_for_path(&self) -> bool {
        self.rpc_version >= RENAME_AND_FREE_SPACE_RPC_VERSION
    }
}
