//! Centralized configuration for Tremote.
//!
//! All tunable parameters of a daemon connection are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::time::Duration;

use url::Url;

/// Default retry budget for transport failures (3 attempts in total).
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 2;

/// Central configuration for a Tremote session.
///
/// Groups the daemon address and credentials separately from the
/// timing policy of the connection. Supports environment variable
/// overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct TremoteConfig {
    pub server: ServerConfig,
    pub connection: ConnectionConfig,
}

/// Proxy used to reach the daemon.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ProxyConfig {
    /// Whatever the system and environment configure
    #[default]
    Default,
    Http(ProxyEndpoint),
    Socks5(ProxyEndpoint),
}

/// Address and optional credentials of a proxy server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub hostname: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
}

/// HTTP basic access authentication credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Client certificate and its private key, both PEM encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub certificate_pem: String,
    pub private_key_pem: String,
}

/// Daemon endpoint and everything needed to authenticate against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host name or IP address of the daemon
    pub address: String,
    pub port: u16,
    /// Path of the RPC endpoint
    pub api_path: String,
    pub https: bool,
    pub proxy: ProxyConfig,
    /// PEM encoded certificates the daemon is expected to present
    pub server_certificate_chain: Vec<String>,
    pub client_identity: Option<ClientIdentity>,
    pub authentication: Option<Credentials>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: 9091,
            api_path: "/transmission/rpc".to_string(),
            https: false,
            proxy: ProxyConfig::Default,
            server_certificate_chain: Vec::new(),
            client_identity: None,
            authentication: None,
        }
    }
}

impl ServerConfig {
    /// Creates a plain HTTP configuration for the given daemon address.
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            ..Default::default()
        }
    }

    /// Returns true when an address has been configured.
    pub fn is_configured(&self) -> bool {
        !self.address.trim().is_empty()
    }

    /// Builds the RPC endpoint URL.
    ///
    /// # Errors
    /// - `ConfigError::InvalidServerUrl` - Address or path do not form a valid URL
    pub fn url(&self) -> Result<Url, ConfigError> {
        let scheme = if self.https { "https" } else { "http" };
        let host = if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]", self.address)
        } else {
            self.address.clone()
        };
        let path = if self.api_path.starts_with('/') {
            self.api_path.clone()
        } else {
            format!("/{}", self.api_path)
        };

        let raw = format!("{scheme}://{host}:{}{path}", self.port);
        Url::parse(&raw).map_err(|e| ConfigError::InvalidServerUrl {
            url: raw,
            reason: e.to_string(),
        })
    }
}

/// Timing and recovery policy of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Per-request transfer timeout
    pub timeout: Duration,
    /// Delay between the end of one poll cycle and the start of the next
    pub update_interval: Duration,
    /// Retries allowed after a timed out or failed request
    pub retry_attempts: u32,
    pub auto_reconnect_enabled: bool,
    pub auto_reconnect_interval: Duration,
    /// User agent for HTTP requests
    pub user_agent: &'static str,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            update_interval: Duration::from_secs(5),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            auto_reconnect_enabled: false,
            auto_reconnect_interval: Duration::from_secs(30),
            user_agent: "tremote/0.1.0",
        }
    }
}

impl TremoteConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Server overrides
        if let Ok(address) = std::env::var("TREMOTE_ADDRESS") {
            config.server.address = address;
        }

        if let Ok(port) = std::env::var("TREMOTE_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                config.server.port = port;
            }
        }

        if let Ok(path) = std::env::var("TREMOTE_API_PATH") {
            config.server.api_path = path;
        }

        if let Ok(https) = std::env::var("TREMOTE_HTTPS") {
            config.server.https = https.parse().unwrap_or(false);
        }

        if let (Ok(username), Ok(password)) = (
            std::env::var("TREMOTE_USERNAME"),
            std::env::var("TREMOTE_PASSWORD"),
        ) {
            config.server.authentication = Some(Credentials { username, password });
        }

        // Connection overrides
        if let Ok(timeout) = std::env::var("TREMOTE_TIMEOUT") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.connection.timeout = Duration::from_secs(seconds);
            }
        }

        if let Ok(interval) = std::env::var("TREMOTE_UPDATE_INTERVAL") {
            if let Ok(seconds) = interval.parse::<u64>() {
                config.connection.update_interval = Duration::from_secs(seconds);
            }
        }

        if let Ok(attempts) = std::env::var("TREMOTE_RETRY_ATTEMPTS") {
            if let Ok(attempts) = attempts.parse::<u32>() {
                config.connection.retry_attempts = attempts;
            }
        }

        if let Ok(interval) = std::env::var("TREMOTE_AUTO_RECONNECT") {
            if let Ok(seconds) = interval.parse::<u64>() {
                config.connection.auto_reconnect_enabled = seconds > 0;
                config.connection.auto_reconnect_interval = Duration::from_secs(seconds);
            }
        }

        config
    }

    /// Creates a configuration for a local daemon with short timings, for tests.
    pub fn for_testing(address: &str, port: u16) -> Self {
        Self {
            server: ServerConfig::new(address, port),
            connection: ConnectionConfig {
                timeout: Duration::from_secs(5),
                update_interval: Duration::from_millis(200),
                ..Default::default()
            },
        }
    }
}

/// Errors raised while turning configuration into a usable client.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid server URL {url}: {reason}")]
    InvalidServerUrl { url: String, reason: String },

    #[error("Invalid certificate: {reason}")]
    InvalidCertificate { reason: String },

    #[error("Invalid proxy configuration: {reason}")]
    InvalidProxy { reason: String },

    #[error("HTTP client construction failed: {reason}")]
    ClientConstruction { reason: String },
}
