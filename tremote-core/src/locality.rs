//! Detection of a daemon running on this machine
//!
//! Callers use the answer to gate features such as browsing the local file
//! system for download directories. Three checks run in order and the first
//! conclusive one wins:
//!
//! 1. the daemon writes `tr_session_id_<token>` into its temporary
//!    directory, so finding that file proves it shares our file system;
//! 2. the RPC host is a loopback address, `localhost`, our host name or one
//!    of the addresses our host name resolves to;
//! 3. the RPC host name resolves to such an address.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use url::{Host, Url};

/// Outcome of one probe, tagged with the connection attempt it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalityResult {
    pub generation: u64,
    pub is_local: bool,
}

/// Locality checks against a given marker directory.
#[derive(Debug, Clone)]
pub struct LocalityProbe {
    marker_directory: PathBuf,
}

impl Default for LocalityProbe {
    fn default() -> Self {
        Self {
            marker_directory: default_marker_directory(),
        }
    }
}

#[cfg(windows)]
fn default_marker_directory() -> PathBuf {
    std::env::var_os("LOCALAPPDATA")
        .map(|dir| PathBuf::from(dir).join("Transmission"))
        .unwrap_or_else(std::env::temp_dir)
}

#[cfg(not(windows))]
fn default_marker_directory() -> PathBuf {
    std::env::temp_dir()
}

impl LocalityProbe {
    pub fn with_marker_directory(marker_directory: impl Into<PathBuf>) -> Self {
        Self {
            marker_directory: marker_directory.into(),
        }
    }

    pub fn marker_directory(&self) -> &Path {
        &self.marker_directory
    }

    /// Path of the marker file the daemon creates for `session_id`.
    pub fn session_marker_path(&self, session_id: &str) -> PathBuf {
        self.marker_directory
            .join(format!("tr_session_id_{session_id}"))
    }

    /// Decides whether the daemon behind `url` runs on this machine.
    pub async fn is_local(&self, url: &Url, session_id: Option<&str>) -> bool {
        if let Some(session_id) = session_id {
            let marker = self.session_marker_path(session_id);
            if tokio::fs::try_exists(&marker).await.unwrap_or(false) {
                tracing::debug!("Found session marker {}, daemon is local", marker.display());
                return true;
            }
        }

        let Some(host) = url.host() else {
            return false;
        };

        let is_local = match host {
            Host::Ipv4(ip) => is_local_ip(IpAddr::V4(ip)).await,
            Host::Ipv6(ip) => is_local_ip(IpAddr::V6(ip)).await,
            Host::Domain(domain) => {
                if is_local_host_name(domain) {
                    true
                } else {
                    let port = url.port_or_known_default().unwrap_or(0);
                    resolves_to_local_address(domain, port).await
                }
            }
        };
        tracing::debug!("Daemon at {host} is local: {is_local}");
        is_local
    }
}

fn is_local_host_name(name: &str) -> bool {
    name.eq_ignore_ascii_case("localhost")
        || sysinfo::System::host_name().is_some_and(|host_name| host_name.eq_ignore_ascii_case(name))
}

async fn is_local_ip(ip: IpAddr) -> bool {
    ip.is_loopback() || local_addresses().await.contains(&ip)
}

/// Addresses our own host name resolves to.
async fn local_addresses() -> Vec<IpAddr> {
    let Some(host_name) = sysinfo::System::host_name() else {
        return Vec::new();
    };
    match tokio::net::lookup_host((host_name.as_str(), 0)).await {
        Ok(addresses) => addresses.map(|address| address.ip()).collect(),
        Err(e) => {
            tracing::debug!("Failed to resolve own host name {host_name}: {e}");
            Vec::new()
        }
    }
}

async fn resolves_to_local_address(domain: &str, port: u16) -> bool {
    let resolved: Vec<IpAddr> = match tokio::net::lookup_host((domain, port)).await {
        Ok(addresses) => addresses.map(|address| address.ip()).collect(),
        Err(e) => {
            tracing::warn!("Failed to resolve {domain}: {e}");
            return false;
        }
    };

    if resolved.iter().any(IpAddr::is_loopback) {
        return true;
    }
    let local = local_addresses().await;
    resolved.iter().any(|ip| local.contains(ip))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_session_marker_proves_locality() {
        let dir = tempfile::tempdir().unwrap();
        let probe = LocalityProbe::with_marker_directory(dir.path());
        // TEST-NET-3 address, never assigned to a real machine
        let remote = url("http://203.0.113.7:9091/transmission/rpc");

        assert!(!probe.is_local(&remote, Some("abc")).await);

        std::fs::write(probe.session_marker_path("abc"), b"").unwrap();
        assert!(probe.is_local(&remote, Some("abc")).await);
        assert!(!probe.is_local(&remote, Some("other")).await);
        assert!(!probe.is_local(&remote, None).await);
    }

    #[tokio::test]
    async fn test_loopback_and_localhost_are_local() {
        let dir = tempfile::tempdir().unwrap();
        let probe = LocalityProbe::with_marker_directory(dir.path());

        assert!(probe.is_local(&url("http://127.0.0.1:9091/"), None).await);
        assert!(probe.is_local(&url("http://[::1]:9091/"), None).await);
        assert!(probe.is_local(&url("http://LOCALHOST:9091/"), None).await);
    }

    #[test]
    fn test_marker_path() {
        let probe = LocalityProbe::with_marker_directory("/tmp/daemon");
        assert_eq!(
            probe.session_marker_path("xyz"),
            PathBuf::from("/tmp/daemon/tr_session_id_xyz")
        );
    }
}
