//! CLI command implementations

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Subcommand;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tremote_core::config::TremoteConfig;
use tremote_core::engine::{AddTorrentOptions, RpcEvent, RpcHandle, spawn_rpc};
use tremote_core::model::Torrent;

/// How long a command waits for the daemon to react.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Show connection and transfer status
    Status,
    /// List all torrents
    List,
    /// Print changes as they are polled, until interrupted
    Watch,
    /// Add a torrent from a magnet link, URL or file
    Add {
        /// Magnet link, URL or path to a torrent file
        source: String,
        /// Download directory override
        #[arg(short, long)]
        download_dir: Option<String>,
        /// Add without starting
        #[arg(long)]
        paused: bool,
    },
    /// Start torrents
    Start {
        ids: Vec<i64>,
        /// Bypass the download queue
        #[arg(long)]
        now: bool,
    },
    /// Stop torrents
    Stop { ids: Vec<i64> },
    /// Remove torrents
    Remove {
        ids: Vec<i64>,
        /// Also delete downloaded data
        #[arg(long)]
        delete_data: bool,
    },
    /// Verify downloaded data
    Verify { ids: Vec<i64> },
    /// Ask trackers for more peers
    Reannounce { ids: Vec<i64> },
    /// Show free space in the download directory or at a path
    FreeSpace { path: Option<String> },
    /// Shut the daemon down
    ShutdownDaemon,
}

/// Connects, runs `command` and shuts the engine down.
///
/// # Errors
/// - Connection failures, with the daemon's detailed diagnostics
/// - Command specific failures reported by the daemon
pub async fn handle_command(command: Commands, config: TremoteConfig) -> anyhow::Result<()> {
    let mut session = Session::connect(config).await?;

    let result = match command {
        Commands::Status => show_status(&session).await,
        Commands::List => list_torrents(&session).await,
        Commands::Watch => watch(&mut session).await,
        Commands::Add {
            source,
            download_dir,
            paused,
        } => add_torrent(&mut session, &source, download_dir, paused).await,
        Commands::Start { ids, now } => {
            session.handle.start_torrents(ids, now).await?;
            session.finish("Started").await
        }
        Commands::Stop { ids } => {
            session.handle.stop_torrents(ids).await?;
            session.finish("Stopped").await
        }
        Commands::Remove { ids, delete_data } => {
            session.handle.remove_torrents(ids, delete_data).await?;
            session.finish("Removed").await
        }
        Commands::Verify { ids } => {
            session.handle.verify_torrents(ids).await?;
            session.finish("Verification queued").await
        }
        Commands::Reannounce { ids } => {
            session.handle.reannounce_torrents(ids).await?;
            session.finish("Reannounce requested").await
        }
        Commands::FreeSpace { path } => free_space(&mut session, path).await,
        Commands::ShutdownDaemon => shutdown_daemon(&mut session).await,
    };

    session.handle.shutdown().await?;
    result
}

/// A connected engine and its event stream.
struct Session {
    handle: RpcHandle,
    events: mpsc::UnboundedReceiver<RpcEvent>,
}

impl Session {
    async fn connect(config: TremoteConfig) -> anyhow::Result<Self> {
        let (handle, mut events) = spawn_rpc();
        let url = config.server.url()?;
        handle.set_server(config).await?;
        handle.connect().await?;

        let status = wait_for(&mut events, |event| match event {
            RpcEvent::StatusChanged(status)
                if status.is_connected() || status.error.is_some() =>
            {
                Some(status.clone())
            }
            _ => None,
        })
        .await
        .with_context(|| format!("Timed out connecting to {url}"))?;

        if !status.is_connected() {
            tracing::debug!("{}", status.detailed_message);
            bail!("Failed to connect to {url}: {status}");
        }
        tracing::debug!("Connected to {url}");
        Ok(Self { handle, events })
    }

    /// Waits for the command and the poll it triggered to complete.
    async fn finish(&mut self, message: &str) -> anyhow::Result<()> {
        timeout(COMMAND_TIMEOUT, self.handle.wait_idle())
            .await
            .context("Timed out waiting for the daemon")??;

        let status = self.handle.status().await?;
        if let Some(error) = status.error {
            bail!("{error}: {}", status.message);
        }
        println!("{message}");
        Ok(())
    }
}

/// Returns the first event `select` maps to a value.
async fn wait_for<T>(
    events: &mut mpsc::UnboundedReceiver<RpcEvent>,
    mut select: impl FnMut(&RpcEvent) -> Option<T>,
) -> anyhow::Result<T> {
    let found = timeout(COMMAND_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            if let Some(value) = select(&event) {
                return Some(value);
            }
        }
        None
    })
    .await?;
    found.context("RPC engine stopped")
}

async fn show_status(session: &Session) -> anyhow::Result<()> {
    let settings = session.handle.server_settings().await?;
    let stats = session.handle.server_stats().await?;
    let is_local = session.handle.is_server_local().await?;
    let torrents = session.handle.torrents().await?;

    println!("RPC version:     {}", settings.rpc_version);
    println!(
        "Daemon:          {}",
        match is_local {
            Some(true) => "local",
            Some(false) => "remote",
            None => "unknown",
        }
    );
    println!("Download dir:    {}", settings.download_directory);
    println!("Torrents:        {}", torrents.len());
    println!("Download speed:  {}", format_speed(stats.download_speed));
    println!("Upload speed:    {}", format_speed(stats.upload_speed));
    println!(
        "Session:         {} down, {} up",
        format_size(stats.current_session.downloaded),
        format_size(stats.current_session.uploaded)
    );
    println!(
        "Total:           {} down, {} up",
        format_size(stats.total.downloaded),
        format_size(stats.total.uploaded)
    );
    Ok(())
}

async fn list_torrents(session: &Session) -> anyhow::Result<()> {
    let torrents = session.handle.torrents().await?;
    if torrents.is_empty() {
        println!("No torrents");
        return Ok(());
    }

    println!(
        "{:>5}  {:>6}  {:>11}  {:>11}  {:<22}  Name",
        "ID", "Done", "Down", "Up", "Status"
    );
    for torrent in &torrents {
        println!("{}", format_torrent_row(torrent));
    }
    Ok(())
}

async fn watch(session: &mut Session) -> anyhow::Result<()> {
    println!("Watching for changes, press Ctrl+C to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            event = session.events.recv() => {
                let Some(event) = event else {
                    return Ok(());
                };
                match event {
                    RpcEvent::TorrentsUpdated(delta) => println!(
                        "Torrents: {} removed, {} changed, {} added",
                        delta.removed_count(),
                        delta.changed_count(),
                        delta.added
                    ),
                    RpcEvent::TorrentAdded { id } => println!("Torrent {id} added"),
                    RpcEvent::TorrentFinished { id } => println!("Torrent {id} finished"),
                    RpcEvent::StatusChanged(status) => {
                        println!("Connection: {status}");
                        if !status.is_connected() {
                            return Ok(());
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn add_torrent(
    session: &mut Session,
    source: &str,
    download_dir: Option<String>,
    paused: bool,
) -> anyhow::Result<()> {
    let options = AddTorrentOptions {
        download_directory: download_dir,
        start: !paused,
        ..Default::default()
    };

    if is_link(source) {
        session.handle.add_torrent_link(source, options).await?;
    } else {
        let path = PathBuf::from(source);
        session
            .handle
            .add_torrent_file(&path, options)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
    }

    let outcome = wait_for(&mut session.events, |event| match event {
        RpcEvent::TorrentAdded { id } => Some(Ok(format!("Added torrent {id}"))),
        RpcEvent::TorrentAddDuplicate => Some(Ok("Torrent is already added".to_string())),
        RpcEvent::TorrentAddError { message } => Some(Err(message.clone())),
        RpcEvent::StatusChanged(status) if !status.is_connected() => {
            Some(Err(status.to_string()))
        }
        _ => None,
    })
    .await?;

    match outcome {
        Ok(message) => {
            println!("{message}");
            Ok(())
        }
        Err(message) => bail!("Failed to add torrent: {message}"),
    }
}

async fn free_space(session: &mut Session, path: Option<String>) -> anyhow::Result<()> {
    let (path, bytes) = match path {
        Some(path) => {
            session.handle.get_free_space_for_path(&path).await?;
            let (success, bytes) = wait_for(&mut session.events, |event| match event {
                RpcEvent::FreeSpaceForPath { success, bytes, .. } => Some((*success, *bytes)),
                _ => None,
            })
            .await?;
            if !success {
                bail!("Daemon could not determine free space for {path}");
            }
            (path, bytes)
        }
        None => {
            session.handle.get_download_dir_free_space().await?;
            let bytes = wait_for(&mut session.events, |event| match event {
                RpcEvent::DownloadDirFreeSpace(bytes) => Some(*bytes),
                _ => None,
            })
            .await?;
            let settings = session.handle.server_settings().await?;
            (settings.download_directory, bytes)
        }
    };

    println!("{}: {} free", path, format_size(bytes));
    Ok(())
}

async fn shutdown_daemon(session: &mut Session) -> anyhow::Result<()> {
    session.handle.shutdown_server().await?;
    wait_for(&mut session.events, |event| match event {
        RpcEvent::StatusChanged(status) if !status.is_connected() => Some(()),
        _ => None,
    })
    .await?;
    println!("Daemon is shutting down");
    Ok(())
}

fn is_link(source: &str) -> bool {
    let lowercase = source.to_ascii_lowercase();
    ["magnet:", "http://", "https://"]
        .iter()
        .any(|scheme| lowercase.starts_with(scheme))
        && !Path::new(source).exists()
}

fn format_torrent_row(torrent: &Torrent) -> String {
    let data = torrent.data();
    let status = if data.error_string.is_empty() {
        format!("{:?}", data.status)
    } else {
        format!("{:?} (error)", data.status)
    };
    format!(
        "{:>5}  {:>5.1}%  {:>11}  {:>11}  {:<22}  {}",
        data.id,
        data.percent_done * 100.0,
        format_speed(data.download_speed),
        format_speed(data.upload_speed),
        status,
        data.name
    )
}

fn format_size(bytes: i64) -> String {
    const UNITS: [&str; 5] = ["B", "kB", "MB", "GB", "TB"];
    let mut value = bytes.max(0) as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn format_speed(bytes_per_second: i64) -> String {
    format!("{}/s", format_size(bytes_per_second))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1_500), "1.5 kB");
        assert_eq!(format_size(2_000_000_000), "2.0 GB");
        assert_eq!(format_speed(0), "0 B/s");
    }

    #[test]
    fn test_links_are_detected() {
        assert!(is_link("magnet:?xt=urn:btih:0123"));
        assert!(is_link("HTTPS://example.org/file.torrent"));
        assert!(!is_link("/tmp/file.torrent"));
        assert!(!is_link("file.torrent"));
    }
}
