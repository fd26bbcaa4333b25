//! Tremote CLI - Command-line interface
//!
//! Connects to a Transmission daemon and runs a single command against it.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use tremote_core::config::{Credentials, TremoteConfig};
use tremote_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "tremote")]
#[command(about = "Remote control for Transmission daemons")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,

    /// Console log level
    #[arg(long, default_value = "warn")]
    log_level: CliLogLevel,

    /// Directory for the trace log of this run
    #[arg(long)]
    logs_dir: Option<PathBuf>,

    /// Daemon host name or IP address
    #[arg(short, long)]
    address: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Path of the RPC endpoint
    #[arg(long)]
    api_path: Option<String>,

    #[arg(long)]
    https: bool,

    #[arg(short, long, requires = "password")]
    username: Option<String>,

    #[arg(long, requires = "username")]
    password: Option<String>,
}

impl Cli {
    /// Layers the command line over the environment configuration.
    fn config(&self) -> TremoteConfig {
        let mut config = TremoteConfig::from_env();
        if let Some(address) = &self.address {
            config.server.address = address.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(api_path) = &self.api_path {
            config.server.api_path = api_path.clone();
        }
        if self.https {
            config.server.https = true;
        }
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            config.server.authentication = Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            });
        }
        if !config.server.is_configured() {
            config.server.address = "localhost".to_string();
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_level.into(), cli.logs_dir.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    let config = cli.config();
    commands::handle_command(cli.command, config).await
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_command_line_overrides() {
        let cli = Cli::parse_from([
            "tremote",
            "--address",
            "seedbox.lan",
            "--port",
            "9092",
            "--https",
            "--username",
            "admin",
            "--password",
            "secret",
            "list",
        ]);
        let config = cli.config();

        assert_eq!(config.server.address, "seedbox.lan");
        assert_eq!(config.server.port, 9092);
        assert!(config.server.https);
        assert_eq!(
            config.server.authentication.map(|credentials| credentials.username),
            Some("admin".to_string())
        );
    }

    #[test]
    fn test_username_requires_password() {
        let result = Cli::try_parse_from(["tremote", "--username", "admin", "list"]);
        assert!(result.is_err());
    }
}
