//! Log output for the engine and its front ends
//!
//! The console shows what the user asked for. Every run also leaves a
//! complete log next to it, which is what a bug report about a daemon
//! that would not connect needs.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Name of the per-run log, replaced on every start.
pub const RUN_LOG_NAME: &str = "tremote-last-run.log";

/// Directives for the run log. HTTP and TLS internals stay quieter than
/// the engine so request bodies are not buried in connection chatter.
const RUN_LOG_DIRECTIVES: &str = "trace,hyper=info,hyper_util=info,h2=info,rustls=info";

/// Where the run log lands for a given logs directory, `./logs` by default.
pub fn run_log_path(logs_dir: Option<&Path>) -> PathBuf {
    logs_dir.unwrap_or_else(|| Path::new("logs")).join(RUN_LOG_NAME)
}

/// Installs the global subscriber.
///
/// `RUST_LOG`, when set, overrides `console_level` for the console only.
///
/// # Errors
///
/// - The logs directory cannot be created or the run log cannot be opened
/// - A global subscriber is already installed
pub fn init_tracing(
    console_level: Level,
    logs_dir: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let run_log = run_log_path(logs_dir);
    if let Some(parent) = run_log.parent() {
        create_dir_all(parent)?;
    }
    let file = File::create(&run_log)?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_level.to_string()));

    let console = fmt::layer()
        .with_target(true)
        .without_time()
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let run_file = fmt::layer()
        .with_ansi(false)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(file)
        .with_filter(EnvFilter::new(RUN_LOG_DIRECTIVES));

    tracing_subscriber::registry()
        .with(console)
        .with(run_file)
        .try_init()?;

    tracing::debug!(
        "Logging to console at {} and to {}",
        console_level,
        run_log.display()
    );
    Ok(())
}

/// Console verbosity accepted by `--log-level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    Info,
    /// Adds connection state changes and poll scheduling
    Debug,
    /// Adds every request and reply body
    Trace,
}

impl From<CliLogLevel> for Level {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl std::str::FromStr for CliLogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let level = match s.to_ascii_lowercase().as_str() {
            "error" => CliLogLevel::Error,
            "warn" | "warning" => CliLogLevel::Warn,
            "info" => CliLogLevel::Info,
            "debug" => CliLogLevel::Debug,
            "trace" => CliLogLevel::Trace,
            _ => return Err(format!("Unknown log level '{s}'")),
        };
        Ok(level)
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let level: Level = (*self).into();
        write!(f, "{}", level.as_str().to_ascii_lowercase())
    }
}
