//! Fileserver Daemon
//!
//! Serves a directory tree to fileserver clients.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use server::config::{default_config_path, Config, LogFormat};
use server::{logging, FileServer};

/// Fileserver daemon - serves a directory for chunked upload, download and listing.
#[derive(Parser, Debug)]
#[command(name = "fileserver")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Address to listen on
    #[arg(long, value_name = "ADDR")]
    pub addr: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Directory to serve
    #[arg(long, value_name = "DIR")]
    pub dir: Option<PathBuf>,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log output format
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormatArg>,

    /// Write logs to this file instead of stdout
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,
}

/// Log format as accepted on the command line.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormatArg {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

impl Cli {
    /// Apply command-line overrides on top of file and environment values.
    fn apply_to(&self, config: &mut Config) {
        if let Some(addr) = &self.addr {
            config.server.addr = addr.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(dir) = &self.dir {
            config.server.root = dir.clone();
        }
        if let Some(format) = self.log_format {
            config.logging.format = format.into();
        }
        if let Some(file) = &self.log_file {
            config.logging.file = Some(file.clone());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    let env_overrides = config.apply_env_overrides();
    cli.apply_to(&mut config);
    config.validate()?;

    let _log_guard = logging::init(&config.logging, cli.verbose)?;

    tracing::info!("Fileserver starting...");
    if config_path.exists() {
        tracing::debug!("Using config file: {:?}", config_path);
    } else {
        tracing::debug!("Config file not found at {:?}, using defaults", config_path);
    }
    for (var, value) in &env_overrides {
        tracing::info!("Overriding from environment: {}={}", var, value);
    }

    let server = FileServer::new(&config);
    let listener = server
        .bind()
        .await
        .with_context(|| format!("Failed to listen on {}", config.server.bind_address()))?;
    let shutdown = server.shutdown_token();
    let serving = tokio::spawn(server.serve(listener));

    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");
    shutdown.cancel();

    serving
        .await
        .context("Server task panicked")?
        .context("Server stopped with an error")?;

    tracing::info!("Server shut down gracefully");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl-C).
#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")
}
