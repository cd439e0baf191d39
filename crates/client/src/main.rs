//! Fileserver Client
//!
//! Command-line access to a fileserver: list, download and upload.

use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use client::config::{default_config_path, ClientConfig, SizeCheck};
use client::FileClient;
use protocol::messages::{ListEntry, Timestamp};
use tracing_subscriber::EnvFilter;

/// Fileserver client - list, download and upload files.
#[derive(Parser, Debug)]
#[command(name = "fileserver-client")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Server address
    #[arg(long, value_name = "ADDR")]
    pub addr: Option<String>,

    /// Server port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Local directory for downloaded and uploaded files
    #[arg(long, value_name = "DIR")]
    pub dir: Option<PathBuf>,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// How the uploaded size is checked against the server's report
    #[arg(long, value_enum)]
    pub size_check: Option<SizeCheck>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// List files on the server (default)
    List,

    /// Download a file into the local directory
    Download {
        /// Name of the file, relative to the served directory
        name: String,
    },

    /// Upload a file from the local directory
    Upload {
        /// Name of the file, relative to the local directory
        name: String,
    },
}

impl Cli {
    fn apply_to(&self, config: &mut ClientConfig) {
        if let Some(addr) = &self.addr {
            config.addr = addr.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(dir) = &self.dir {
            config.dir = dir.clone();
        }
        if let Some(size_check) = self.size_check {
            config.size_check = size_check;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(cli.verbose))
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = ClientConfig::load(&config_path)?;
    cli.apply_to(&mut config);
    config.validate()?;

    let client = FileClient::connect(&config).await?;

    match cli.command.unwrap_or(Commands::List) {
        Commands::List => {
            println!("{}", table_header());
            client
                .list_with(|entry| println!("{}", table_row(&entry)))
                .await
                .context("Listing failed")?;
        }
        Commands::Download { name } => {
            let bytes = client
                .download(&name)
                .await
                .with_context(|| format!("Download of {name} failed"))?;
            println!("{name}: {bytes} bytes");
        }
        Commands::Upload { name } => {
            let bytes = client
                .upload(&name)
                .await
                .with_context(|| format!("Upload of {name} failed"))?;
            println!("{name}: {bytes} bytes");
        }
    }

    Ok(())
}

/// `RUST_LOG` when set, otherwise `info` or `debug` when verbose.
fn log_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }))
}

fn table_header() -> String {
    format!("{:>30} | {:>16} | {:>30}", "Filename", "Size", "Modification time")
}

fn table_row(entry: &ListEntry) -> String {
    format!(
        "{:>30} | {:>10} bytes | {:>30}",
        entry.filename,
        entry.size,
        format_time(entry.mod_time)
    )
}

fn format_time(time: Timestamp) -> String {
    match DateTime::<Utc>::from_timestamp(time.seconds, time.nanos) {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S%.f %Z").to_string(),
        None => format!("{}s since epoch", time.seconds),
    }
}
