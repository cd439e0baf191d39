//! Configuration for the fileserver client.
//!
//! The default configuration path is `~/.config/fileserver/client.toml`.
//! Command-line flags override file values.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::ValueEnum;
use protocol::CHUNK_SIZE;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest accepted upload chunk size (4 MiB).
pub const MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("addr must not be empty")]
    EmptyAddress,

    #[error("chunk_size must be between 1 and {max}, got {got}")]
    InvalidChunkSize { got: usize, max: usize },
}

/// How an upload's local byte count is compared with the size the server
/// reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SizeCheck {
    /// Fail when the two counts are equal.
    #[default]
    RejectEqual,
    /// Fail when the two counts differ.
    RejectMismatch,
    /// Never fail.
    Off,
}

impl SizeCheck {
    /// Whether `read` local bytes against `reported` server bytes fails the upload.
    pub fn rejects(self, read: u64, reported: u64) -> bool {
        match self {
            SizeCheck::RejectEqual => read == reported,
            SizeCheck::RejectMismatch => read != reported,
            SizeCheck::Off => false,
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address.
    pub addr: String,

    /// Server port.
    pub port: u16,

    /// Local directory files are downloaded to and uploaded from.
    pub dir: PathBuf,

    /// Bound on establishing the TCP connection.
    pub connect_timeout_secs: u64,

    /// Upload chunk size in bytes.
    pub chunk_size: usize,

    /// Post-upload size comparison.
    pub size_check: SizeCheck,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0".to_string(),
            port: 50051,
            dir: PathBuf::from("."),
            connect_timeout_secs: 60,
            chunk_size: CHUNK_SIZE,
            size_check: SizeCheck::default(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fileserver")
        .join("client.toml")
}

impl ClientConfig {
    /// Returns the `addr:port` string to connect to.
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }

    /// Returns the connect timeout as a Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.addr.trim().is_empty() {
            return Err(ConfigError::EmptyAddress);
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::InvalidChunkSize {
                got: self.chunk_size,
                max: MAX_CHUNK_SIZE,
            });
        }
        Ok(())
    }

    /// Load configuration from a file, or defaults if it does not exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", e.message()))
    }
}
