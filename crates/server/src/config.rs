//! Configuration management for the fileserver daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/fileserver/server.toml`.
//! Values are layered: file (or defaults), then environment, then CLI flags.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest accepted transfer chunk size (4 MiB). Keeps every chunk well inside
/// a single frame.
pub const MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("addr must not be empty")]
    EmptyAddress,

    #[error("chunk_size must be between 1 and {max}, got {got}")]
    InvalidChunkSize { got: usize, max: usize },

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("root is not a directory: {0}")]
    InvalidRoot(PathBuf),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the fileserver daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Listener and lifecycle configuration.
    pub server: ServerConfig,

    /// Transfer tuning.
    pub transfer: TransferConfig,

    /// Logging output.
    pub logging: LoggingConfig,
}

/// Listener and lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on.
    pub addr: String,

    /// Port to listen on.
    pub port: u16,

    /// Directory served to clients.
    pub root: PathBuf,

    /// Seconds a new connection may stay silent before it is dropped.
    pub connect_timeout_secs: u64,

    /// Seconds in-flight calls get to finish after a shutdown signal.
    pub shutdown_timeout_secs: u64,
}

/// Transfer tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes read from disk per download chunk.
    pub chunk_size: usize,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Logging output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Output format.
    pub format: LogFormat,

    /// Log file. Logs go to stdout when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0".to_string(),
            port: 50051,
            root: PathBuf::from("."),
            connect_timeout_secs: 60,
            shutdown_timeout_secs: 30,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: protocol::CHUNK_SIZE,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

impl ServerConfig {
    /// `addr:port` as passed to the listener.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }

    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Shutdown drain timeout as a [`Duration`].
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fileserver")
        .join("server.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - FILESERVER_ROOT: Override the served directory
    /// - FILESERVER_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    ///
    /// Returns the variables that were applied with their values. Logging is
    /// not running yet when this is called, so the caller reports them.
    pub fn apply_env_overrides(&mut self) -> Vec<(&'static str, String)> {
        let mut applied = Vec::new();

        if let Ok(root) = std::env::var("FILESERVER_ROOT") {
            if !root.is_empty() {
                self.server.root = PathBuf::from(&root);
                applied.push(("FILESERVER_ROOT", root));
            }
        }

        if let Ok(level) = std::env::var("FILESERVER_LOG_LEVEL") {
            if !level.is_empty() {
                self.logging.level = level.clone();
                applied.push(("FILESERVER_LOG_LEVEL", level));
            }
        }

        applied
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.addr.trim().is_empty() {
            return Err(ConfigError::EmptyAddress);
        }

        let chunk_size = self.transfer.chunk_size;
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::InvalidChunkSize {
                got: chunk_size,
                max: MAX_CHUNK_SIZE,
            });
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        if !self.server.root.is_dir() {
            return Err(ConfigError::InvalidRoot(self.server.root.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
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
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
