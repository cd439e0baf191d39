//! # Fileserver Daemon Library
//!
//! This crate serves a directory tree to fileserver clients: chunked
//! downloads and uploads plus a recursive file listing, multiplexed over
//! one TCP connection per client.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        FileServer                           │
//! │  accept loop, shutdown token, connection tracker            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Connection (one task per client)                           │
//! │  frame I/O, call table, one task per call                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CallRouter → FileService { download, upload, list_files }  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  storage::FileStore (LocalStore)                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use server::{Config, FileServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let server = FileServer::new(&config);
//!     let listener = server.bind().await?;
//!     let shutdown = server.shutdown_token();
//!
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         shutdown.cancel();
//!     });
//!     server.serve(listener).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`logging`]: Tracing subscriber setup
//! - [`files`]: Download, upload and listing handlers
//! - [`router`]: Call dispatch
//! - [`connection`]: Per-connection driver
//! - [`server`]: Listener and graceful shutdown

pub mod config;
pub mod connection;
pub mod files;
pub mod logging;
pub mod router;
pub mod server;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;
pub use files::{CallError, FileService};
pub use router::CallRouter;
pub use server::FileServer;
