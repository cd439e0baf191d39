//! # Fileserver Client Library
//!
//! Downloads, uploads and lists files on a fileserver over one multiplexed
//! TCP connection.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use client::{ClientConfig, FileClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ClientConfig::default();
//!     let client = FileClient::connect(&config).await?;
//!
//!     for entry in client.list().await? {
//!         println!("{} ({} bytes)", entry.filename, entry.size);
//!     }
//!     client.download("report.pdf").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Client configuration and the upload size check policy
//! - [`connection`]: Call multiplexing over one connection
//! - [`driver`]: Download, upload and list operations

pub mod config;
pub mod connection;
pub mod driver;

pub use config::{ClientConfig, SizeCheck};
pub use connection::{Call, Connection};
pub use driver::{ClientError, FileClient};
