//! # Fileserver Storage
//!
//! Filesystem access for the fileserver, kept behind the [`FileStore`] trait
//! so handlers can be exercised against stores other than the local disk.
//!
//! All names handed to a store are relative to its root and `/`-separated.

use std::future::Future;
use std::io;
use std::time::SystemTime;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

pub mod local;

pub use local::LocalStore;

/// A regular file found while walking a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    /// Path relative to the store root, `/`-separated.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub modified: SystemTime,
}

/// Iterator over every regular file of a store.
pub type Walk = Box<dyn Iterator<Item = io::Result<StoredFile>> + Send>;

/// Rooted file access used by the transfer handlers.
pub trait FileStore: Send + Sync + 'static {
    /// Handle returned by [`FileStore::open`].
    type Reader: AsyncRead + Unpin + Send + 'static;
    /// Handle returned by [`FileStore::create`].
    type Writer: AsyncWrite + Unpin + Send + 'static;

    /// Open an existing file for reading.
    fn open(&self, name: &str) -> impl Future<Output = io::Result<Self::Reader>> + Send;

    /// Create a file for writing, truncating it if it exists.
    ///
    /// Parent directories are not created.
    fn create(&self, name: &str) -> impl Future<Output = io::Result<Self::Writer>> + Send;

    /// Remove a file.
    fn remove(&self, name: &str) -> impl Future<Output = io::Result<()>> + Send;

    /// Walk the whole store depth-first, in lexical order per directory.
    ///
    /// Directories themselves are not yielded. The walk stops being useful
    /// after the first error; callers are expected to abort on it.
    fn walk(&self) -> Walk;
}

/// Release a partially written file and remove it.
///
/// Errors from shutting the writer down are ignored; the removal result is
/// returned.
pub async fn discard<S: FileStore>(store: &S, name: &str, mut writer: S::Writer) -> io::Result<()> {
    if let Err(e) = writer.shutdown().await {
        tracing::debug!(file = %name, error = %e, "Ignoring error while closing discarded file");
    }
    drop(writer);
    store.remove(name).await
}
