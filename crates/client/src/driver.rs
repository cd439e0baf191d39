//! File operations against a fileserver.

use std::io;
use std::sync::Arc;

use protocol::messages::{
    DownloadRequest, ListEntry, ListRequest, Message, TransferHeader, UploadRequest,
};
use protocol::{CallKind, ChunkReader, ProtocolError, UploadSink};
use storage::{FileStore, LocalStore};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, Instrument, Span};

use crate::config::{ClientConfig, SizeCheck};
use crate::connection::Connection;

/// Errors returned by [`FileClient`] operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("error connecting to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Stream(#[from] ProtocolError),

    #[error("error creating file: {0}")]
    LocalCreate(#[source] io::Error),

    #[error("error opening file: {0}")]
    LocalOpen(#[source] io::Error),

    #[error("error reading file: {0}")]
    LocalRead(#[source] io::Error),

    #[error("error writing to file: {0}")]
    LocalWrite(#[source] io::Error),

    #[error("error removing partial file: {0}")]
    Cleanup(#[source] io::Error),

    #[error("size check failed: read {read} bytes, server reported {reported}")]
    SizeMismatch { read: u64, reported: u64 },
}

/// Downloads, uploads and lists files over one connection.
///
/// Local files live in `store`; names are shared with the server, so a
/// download of `a.txt` lands in `a.txt` below the store root.
pub struct FileClient<S = LocalStore> {
    connection: Connection,
    store: Arc<S>,
    chunk_size: usize,
    size_check: SizeCheck,
    span: Span,
}

impl FileClient<LocalStore> {
    /// Connect to the configured server, using the configured directory for
    /// local files.
    pub async fn connect(config: &ClientConfig) -> Result<Self, ClientError> {
        let addr = config.server_address();
        let span = tracing::info_span!("client", server = %addr);
        let connection = Connection::connect(&addr, config.connect_timeout(), span.clone())
            .await
            .map_err(|source| ClientError::Connect {
                addr: addr.clone(),
                source,
            })?;

        Ok(Self::new(
            connection,
            Arc::new(LocalStore::new(&config.dir)),
            config,
            span,
        ))
    }
}

impl<S: FileStore> FileClient<S> {
    /// Create a client over an established connection.
    pub fn new(connection: Connection, store: Arc<S>, config: &ClientConfig, span: Span) -> Self {
        Self {
            connection,
            store,
            chunk_size: config.chunk_size,
            size_check: config.size_check,
            span,
        }
    }

    /// Download `filename` into the local store. Returns the bytes written.
    ///
    /// If the stream fails part way, the partial local file is removed. A
    /// failed removal is reported instead of the stream error.
    pub async fn download(&self, filename: &str) -> Result<u64, ClientError> {
        let span = tracing::info_span!(parent: &self.span, "download", file = %filename);
        self.download_inner(filename).instrument(span).await
    }

    async fn download_inner(&self, filename: &str) -> Result<u64, ClientError> {
        info!("Downloading file");
        let mut call = self
            .connection
            .open(CallKind::Download(DownloadRequest {
                filename: filename.to_string(),
            }))
            .await
            .inspect_err(|e| error!(error = %e, "Error downloading"))?;

        let mut file = self.store.create(filename).await.map_err(|e| {
            error!(error = %e, "Error creating file");
            ClientError::LocalCreate(e)
        })?;

        let mut total = 0u64;
        loop {
            let received = match call.recv().await {
                Ok(Some(Message::Chunk(chunk))) => chunk,
                Ok(Some(other)) => {
                    let unexpected = ProtocolError::UnexpectedMessage {
                        expected: "file chunk",
                        got: other.kind(),
                    };
                    return Err(self.abandon(filename, file, unexpected).await);
                }
                Ok(None) => break,
                Err(e) => return Err(self.abandon(filename, file, e).await),
            };
            file.write_all(&received.data).await.map_err(|e| {
                error!(error = %e, "Error writing to file");
                ClientError::LocalWrite(e)
            })?;
            total += received.data.len() as u64;
        }

        file.shutdown().await.map_err(ClientError::LocalWrite)?;
        info!(bytes = total, "Downloaded successfully");
        Ok(total)
    }

    /// Remove a partial download after a failed receive.
    async fn abandon(&self, filename: &str, file: S::Writer, cause: ProtocolError) -> ClientError {
        error!(error = %cause, "Error receiving chunk");
        match storage::discard(self.store.as_ref(), filename, file).await {
            Ok(()) => ClientError::Stream(cause),
            Err(e) => {
                error!(error = %e, "Error removing partial file");
                ClientError::Cleanup(e)
            }
        }
    }

    /// Upload `filename` from the local store. Returns the size reported by
    /// the server.
    ///
    /// The local byte count is compared with the reported size according to
    /// the configured [`SizeCheck`].
    pub async fn upload(&self, filename: &str) -> Result<u64, ClientError> {
        let span = tracing::info_span!(parent: &self.span, "upload", file = %filename);
        self.upload_inner(filename).instrument(span).await
    }

    async fn upload_inner(&self, filename: &str) -> Result<u64, ClientError> {
        info!("Uploading file");
        let mut call = self
            .connection
            .open(CallKind::Upload(UploadRequest {}))
            .await?;
        let sink = UploadSink::begin(
            call.sender().clone(),
            TransferHeader {
                filename: filename.to_string(),
            },
        )
        .await
        .inspect_err(|e| error!(error = %e, "Error sending request"))?;

        let file = self.store.open(filename).await.map_err(|e| {
            error!(error = %e, "Error opening file");
            ClientError::LocalOpen(e)
        })?;

        let mut chunks = ChunkReader::with_chunk_size(file, self.chunk_size);
        let mut read = 0u64;
        loop {
            let chunk = chunks.next_chunk().await.map_err(|e| {
                error!(error = %e, "Error reading file");
                ClientError::LocalRead(e)
            })?;
            let Some(data) = chunk else { break };
            read += data.len() as u64;
            sink.send_chunk(data)
                .await
                .inspect_err(|e| error!(error = %e, "Error sending chunk"))?;
        }
        info!(bytes = read, "File successfully read");

        sink.finish().await?;
        let reported = match call.recv().await? {
            Some(Message::UploadResult(result)) => result.size,
            Some(other) => {
                return Err(ProtocolError::UnexpectedMessage {
                    expected: "upload result",
                    got: other.kind(),
                }
                .into())
            }
            None => {
                return Err(ProtocolError::ConnectionClosed(
                    "call ended without an upload result".to_string(),
                )
                .into())
            }
        };
        if let Some(other) = call.recv().await? {
            return Err(ProtocolError::UnexpectedMessage {
                expected: "end of stream",
                got: other.kind(),
            }
            .into());
        }

        if self.size_check.rejects(read, reported) {
            error!(read, reported, "Size check failed");
            return Err(ClientError::SizeMismatch { read, reported });
        }

        info!(bytes = reported, "Uploaded successfully");
        Ok(reported)
    }

    /// List every file on the server.
    pub async fn list(&self) -> Result<Vec<ListEntry>, ClientError> {
        let mut entries = Vec::new();
        self.list_with(|entry| entries.push(entry)).await?;
        Ok(entries)
    }

    /// List every file on the server, handing entries to `on_entry` as they
    /// arrive. Returns the number of entries.
    pub async fn list_with<F>(&self, mut on_entry: F) -> Result<usize, ClientError>
    where
        F: FnMut(ListEntry),
    {
        let span = tracing::info_span!(parent: &self.span, "list");
        async {
            let mut call = self
                .connection
                .open(CallKind::ListFiles(ListRequest {}))
                .await
                .inspect_err(|e| error!(error = %e, "Error listing files"))?;

            let mut count = 0;
            loop {
                match call.recv().await {
                    Ok(Some(Message::Entry(entry))) => {
                        on_entry(entry);
                        count += 1;
                    }
                    Ok(Some(other)) => {
                        return Err(ProtocolError::UnexpectedMessage {
                            expected: "list entry",
                            got: other.kind(),
                        }
                        .into())
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "Error receiving files");
                        return Err(e.into());
                    }
                }
            }

            info!(entries = count, "All files listed");
            Ok(count)
        }
        .instrument(span)
        .await
    }
}
