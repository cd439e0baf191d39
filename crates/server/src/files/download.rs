//! Download: stream a stored file to the client in fixed-size chunks.

use protocol::messages::{DownloadRequest, FileChunk, Message};
use protocol::{CallSender, ChunkReader};
use storage::FileStore;
use tracing::{debug, error, info};

use super::{CallError, FileService};

impl<S: FileStore> FileService<S> {
    /// Send the contents of `req.filename` as an ordered run of chunks.
    ///
    /// Returns the number of bytes sent. The caller ends the stream.
    pub async fn download(&self, req: DownloadRequest, tx: &CallSender) -> Result<u64, CallError> {
        info!(file = %req.filename, "Download request received");

        let file = self.store().open(&req.filename).await.map_err(|e| {
            error!(file = %req.filename, error = %e, "Error opening file");
            CallError::Open(e)
        })?;

        let mut reader = ChunkReader::with_chunk_size(file, self.chunk_size());
        let mut sent: u64 = 0;
        let mut chunks: u64 = 0;
        loop {
            let data = match reader.next_chunk().await {
                Ok(Some(data)) => data,
                Ok(None) => break,
                Err(e) => {
                    error!(file = %req.filename, error = %e, "Error reading file");
                    return Err(CallError::Read(e));
                }
            };
            let len = data.len() as u64;

            if let Err(e) = tx.send(Message::Chunk(FileChunk::new(data))).await {
                error!(file = %req.filename, error = %e, "Error sending");
                return Err(CallError::Send(e));
            }
            sent += len;
            chunks += 1;
        }

        debug!(chunks, "Download stream finished");
        info!(file = %req.filename, bytes = sent, "Successfully sent");
        Ok(sent)
    }
}
