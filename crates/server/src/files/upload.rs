//! Upload: receive a header and a run of chunks into a stored file.

use protocol::messages::{Message, TransferResult};
use protocol::{CallReceiver, CallSender, UploadStream};
use storage::FileStore;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

use super::{CallError, FileService};

impl<S: FileStore> FileService<S> {
    /// Receive an upload and answer with its [`TransferResult`].
    ///
    /// If the stream breaks after the destination was created, the partial
    /// file is removed. A failed removal is reported instead of the stream
    /// error.
    pub async fn upload(&self, rx: CallReceiver, tx: &CallSender) -> Result<u64, CallError> {
        info!("Upload request received");

        let (header, mut stream) = UploadStream::accept(rx).await.map_err(|e| {
            error!(error = %e, "Error receiving");
            CallError::Receive(e)
        })?;
        let name = header.filename;

        let mut file = self.store().create(&name).await.map_err(|e| {
            error!(file = %name, error = %e, "Error creating file");
            CallError::Create(e)
        })?;

        let mut size: u64 = 0;
        loop {
            match stream.next_chunk().await {
                Ok(Some(chunk)) => {
                    if let Err(e) = file.write_all(&chunk.data).await {
                        error!(file = %name, error = %e, "Error writing chunk");
                        return Err(CallError::Write(e));
                    }
                    size += chunk.data.len() as u64;
                }
                Ok(None) => {
                    debug!(file = %name, "End of upload stream received");
                    break;
                }
                Err(e) => {
                    error!(file = %name, error = %e, "Error receiving chunks");
                    return match storage::discard(self.store(), &name, file).await {
                        Ok(()) => Err(CallError::ReceiveChunk(e)),
                        Err(rm) => {
                            error!(file = %name, error = %rm, "Error removing partial file");
                            Err(CallError::Cleanup(rm))
                        }
                    };
                }
            }
        }

        if let Err(e) = file.shutdown().await {
            error!(file = %name, error = %e, "Error flushing file");
            return Err(CallError::Write(e));
        }
        drop(file);

        if let Err(e) = tx.send(Message::UploadResult(TransferResult { size })).await {
            error!(file = %name, error = %e, "Error sending response");
            return Err(CallError::SendResult(e));
        }

        info!(file = %name, bytes = size, "Successfully uploaded");
        Ok(size)
    }
}
