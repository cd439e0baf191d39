//! ListFiles: stream one entry per stored file.

use std::io;

use protocol::messages::{ListEntry, ListRequest, Message};
use protocol::CallSender;
use storage::FileStore;
use tokio::sync::mpsc;
use tracing::{error, info};

use super::{CallError, FileService};

/// Walk results buffered between the blocking walker and the call.
const WALK_BUFFER: usize = 64;

impl<S: FileStore> FileService<S> {
    /// Send every file below the root, depth-first in lexical order.
    ///
    /// The first walk or send error aborts the listing. Returns the number
    /// of entries sent.
    pub async fn list_files(&self, _req: ListRequest, tx: &CallSender) -> Result<usize, CallError> {
        info!("List request received");

        let (found_tx, mut found) = mpsc::channel(WALK_BUFFER);
        let walk = self.store().walk();
        let walker = tokio::task::spawn_blocking(move || {
            for item in walk {
                let failed = item.is_err();
                if found_tx.blocking_send(item).is_err() || failed {
                    break;
                }
            }
        });

        let mut count = 0;
        while let Some(item) = found.recv().await {
            let file = item.map_err(|e| {
                error!(error = %e, "Error walking dir");
                CallError::Walk(e)
            })?;
            let entry = ListEntry {
                filename: file.path,
                size: file.size,
                mod_time: file.modified.into(),
            };
            if let Err(e) = tx.send(Message::Entry(entry)).await {
                error!(error = %e, "Error sending response");
                return Err(CallError::ListSend(e));
            }
            count += 1;
        }

        walker.await.map_err(|e| CallError::Walk(io::Error::other(e)))?;

        info!(entries = count, "Successfully listed");
        Ok(count)
    }
}
