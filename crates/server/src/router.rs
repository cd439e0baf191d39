//! Call router for dispatching opened calls to the file service.
//!
//! The router runs the handler selected by the call's [`CallKind`] and then
//! finishes the call: an end of stream on success, a single error message on
//! failure. Cancelled calls are finished by the client and get neither.

use protocol::{CallKind, CallReceiver, CallSender};
use storage::FileStore;
use tracing::{debug, warn};

use crate::files::{CallError, FileService};

/// Dispatches calls to [`FileService`] handlers.
pub struct CallRouter<S> {
    service: FileService<S>,
}

impl<S> Clone for CallRouter<S> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
        }
    }
}

impl<S: FileStore> CallRouter<S> {
    /// Create a router over the given service.
    pub fn new(service: FileService<S>) -> Self {
        Self { service }
    }

    /// The service calls are dispatched to.
    pub fn service(&self) -> &FileService<S> {
        &self.service
    }

    /// Run one call to completion and send its terminal message.
    ///
    /// Returns the handler's error, if any, after it has been reported.
    pub async fn dispatch(
        &self,
        kind: CallKind,
        rx: CallReceiver,
        tx: CallSender,
    ) -> Result<(), CallError> {
        let outcome = match kind {
            CallKind::Download(req) => {
                drop(rx);
                self.service.download(req, &tx).await.map(drop)
            }
            CallKind::Upload(_) => self.service.upload(rx, &tx).await.map(drop),
            CallKind::ListFiles(req) => {
                drop(rx);
                self.service.list_files(req, &tx).await.map(drop)
            }
        };

        match &outcome {
            Ok(()) => {
                if let Err(e) = tx.close_send().await {
                    debug!(error = %e, "Could not end call stream");
                }
            }
            Err(e) if e.is_cancelled() => {
                debug!("Call cancelled by client");
            }
            Err(e) => {
                warn!(error = %e, code = %e.code(), "Call failed");
                if let Err(send) = tx.fail(e.to_error_message()).await {
                    debug!(error = %send, "Could not report call error");
                }
            }
        }

        outcome
    }
}
