//! File service handlers: download, upload and listing.
//!
//! Each handler runs one call to completion against a [`FileStore`] and
//! reports failure as a [`CallError`], which the router turns into the
//! call's single error message. Handlers never retry.

pub mod download;
pub mod list;
pub mod upload;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use protocol::messages::{ErrorCode, ErrorMessage};
use protocol::{CallId, CallKind, ProtocolError, CHUNK_SIZE};
use storage::FileStore;
use thiserror::Error;
use tracing::Span;

/// Failure of a single call.
#[derive(Debug, Error)]
pub enum CallError {
    /// The requested file could not be opened.
    #[error("error opening file: {0}")]
    Open(#[source] io::Error),

    /// Reading the file failed mid-stream.
    #[error("error reading file: {0}")]
    Read(#[source] io::Error),

    /// A chunk or entry could not be sent.
    #[error("error sending: {0}")]
    Send(#[source] ProtocolError),

    /// The upload did not start with a valid header.
    #[error("error receiving: {0}")]
    Receive(#[source] ProtocolError),

    /// The upload destination could not be created.
    #[error("error creating file: {0}")]
    Create(#[source] io::Error),

    /// The upload stream broke after the file was created.
    #[error("error receiving filechunk: {0}")]
    ReceiveChunk(#[source] ProtocolError),

    /// Writing uploaded data failed.
    #[error("error writing to file: {0}")]
    Write(#[source] io::Error),

    /// The upload result could not be sent.
    #[error("error sending response: {0}")]
    SendResult(#[source] ProtocolError),

    /// A partial upload could not be removed after a failure.
    #[error("error removing partial file: {0}")]
    Cleanup(#[source] io::Error),

    /// Walking the served directory failed.
    #[error("error getting list: {0}")]
    Walk(#[source] io::Error),

    /// A list entry could not be sent.
    #[error("error getting list: error sending response: {0}")]
    ListSend(#[source] ProtocolError),
}

impl CallError {
    /// Classification reported to the client.
    pub fn code(&self) -> ErrorCode {
        match self {
            CallError::Open(_)
            | CallError::Read(_)
            | CallError::Send(_)
            | CallError::Create(_)
            | CallError::ReceiveChunk(_)
            | CallError::Write(_)
            | CallError::SendResult(_) => ErrorCode::Internal,
            CallError::Receive(_)
            | CallError::Cleanup(_)
            | CallError::Walk(_)
            | CallError::ListSend(_) => ErrorCode::Unknown,
        }
    }

    /// Whether the call failed because the client abandoned it.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            CallError::Send(ProtocolError::Cancelled)
                | CallError::Receive(ProtocolError::Cancelled)
                | CallError::ReceiveChunk(ProtocolError::Cancelled)
                | CallError::SendResult(ProtocolError::Cancelled)
                | CallError::ListSend(ProtocolError::Cancelled)
        )
    }

    /// Convert the error to a protocol ErrorMessage.
    pub fn to_error_message(&self) -> ErrorMessage {
        ErrorMessage::new(self.code(), self.to_string())
    }
}

/// Handlers for the file service, shared by every call of every connection.
pub struct FileService<S> {
    store: Arc<S>,
    chunk_size: usize,
    span: Span,
}

impl<S> Clone for FileService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            chunk_size: self.chunk_size,
            span: self.span.clone(),
        }
    }
}

impl<S: FileStore> FileService<S> {
    /// Create a service over `store`, reading downloads in `chunk_size` pieces.
    ///
    /// Call spans are created as children of `span`.
    pub fn new(store: Arc<S>, chunk_size: usize, span: Span) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
            span,
        }
    }

    /// Service with the default chunk size and no parent span.
    pub fn with_defaults(store: Arc<S>) -> Self {
        Self::new(store, CHUNK_SIZE, Span::none())
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Bytes per download chunk.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Span for one call, carrying its id, kind and peer.
    pub fn call_span(&self, call_id: CallId, kind: &CallKind, peer: SocketAddr) -> Span {
        tracing::info_span!(
            parent: &self.span,
            "call",
            call_id,
            kind = kind.name(),
            peer = %peer
        )
    }
}
