//! Per-call message streams.
//!
//! A connection multiplexes many calls over one framed stream. Each call sees
//! its own pair of halves: a [`CallSender`] that wraps outgoing messages in
//! envelopes tagged with the call id, and a [`CallReceiver`] that yields the
//! messages routed to the call and turns terminal messages into results.
//!
//! Uploads add a typed layer on top: [`UploadSink`] can only send the header
//! once and before any chunk, and [`UploadStream::accept`] rejects streams
//! that do not start with one.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{ProtocolError, Result};
use crate::messages::{
    CallId, Envelope, ErrorMessage, FileChunk, Message, TransferHeader, UploadMessage,
};

/// Capacity of a call's inbound queue.
pub const CALL_QUEUE_DEPTH: usize = 32;

/// Sending half of a call.
#[derive(Debug, Clone)]
pub struct CallSender {
    call_id: CallId,
    tx: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
}

impl CallSender {
    /// Create a sender writing to a connection's outbound queue.
    pub fn new(call_id: CallId, tx: mpsc::Sender<Envelope>, cancel: CancellationToken) -> Self {
        Self {
            call_id,
            tx,
            cancel,
        }
    }

    /// Id of the call this sender belongs to.
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Token cancelled when the call is abandoned.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Send one message on the call.
    ///
    /// Fails with [`ProtocolError::Cancelled`] once the call is cancelled,
    /// even if the send is blocked on a full queue.
    pub async fn send(&self, message: Message) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ProtocolError::Cancelled);
        }
        let envelope = Envelope::new(self.call_id, message);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ProtocolError::Cancelled),
            sent = self.tx.send(envelope) => sent.map_err(|_| {
                ProtocolError::ConnectionClosed("outbound queue closed".to_string())
            }),
        }
    }

    /// Signal that nothing more will be sent on this call.
    pub async fn close_send(&self) -> Result<()> {
        self.send(Message::end()).await
    }

    /// Terminate the call with an error.
    pub async fn fail(&self, error: ErrorMessage) -> Result<()> {
        self.send(Message::Error(error)).await
    }
}

/// Receiving half of a call.
#[derive(Debug)]
pub struct CallReceiver {
    rx: mpsc::Receiver<Message>,
    finished: bool,
}

/// Create the routing handle and receiving half for a new call.
pub fn inbound() -> (mpsc::Sender<Message>, CallReceiver) {
    let (tx, rx) = mpsc::channel(CALL_QUEUE_DEPTH);
    (
        tx,
        CallReceiver {
            rx,
            finished: false,
        },
    )
}

impl CallReceiver {
    /// Receive the next data message.
    ///
    /// Returns `Ok(None)` once the peer has closed its side, a remote error
    /// for [`Message::Error`], and [`ProtocolError::Cancelled`] for
    /// [`Message::Cancel`]. Losing the routing handle without either is a
    /// closed connection.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        if self.finished {
            return Ok(None);
        }
        let Some(message) = self.rx.recv().await else {
            self.finished = true;
            return Err(ProtocolError::ConnectionClosed(
                "call stream ended without end of stream".to_string(),
            ));
        };
        match message {
            Message::End(_) => {
                self.finished = true;
                Ok(None)
            }
            Message::Error(err) => {
                self.finished = true;
                Err(ProtocolError::Remote {
                    code: err.code,
                    message: err.message,
                })
            }
            Message::Cancel(_) => {
                self.finished = true;
                Err(ProtocolError::Cancelled)
            }
            other => Ok(Some(other)),
        }
    }

    /// Whether a terminal message has been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Server view of an upload: a header followed by chunks.
#[derive(Debug)]
pub struct UploadStream {
    inner: CallReceiver,
}

impl UploadStream {
    /// Read the transfer header that must open every upload.
    pub async fn accept(mut inner: CallReceiver) -> Result<(TransferHeader, Self)> {
        match inner.recv().await? {
            Some(Message::Upload(UploadMessage::Header(header))) => Ok((header, Self { inner })),
            Some(Message::Upload(UploadMessage::Chunk(_))) => Err(ProtocolError::MissingHeader(
                "first message was a chunk".to_string(),
            )),
            Some(other) => Err(ProtocolError::UnexpectedMessage {
                expected: "upload header",
                got: other.kind(),
            }),
            None => Err(ProtocolError::MissingHeader(
                "stream ended before header".to_string(),
            )),
        }
    }

    /// Next chunk of file data, or `None` once the client closed its side.
    pub async fn next_chunk(&mut self) -> Result<Option<FileChunk>> {
        match self.inner.recv().await? {
            Some(Message::Upload(UploadMessage::Chunk(chunk))) => Ok(Some(chunk)),
            Some(other) => Err(ProtocolError::UnexpectedMessage {
                expected: "upload chunk",
                got: other.kind(),
            }),
            None => Ok(None),
        }
    }
}

/// Client view of an upload. The header is sent on construction.
#[derive(Debug)]
pub struct UploadSink {
    sender: CallSender,
}

impl UploadSink {
    /// Send the transfer header and return a sink for the file data.
    pub async fn begin(sender: CallSender, header: TransferHeader) -> Result<Self> {
        sender
            .send(Message::Upload(UploadMessage::Header(header)))
            .await?;
        Ok(Self { sender })
    }

    /// Send one chunk of file data.
    pub async fn send_chunk(&self, data: &[u8]) -> Result<()> {
        self.sender
            .send(Message::Upload(UploadMessage::Chunk(FileChunk::new(data))))
            .await
    }

    /// Close the client side of the upload.
    pub async fn finish(self) -> Result<()> {
        self.sender.close_send().await
    }
}
