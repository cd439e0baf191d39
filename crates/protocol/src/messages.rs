//! Protocol message definitions for the file service.
//!
//! Every frame on the wire carries one [`Envelope`]: a protocol version, the
//! id of the call the message belongs to, and the [`Message`] itself. All
//! messages are serialized using MessagePack.
//!
//! A call is opened with [`Message::Open`] and its shape follows from the
//! [`CallKind`]:
//!
//! | Call      | Client sends                               | Server sends                      |
//! |-----------|--------------------------------------------|-----------------------------------|
//! | Download  | `Open`                                     | `Chunk`*, `End`                   |
//! | Upload    | `Open`, `Upload(Header)`, `Upload(Chunk)`*, `End` | `UploadResult`, `End`      |
//! | ListFiles | `Open`                                     | `Entry`*, `End`                   |
//!
//! Either side may terminate a call early: the server with [`Message::Error`],
//! the client with [`Message::Cancel`].

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Identifier of a call, unique per connection and chosen by the client.
pub type CallId = u64;

/// Envelope wrapper for all protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version for compatibility checking.
    pub version: u8,
    /// Call this message belongs to.
    pub call_id: CallId,
    /// The actual message payload.
    pub payload: Message,
}

impl Envelope {
    /// Create a new envelope with the current protocol version.
    pub fn new(call_id: CallId, payload: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            call_id,
            payload,
        }
    }

    /// Serialize the envelope to MessagePack bytes.
    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    /// Deserialize an envelope from MessagePack bytes.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// Top-level message enum containing all message types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    /// Open a new call (client to server).
    Open(CallKind),
    /// Upload stream message (client to server).
    Upload(UploadMessage),
    /// Downloaded file data (server to client).
    Chunk(FileChunk),
    /// Final result of an upload (server to client).
    UploadResult(TransferResult),
    /// One file of a listing (server to client).
    Entry(ListEntry),
    /// The sender will not send anything more on this call.
    End(StreamEnd),
    /// Client abandons the call.
    Cancel(CallCancel),
    /// Server terminates the call with an error.
    Error(ErrorMessage),
}

impl Message {
    /// Short name of the message kind, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Open(_) => "open",
            Message::Upload(UploadMessage::Header(_)) => "upload header",
            Message::Upload(UploadMessage::Chunk(_)) => "upload chunk",
            Message::Chunk(_) => "file chunk",
            Message::UploadResult(_) => "upload result",
            Message::Entry(_) => "list entry",
            Message::End(_) => "end of stream",
            Message::Cancel(_) => "cancel",
            Message::Error(_) => "error",
        }
    }

    /// Shorthand for an end-of-stream message.
    pub fn end() -> Self {
        Message::End(StreamEnd {})
    }

    /// Shorthand for a cancel message.
    pub fn cancel() -> Self {
        Message::Cancel(CallCancel {})
    }
}

/// The operation requested when a call is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallKind {
    /// Stream a file from the server.
    Download(DownloadRequest),
    /// Stream a file to the server.
    Upload(UploadRequest),
    /// Stream the server's file listing.
    ListFiles(ListRequest),
}

impl CallKind {
    /// Short name of the call, used for span fields.
    pub fn name(&self) -> &'static str {
        match self {
            CallKind::Download(_) => "download",
            CallKind::Upload(_) => "upload",
            CallKind::ListFiles(_) => "list_files",
        }
    }
}

// ============================================================================
// Call payloads
// ============================================================================

/// Request to download a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Path relative to the service root.
    pub filename: String,
}

/// Request to open an upload. The file name travels in the [`TransferHeader`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {}

/// Request to list all files below the service root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRequest {}

/// A slice of file bytes. Size is bounded by the sender's read buffer only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    /// The chunk data.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl FileChunk {
    /// Create a chunk from raw bytes.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }

    /// Number of payload bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the chunk carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Identifies the destination of an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferHeader {
    /// Path relative to the service root.
    pub filename: String,
}

/// One message of an upload stream: a header first, then chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadMessage {
    /// Names the destination file.
    Header(TransferHeader),
    /// File data.
    Chunk(FileChunk),
}

/// Result of an upload as seen by the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    /// Total bytes written.
    pub size: u64,
}

/// A file found below the service root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntry {
    /// Path relative to the service root, `/`-separated.
    pub filename: String,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub mod_time: Timestamp,
}

/// Marks the end of one direction of a call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEnd {}

/// Asks the server to abandon a call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallCancel {}

/// A point in time as seconds and nanoseconds since the Unix epoch.
///
/// `nanos` is always in `0..1_000_000_000`, also for times before the epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    /// Whole seconds since the epoch.
    pub seconds: i64,
    /// Sub-second part.
    pub nanos: u32,
}

impl Timestamp {
    /// Convert back to a [`SystemTime`].
    ///
    /// Returns `None` when the platform cannot represent the time. Peers
    /// may send any value, so callers must not assume it fits.
    pub fn to_system_time(self) -> Option<SystemTime> {
        let whole = Duration::from_secs(self.seconds.unsigned_abs());
        let base = if self.seconds >= 0 {
            UNIX_EPOCH.checked_add(whole)?
        } else {
            UNIX_EPOCH.checked_sub(whole)?
        };
        base.checked_add(Duration::from_nanos(u64::from(self.nanos)))
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(since) => Self {
                seconds: since.as_secs() as i64,
                nanos: since.subsec_nanos(),
            },
            Err(err) => {
                let before = err.duration();
                let mut seconds = -(before.as_secs() as i64);
                let mut nanos = before.subsec_nanos();
                if nanos > 0 {
                    seconds -= 1;
                    nanos = 1_000_000_000 - nanos;
                }
                Self { seconds, nanos }
            }
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Terminates a call with an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Coarse classification.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
}

impl ErrorMessage {
    /// Create an error message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Error classes reported to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Unknown or unclassified failure.
    Unknown,
    /// Server-side failure.
    Internal,
    /// The request violated the call protocol.
    InvalidRequest,
    /// The server is shutting down and takes no new calls.
    Unavailable,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Unknown => "unknown",
            ErrorCode::Internal => "internal",
            ErrorCode::InvalidRequest => "invalid request",
            ErrorCode::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}
