//! Errors raised by the codec and by call streams.

use std::io;

use thiserror::Error;

use crate::messages::ErrorCode;

/// Protocol error type covering all possible failure modes of a call stream.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Encoding
    /// A message could not be encoded.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A payload could not be decoded into an envelope.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Framing
    /// A frame, or its decompressed payload, is larger than allowed.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// A frame did not start with the expected magic.
    #[error("invalid frame magic: expected {expected:#010x}, got {got:#010x}")]
    InvalidFrameMagic {
        /// Expected magic value.
        expected: u32,
        /// Magic found on the wire.
        got: u32,
    },

    /// Peer speaks a protocol version we do not understand.
    #[error("unsupported protocol version: {0}")]
    VersionMismatch(u8),

    // Transport
    /// The connection, or the call's route through it, went away.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Other transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    // Call errors
    /// The call was cancelled by the peer or by connection shutdown.
    #[error("call cancelled")]
    Cancelled,

    /// An upload stream did not start with a transfer header.
    #[error("missing transfer header: {0}")]
    MissingHeader(String),

    /// A message arrived that is not valid at this point of the call.
    #[error("unexpected message: expected {expected}, got {got}")]
    UnexpectedMessage {
        /// What the receiver was waiting for.
        expected: &'static str,
        /// Kind of the message actually received.
        got: &'static str,
    },

    /// The peer terminated the call with an error.
    #[error("remote error ({code}): {message}")]
    Remote {
        /// Coarse classification reported by the peer.
        code: ErrorCode,
        /// Human-readable message reported by the peer.
        message: String,
    },
}

/// Result of a call stream or codec operation.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Self::Deserialization(e.to_string())
    }
}

impl From<io::Error> for ProtocolError {
    fn from(e: io::Error) -> Self {
        let message = e.to_string();
        match e.kind() {
            io::ErrorKind::TimedOut => Self::Timeout(message),
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => Self::ConnectionClosed(message),
            _ => Self::Transport(message),
        }
    }
}
