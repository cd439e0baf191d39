//! # Fileserver Protocol Library
//!
//! This crate provides the wire protocol shared by the fileserver daemon and
//! its client.
//!
//! ## Overview
//!
//! - **Message Definitions**: envelopes, call kinds and stream messages for
//!   Download, Upload and ListFiles
//! - **Frame Codec**: length-prefixed framing with optional LZ4 compression
//! - **Call Streams**: per-call sender and receiver halves over a multiplexed
//!   connection, with a typed upload layer
//! - **Chunking**: fixed-size file chunking
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     Call streams (Download/Upload/List) │
//! ├─────────────────────────────────────────┤
//! │          Application Messages           │  MessagePack-encoded
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  Length-prefixed, LZ4
//! ├─────────────────────────────────────────┤
//! │                 TCP                     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use bytes::BytesMut;
//! use protocol::messages::{CallKind, DownloadRequest};
//! use protocol::{Envelope, EnvelopeCodec, Message};
//! use tokio_util::codec::{Decoder, Encoder};
//!
//! let open = Message::Open(CallKind::Download(DownloadRequest {
//!     filename: "report.pdf".to_string(),
//! }));
//!
//! let mut codec = EnvelopeCodec::new();
//! let mut buf = BytesMut::new();
//! codec.encode(Envelope::new(1, open.clone()), &mut buf).unwrap();
//!
//! let decoded = codec.decode(&mut buf).unwrap().unwrap();
//! assert_eq!(decoded.payload, open);
//! ```

pub mod channel;
pub mod chunk;
pub mod error;
pub mod framing;
pub mod messages;

pub use channel::{inbound, CallReceiver, CallSender, UploadSink, UploadStream};
pub use chunk::{ChunkReader, CHUNK_SIZE};
pub use error::{ProtocolError, Result};
pub use framing::{
    EnvelopeCodec, Frame, FrameCodec, FrameFlags, COMPRESSION_THRESHOLD, FRAME_HEADER_SIZE,
    FRAME_MAGIC, MAX_FRAME_SIZE,
};
pub use messages::{CallId, CallKind, Envelope, ErrorCode, ErrorMessage, Message, PROTOCOL_VERSION};
