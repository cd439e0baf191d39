//! Frame codec for length-prefixed framing with optional LZ4 compression.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 4 bytes: magic bytes "FSRV"
//! - 4 bytes: payload length (big-endian, includes flags byte)
//! - 1 byte: flags (bit 0 = compressed)
//! - N bytes: payload (possibly LZ4 compressed)
//!
//! # Compression
//!
//! Payloads larger than 1KB are compressed using LZ4 when that makes them
//! smaller. The compressed flag in the frame header indicates whether the
//! payload is compressed.
//!
//! [`FrameCodec`] moves raw frames; [`EnvelopeCodec`] layers MessagePack
//! [`Envelope`] encoding on top and is what connections are framed with.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ProtocolError, Result};
use crate::messages::{Envelope, PROTOCOL_VERSION};

/// Magic bytes identifying a fileserver frame.
pub const FRAME_MAGIC: [u8; 4] = *b"FSRV";

/// Compression threshold in bytes. Payloads larger than this are compressed.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Maximum frame size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame header size: 4 (magic) + 4 (length) + 1 (flags) = 9 bytes.
pub const FRAME_HEADER_SIZE: usize = 9;

/// Magic and length prefix, the part read before the content.
const PREFIX_SIZE: usize = 8;

/// Flags indicating frame properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Flag indicating the payload is LZ4 compressed.
    pub const COMPRESSED: u8 = 0b0000_0001;

    /// Create a new empty flags set.
    #[inline]
    pub fn new() -> Self {
        Self(0)
    }

    /// Create flags from a raw byte value.
    #[inline]
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Get the raw byte value of the flags.
    #[inline]
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// Check if the compressed flag is set.
    #[inline]
    pub fn is_compressed(self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    /// Return a new flags with compressed set or cleared.
    #[inline]
    pub fn with_compressed(self, compressed: bool) -> Self {
        if compressed {
            Self(self.0 | Self::COMPRESSED)
        } else {
            Self(self.0 & !Self::COMPRESSED)
        }
    }
}

/// A decoded frame. The payload is always in uncompressed form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame flags as they appeared on the wire.
    pub flags: FrameFlags,
    /// The payload data.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame with the given payload.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            flags: FrameFlags::new(),
            payload: payload.into(),
        }
    }
}

/// Streaming encoder and decoder for frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// Whether to enable compression for large payloads.
    compression_enabled: bool,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a new frame codec with compression enabled.
    pub fn new() -> Self {
        Self {
            compression_enabled: true,
        }
    }

    /// Create a new frame codec with compression disabled.
    pub fn without_compression() -> Self {
        Self {
            compression_enabled: false,
        }
    }

    fn encode_payload(&self, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
        if payload.len() > MAX_FRAME_SIZE - FRAME_HEADER_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len() + FRAME_HEADER_SIZE,
                max: MAX_FRAME_SIZE,
            });
        }

        let compressed = if self.compression_enabled && payload.len() > COMPRESSION_THRESHOLD {
            let compressed = lz4_flex::compress_prepend_size(payload);
            (compressed.len() < payload.len()).then_some(compressed)
        } else {
            None
        };

        let (body, flags) = match &compressed {
            Some(compressed) => (compressed.as_slice(), FrameFlags::new().with_compressed(true)),
            None => (payload, FrameFlags::new()),
        };

        let content_len = 1 + body.len();
        dst.reserve(PREFIX_SIZE + content_len);
        dst.put_slice(&FRAME_MAGIC);
        dst.put_u32(content_len as u32);
        dst.put_u8(flags.as_byte());
        dst.put_slice(body);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < PREFIX_SIZE {
            return Ok(None);
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&src[..4]);
        if magic != FRAME_MAGIC {
            return Err(ProtocolError::InvalidFrameMagic {
                expected: u32::from_be_bytes(FRAME_MAGIC),
                got: u32::from_be_bytes(magic),
            });
        }

        let content_len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if PREFIX_SIZE + content_len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: PREFIX_SIZE + content_len,
                max: MAX_FRAME_SIZE,
            });
        }
        if content_len < 1 {
            return Err(ProtocolError::Deserialization(
                "invalid frame: content length must be at least 1 for flags byte".to_string(),
            ));
        }

        if src.len() < PREFIX_SIZE + content_len {
            src.reserve(PREFIX_SIZE + content_len - src.len());
            return Ok(None);
        }

        src.advance(PREFIX_SIZE);
        let mut content = src.split_to(content_len);
        let flags = FrameFlags::from_byte(content.get_u8());

        let payload = if flags.is_compressed() {
            if content.len() < 4 {
                return Err(ProtocolError::Deserialization(
                    "failed to decompress payload: missing size prefix".to_string(),
                ));
            }
            let declared =
                u32::from_le_bytes([content[0], content[1], content[2], content[3]]) as usize;
            if declared > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge {
                    size: declared,
                    max: MAX_FRAME_SIZE,
                });
            }
            let decompressed = lz4_flex::decompress_size_prepended(&content).map_err(|e| {
                ProtocolError::Deserialization(format!("failed to decompress payload: {}", e))
            })?;
            Bytes::from(decompressed)
        } else {
            content.freeze()
        };

        Ok(Some(Frame { flags, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        self.encode_payload(&frame.payload, dst)
    }
}

/// Codec reading and writing whole [`Envelope`]s.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeCodec {
    frames: FrameCodec,
}

impl EnvelopeCodec {
    /// Create an envelope codec with compression enabled.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>> {
        let Some(frame) = self.frames.decode(src)? else {
            return Ok(None);
        };
        let envelope = Envelope::from_msgpack(&frame.payload)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch(envelope.version));
        }
        Ok(Some(envelope))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, envelope: Envelope, dst: &mut BytesMut) -> Result<()> {
        let bytes = envelope.to_msgpack()?;
        self.frames.encode_payload(&bytes, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{FileChunk, Message};

    fn encode(codec: &mut FrameCodec, payload: Vec<u8>) -> BytesMut {
        let mut buf = BytesMut::new();
        codec.encode(Frame::new(payload), &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_frame_flags() {
        let flags = FrameFlags::new();
        assert_eq!(flags.as_byte(), 0);
        assert!(!flags.is_compressed());

        let flags = flags.with_compressed(true);
        assert!(flags.is_compressed());
        assert_eq!(flags.as_byte(), 0b0000_0001);
        assert!(!flags.with_compressed(false).is_compressed());

        assert!(!FrameFlags::from_byte(0b1111_1110).is_compressed());
    }

    #[test]
    fn test_frame_header_format() {
        let mut codec = FrameCodec::new();
        let buf = encode(&mut codec, vec![0xDE, 0xAD, 0xBE, 0xEF]);

        assert_eq!(&buf[0..4], b"FSRV");
        // 1 byte flags + 4 byte payload
        assert_eq!(u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]), 5);
        assert_eq!(buf[8], 0);
        assert_eq!(&buf[9..], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_decode_empty_payload() {
        let mut codec = FrameCodec::new();
        let mut buf = encode(&mut codec, Vec::new());

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(frame.payload.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_compression_threshold() {
        let mut codec = FrameCodec::new();

        let buf = encode(&mut codec, vec![0u8; COMPRESSION_THRESHOLD]);
        assert_eq!(buf[8] & 0x01, 0x00, "payload at threshold should not be compressed");

        let mut buf = encode(&mut codec, vec![0u8; COMPRESSION_THRESHOLD + 1]);
        assert_eq!(buf[8] & 0x01, 0x01, "payload above threshold should be compressed");

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(frame.flags.is_compressed());
        assert_eq!(frame.payload.len(), COMPRESSION_THRESHOLD + 1);
    }

    #[test]
    fn test_encode_without_compression() {
        let mut codec = FrameCodec::without_compression();
        let payload: Vec<u8> = (0..2048).map(|i| (i % 256) as u8).collect();
        let mut buf = encode(&mut codec, payload.clone());

        assert_eq!(buf[8] & 0x01, 0x00);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame.payload[..], &payload[..]);
    }

    #[test]
    fn test_partial_frame_waits_for_more_data() {
        let mut codec = FrameCodec::new();
        let full = encode(&mut codec, vec![1, 2, 3, 4, 5]);

        for split in 0..full.len() {
            let mut partial = BytesMut::from(&full[..split]);
            assert!(
                codec.decode(&mut partial).unwrap().is_none(),
                "should wait for data (len={})",
                split
            );
        }

        let mut buf = full.clone();
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame.payload[..], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let mut codec = FrameCodec::new();
        let mut buf = encode(&mut codec, vec![1, 2, 3]);
        buf.extend_from_slice(&encode(&mut codec, vec![4, 5, 6, 7]));

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&first.payload[..], &[1, 2, 3]);
        assert_eq!(&second.payload[..], &[4, 5, 6, 7]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_invalid_magic() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"BAD!"[..]);
        buf.put_u32(5);
        buf.put_u8(0);
        buf.put_slice(&[1, 2, 3, 4]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFrameMagic { .. }));
    }

    #[test]
    fn test_encode_frame_too_large() {
        let mut codec = FrameCodec::without_compression();
        let mut buf = BytesMut::new();
        let err = codec
            .encode(Frame::new(vec![0u8; MAX_FRAME_SIZE]), &mut buf)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_oversized_length() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_slice(&FRAME_MAGIC);
        buf.put_u32(MAX_FRAME_SIZE as u32 + 1);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_decode_zero_content_length() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_slice(&FRAME_MAGIC);
        buf.put_u32(0);

        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_decode_corrupted_compressed_data() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_slice(&FRAME_MAGIC);
        buf.put_u32(10);
        buf.put_u8(FrameFlags::COMPRESSED);
        // Declares 16 decompressed bytes followed by garbage.
        buf.put_slice(&[0x10, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(err.to_string().contains("decompress"));
    }

    #[test]
    fn test_decode_compressed_size_bomb() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_slice(&FRAME_MAGIC);
        buf.put_u32(6);
        buf.put_u8(FrameFlags::COMPRESSED);
        buf.put_u32_le(u32::MAX);
        buf.put_u8(0);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_envelope_codec() {
        let mut codec = EnvelopeCodec::new();
        let envelope = Envelope::new(7, Message::Chunk(FileChunk::new(vec![9u8; 4096])));

        let mut buf = BytesMut::new();
        codec.encode(envelope.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_envelope_codec_rejects_unknown_version() {
        let mut codec = EnvelopeCodec::new();
        let mut envelope = Envelope::new(1, Message::end());
        envelope.version = PROTOCOL_VERSION + 1;

        let mut buf = BytesMut::new();
        codec.encode(envelope, &mut buf).unwrap();
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::VersionMismatch(v) if v == PROTOCOL_VERSION + 1));
    }
}
