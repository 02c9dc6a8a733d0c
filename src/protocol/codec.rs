//! Protocol codec for encoding/decoding frames
//!
//! Pure transforms over byte slices. Consuming bytes from a connection
//! buffer is the reassembler's job; nothing here mutates its input.

use bytes::{BufMut, BytesMut};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::{
    unix_timestamp, FrameHeader, OutgoingMessage, SequenceCounter, HEADER_SIZE,
    PROTOCOL_VERSION, SYNC_MAGIC,
};

/// Which body segment a length refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Json,
    Binary,
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Json => f.write_str("json"),
            Segment::Binary => f.write_str("binary"),
        }
    }
}

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Sync mismatch: expected {expected:#010x}, found {found:#010x}", expected = SYNC_MAGIC)]
    Desync { found: u32 },

    #[error("Invalid {segment} segment length: {len} bytes does not fit in 32 bits")]
    InvalidLength { segment: Segment, len: usize },

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: u64, max: usize },
}

impl CodecError {
    /// Whether the error leaves the stream unusable.
    ///
    /// `InvalidLength` only fails the send that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CodecError::Desync { .. } | CodecError::FrameTooLarge { .. }
        )
    }
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Validate segment lengths for the wire, returning them as `u32`
pub fn check_lengths(json_len: usize, binary_len: usize) -> CodecResult<(u32, u32)> {
    let json_len = u32::try_from(json_len).map_err(|_| CodecError::InvalidLength {
        segment: Segment::Json,
        len: json_len,
    })?;
    let binary_len = u32::try_from(binary_len).map_err(|_| CodecError::InvalidLength {
        segment: Segment::Binary,
        len: binary_len,
    })?;
    Ok((json_len, binary_len))
}

/// Encode a frame into `buf`.
///
/// `json_len` and `binary_len` are taken from the segments, not from
/// `header`. Returns the header as written.
pub fn encode(
    header: &FrameHeader,
    json: &[u8],
    binary: &[u8],
    buf: &mut BytesMut,
) -> CodecResult<FrameHeader> {
    let (json_len, binary_len) = check_lengths(json.len(), binary.len())?;

    let header = FrameHeader {
        sync: SYNC_MAGIC,
        json_len,
        binary_len,
        ..*header
    };

    buf.reserve(HEADER_SIZE + json.len() + binary.len());
    header.put(buf);
    buf.put_slice(json);
    buf.put_slice(binary);

    Ok(header)
}

/// Decode the header at the front of `buf`.
///
/// Returns `Ok(None)` when fewer than `HEADER_SIZE` bytes are available.
pub fn try_decode_header(buf: &[u8]) -> CodecResult<Option<FrameHeader>> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let header = FrameHeader::read(&buf[..HEADER_SIZE]);
    if header.sync != SYNC_MAGIC {
        return Err(CodecError::Desync { found: header.sync });
    }

    Ok(Some(header))
}

/// Header plus both segments, in bytes
pub fn frame_total_length(header: &FrameHeader) -> u64 {
    HEADER_SIZE as u64 + header.body_len()
}

/// Reject frames whose declared length exceeds `max` (`0` = no limit)
pub fn check_frame_size(header: &FrameHeader, max: usize) -> CodecResult<()> {
    let size = frame_total_length(header);
    if max != 0 && size > max as u64 {
        return Err(CodecError::FrameTooLarge { size, max });
    }
    Ok(())
}

/// Slice the JSON and binary segments out of a buffer that starts with
/// `header`. Returns `None` until the whole body is present.
pub fn try_decode_body<'a>(buf: &'a [u8], header: &FrameHeader) -> Option<(&'a [u8], &'a [u8])> {
    let total = usize::try_from(frame_total_length(header)).ok()?;
    if buf.len() < total {
        return None;
    }

    let json_end = HEADER_SIZE + header.json_len as usize;
    Some((&buf[HEADER_SIZE..json_end], &buf[json_end..total]))
}

/// Stamps and encodes outgoing messages for one sender
#[derive(Debug, Clone)]
pub struct Encoder {
    version: u8,
    sequence: Arc<SequenceCounter>,
}

impl Encoder {
    pub fn new(version: u8, sequence: Arc<SequenceCounter>) -> Self {
        Self { version, sequence }
    }

    /// Encode a message into a buffer, taking the next sequence number.
    ///
    /// A message rejected for its lengths does not consume a sequence number.
    pub fn encode(&self, message: &OutgoingMessage, buf: &mut BytesMut) -> CodecResult<FrameHeader> {
        check_lengths(message.json.len(), message.binary.len())?;

        let header = message.header(self.version, self.sequence.next(), unix_timestamp());
        encode(&header, &message.json, &message.binary, buf)
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new(PROTOCOL_VERSION, Arc::new(SequenceCounter::default()))
    }
}
