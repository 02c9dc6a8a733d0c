//! Fixed-size frame header
//!
//! The header is written and read field by field so the wire layout never
//! depends on host struct alignment.

use bytes::{Buf, BufMut};

use super::{PROTOCOL_VERSION, SYNC_MAGIC};

/// Header size: sync(4) + ver(1) + type(1) + reserve(1) + m_pt(1)
/// + json_len(4) + binary_len(4) + sequence(4) + timestamp(4) = 24 bytes
pub const HEADER_SIZE: usize = 24;

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub sync: u32,
    pub ver: u8,
    pub msg_type: u8,
    pub reserve: u8,
    pub m_pt: u8,
    pub json_len: u32,
    pub binary_len: u32,
    pub sequence: u32,
    /// Seconds since the Unix epoch, as seen by the sender
    pub timestamp: u32,
}

impl FrameHeader {
    /// Header with the sync magic and current protocol version; lengths,
    /// sequence and timestamp are zero until the frame is stamped
    pub fn new(msg_type: u8, m_pt: u8) -> Self {
        Self {
            sync: SYNC_MAGIC,
            ver: PROTOCOL_VERSION,
            msg_type,
            reserve: 0,
            m_pt,
            json_len: 0,
            binary_len: 0,
            sequence: 0,
            timestamp: 0,
        }
    }

    /// Length of the JSON and binary segments following the header
    pub fn body_len(&self) -> u64 {
        self.json_len as u64 + self.binary_len as u64
    }

    /// Write the 24 header bytes
    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.sync);
        buf.put_u8(self.ver);
        buf.put_u8(self.msg_type);
        buf.put_u8(self.reserve);
        buf.put_u8(self.m_pt);
        buf.put_u32(self.json_len);
        buf.put_u32(self.binary_len);
        buf.put_u32(self.sequence);
        buf.put_u32(self.timestamp);
    }

    /// Read the header fields from exactly `HEADER_SIZE` bytes.
    ///
    /// Does not validate the sync field; see `codec::try_decode_header`.
    pub fn read(mut bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() >= HEADER_SIZE);
        Self {
            sync: bytes.get_u32(),
            ver: bytes.get_u8(),
            msg_type: bytes.get_u8(),
            reserve: bytes.get_u8(),
            m_pt: bytes.get_u8(),
            json_len: bytes.get_u32(),
            binary_len: bytes.get_u32(),
            sequence: bytes.get_u32(),
            timestamp: bytes.get_u32(),
        }
    }
}

impl Default for FrameHeader {
    fn default() -> Self {
        Self::new(0, 0)
    }
}
