//! Protocol message definitions
//!
//! `Message` is a frame decoded off the wire; `OutgoingMessage` is what the
//! application hands to a connection before the sender stamps version,
//! sequence and timestamp into it.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::FrameHeader;

/// Message type used when the caller does not pick one
pub const DEFAULT_MESSAGE_TYPE: u8 = 1;

/// A complete frame received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Header exactly as it arrived
    pub header: FrameHeader,
    /// JSON segment (`header.json_len` bytes)
    pub json: Bytes,
    /// Binary segment (`header.binary_len` bytes)
    pub binary: Bytes,
}

impl Message {
    pub fn new(header: FrameHeader, json: Bytes, binary: Bytes) -> Self {
        Self {
            header,
            json,
            binary,
        }
    }

    pub fn sequence(&self) -> u32 {
        self.header.sequence
    }

    pub fn msg_type(&self) -> u8 {
        self.header.msg_type
    }

    /// JSON segment as text
    pub fn json_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.json)
    }

    /// Parse the JSON segment into `T`
    pub fn json_value<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.json)
    }

    /// Total bytes this message occupied on the wire
    pub fn wire_len(&self) -> usize {
        super::HEADER_SIZE + self.json.len() + self.binary.len()
    }
}

/// Application content queued for sending
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub msg_type: u8,
    pub m_pt: u8,
    pub reserve: u8,
    pub json: Bytes,
    pub binary: Bytes,
}

impl OutgoingMessage {
    /// Message carrying `json` verbatim and no binary segment
    pub fn new(json: impl Into<Bytes>) -> Self {
        Self {
            msg_type: DEFAULT_MESSAGE_TYPE,
            m_pt: 0,
            reserve: 0,
            json: json.into(),
            binary: Bytes::new(),
        }
    }

    /// Serialize `value` into the JSON segment
    pub fn from_json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    pub fn with_type(mut self, msg_type: u8) -> Self {
        self.msg_type = msg_type;
        self
    }

    pub fn with_m_pt(mut self, m_pt: u8) -> Self {
        self.m_pt = m_pt;
        self
    }

    pub fn with_reserve(mut self, reserve: u8) -> Self {
        self.reserve = reserve;
        self
    }

    pub fn with_binary(mut self, binary: impl Into<Bytes>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Header for this message as sent with the given version, sequence and
    /// timestamp. Segment lengths are filled in by the encoder.
    pub fn header(&self, ver: u8, sequence: u32, timestamp: u32) -> FrameHeader {
        FrameHeader {
            ver,
            reserve: self.reserve,
            sequence,
            timestamp,
            ..FrameHeader::new(self.msg_type, self.m_pt)
        }
    }
}

/// Current time as whole seconds since the Unix epoch, truncated to 32 bits
pub fn unix_timestamp() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
