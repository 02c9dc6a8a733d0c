//! Protocol module - Defines the AVDP wire format
//!
//! Every frame is a fixed 24-byte header followed by a JSON segment and a
//! raw binary segment. All header integers are big-endian:
//!
//! ```text
//! offset 0   sync        u32   0x41564450 ("AVDP")
//! offset 4   ver         u8
//! offset 5   type        u8
//! offset 6   reserve     u8
//! offset 7   m_pt        u8
//! offset 8   json_len    u32
//! offset 12  binary_len  u32
//! offset 16  sequence    u32
//! offset 20  timestamp   u32
//! offset 24  json_len bytes of JSON, then binary_len bytes of binary
//! ```

mod codec;
mod header;
mod message;
mod reassembler;
mod sequence;

pub use codec::*;
pub use header::*;
pub use message::*;
pub use reassembler::*;
pub use sequence::*;

/// Protocol version stamped into outgoing frames by default
pub const PROTOCOL_VERSION: u8 = 1;

/// Default port for AVDP communication
pub const DEFAULT_PORT: u16 = 9000;

/// Sync magic marking the start of every frame ("AVDP")
pub const SYNC_MAGIC: u32 = 0x4156_4450;

/// Default cap on a single frame, header included (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
