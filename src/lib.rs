//! # avdp
//!
//! Framed JSON + binary messaging over raw TCP.
//!
//! Every message travels as a 24-byte big-endian header followed by a JSON
//! segment and an opaque binary segment:
//!
//! - [`protocol`]: header layout, codec, stream reassembly, sequence numbers
//! - [`network`]: client and server roles built on per-connection tasks
//! - [`config`]: TOML configuration
//!
//! The `avdp` binary drives either role from the terminal.

pub mod config;
pub mod network;
pub mod protocol;
