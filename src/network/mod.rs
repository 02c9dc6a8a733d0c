//! Network module - Handles TCP communication between endpoints
//!
//! Provides:
//! - Server for accepting incoming connections
//! - Client for connecting to servers
//! - Connection management and frame routing

mod client;
mod connection;
mod endpoint;
mod server;

pub use client::*;
pub use connection::*;
pub use endpoint::*;
pub use server::*;

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::{DesyncPolicy, DEFAULT_MAX_FRAME_SIZE, DEFAULT_PORT, PROTOCOL_VERSION};

/// Which outbound frames share a sequence counter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceScope {
    /// One counter for every frame the process sends, across connections
    #[default]
    Process,
    /// A fresh counter per connection
    Connection,
}

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Port to listen on or connect to
    pub port: u16,
    /// Interface the server binds to
    pub bind_address: String,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Close a connection after this long without inbound bytes (0 = never)
    pub idle_timeout_ms: u64,
    /// Version stamped into outgoing headers
    pub protocol_version: u8,
    /// Maximum frame size, header included (0 = unlimited)
    pub max_frame_size: usize,
    /// Handling of sync mismatches
    pub desync_policy: DesyncPolicy,
    /// First sequence number sent
    pub sequence_start: u32,
    /// Sequence counter sharing
    pub sequence_scope: SequenceScope,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_address: "0.0.0.0".to_string(),
            connect_timeout_ms: 5000,
            idle_timeout_ms: 0,
            protocol_version: PROTOCOL_VERSION,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            desync_policy: DesyncPolicy::Close,
            sequence_start: 1,
            sequence_scope: SequenceScope::Process,
        }
    }
}

impl NetworkConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_bind_address(mut self, bind_address: impl Into<String>) -> Self {
        self.bind_address = bind_address.into();
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn with_desync_policy(mut self, policy: DesyncPolicy) -> Self {
        self.desync_policy = policy;
        self
    }

    pub fn with_sequence(mut self, start: u32, scope: SequenceScope) -> Self {
        self.sequence_start = start;
        self.sequence_scope = scope;
        self
    }

    pub fn with_idle_timeout_ms(mut self, idle_timeout_ms: u64) -> Self {
        self.idle_timeout_ms = idle_timeout_ms;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let mut addrs = lookup_host((host, port)).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
