//! Common interface over the client and server roles

use async_trait::async_trait;
use std::fmt;

use crate::protocol::OutgoingMessage;

/// Which side of the protocol an endpoint plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

/// Something that can push messages to its peer(s)
#[async_trait]
pub trait Endpoint: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn role(&self) -> Role;

    /// Queue a message for every connected peer.
    ///
    /// Returns how many connections it was queued for.
    async fn send(&self, message: OutgoingMessage) -> Result<usize, Self::Error>;

    /// Close all connections and stop
    async fn shutdown(&mut self) -> Result<(), Self::Error>;

    /// Whether the endpoint currently has somewhere to send
    async fn is_active(&self) -> bool;
}
