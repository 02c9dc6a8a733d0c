//! Connection handling for AVDP
//!
//! Manages individual peer connections, including:
//! - Frame encoding and stream reassembly
//! - Idle read timeouts
//! - Connection state management

use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::NetworkConfig;
use crate::protocol::{
    check_lengths, CodecError, Encoder, FrameHeader, Message, OutgoingMessage, Reassembler,
};

/// Size of a single socket read
const READ_CHUNK_SIZE: usize = 8192;

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Connection closed")]
    Closed,

    #[error("Connection closed mid-frame with {buffered} bytes buffered")]
    Truncated { buffered: usize },

    #[error("Connection timeout")]
    Timeout,

    #[error("Send channel closed")]
    SendChannelClosed,
}

impl ConnectionError {
    /// Whether the connection can keep going after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ConnectionError::Protocol(e) if !e.is_fatal())
    }
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// TCP connect in progress
    Connecting,
    /// Established; frames may be exchanged
    Connected,
    /// Graceful shutdown initiated by either side
    Closing,
    /// Framing or transport failure
    Failed,
    /// Terminal; buffers released
    Closed,
}

/// Represents a connection to a remote AVDP endpoint
pub struct Connection<S = TcpStream> {
    /// Remote peer address
    remote_addr: SocketAddr,
    /// The byte stream
    stream: S,
    /// Outgoing frame encoder
    encoder: Encoder,
    /// Inbound connection buffer
    reassembler: Reassembler,
    /// Write buffer
    write_buf: BytesMut,
    /// Connection state
    state: ConnectionState,
    /// Close after this long without inbound bytes
    idle_timeout: Option<Duration>,
    /// Statistics
    stats: ConnectionStats,
}

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Frames sent
    pub messages_sent: u64,
    /// Frames received
    pub messages_received: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an established stream
    pub fn new(stream: S, remote_addr: SocketAddr, encoder: Encoder, config: &NetworkConfig) -> Self {
        Self {
            remote_addr,
            stream,
            encoder,
            reassembler: Reassembler::with_limits(config.max_frame_size, config.desync_policy),
            write_buf: BytesMut::with_capacity(4096),
            state: ConnectionState::Connected,
            idle_timeout: config.idle_timeout(),
            stats: ConnectionStats::default(),
        }
    }

    /// Get the remote address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Get connection statistics
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Encode and write one frame, returning the header that went out
    pub async fn send(&mut self, message: &OutgoingMessage) -> ConnectionResult<FrameHeader> {
        if self.state != ConnectionState::Connected {
            return Err(ConnectionError::Closed);
        }

        self.write_buf.clear();
        let header = self.encoder.encode(message, &mut self.write_buf)?;

        if let Err(e) = self.write_frame().await {
            self.state = ConnectionState::Failed;
            return Err(e.into());
        }

        self.stats.messages_sent += 1;
        self.stats.bytes_sent += self.write_buf.len() as u64;

        tracing::debug!(
            "Sent frame seq={} type={} ({} bytes) to {}",
            header.sequence,
            header.msg_type,
            self.write_buf.len(),
            self.remote_addr
        );

        Ok(header)
    }

    async fn write_frame(&mut self) -> std::io::Result<()> {
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await
    }

    /// Receive the next complete message.
    ///
    /// Returns `Ok(None)` when the peer closed cleanly between frames.
    pub async fn recv(&mut self) -> ConnectionResult<Option<Message>> {
        loop {
            // Drain what is already buffered before touching the socket
            match self.reassembler.next_message() {
                Ok(Some(message)) => {
                    self.stats.messages_received += 1;
                    tracing::debug!(
                        "Received frame seq={} type={} ({} bytes) from {}",
                        message.sequence(),
                        message.msg_type(),
                        message.wire_len(),
                        self.remote_addr
                    );
                    return Ok(Some(message));
                }
                Ok(None) => {}
                Err(e) => {
                    self.state = ConnectionState::Failed;
                    return Err(e.into());
                }
            }

            // Read straight into the reassembly buffer
            let idle_timeout = self.idle_timeout;
            let buf = self.reassembler.read_buffer(READ_CHUNK_SIZE);
            let result = match idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, self.stream.read_buf(buf)).await {
                    Ok(result) => result.map_err(ConnectionError::from),
                    Err(_) => Err(ConnectionError::Timeout),
                },
                None => self.stream.read_buf(buf).await.map_err(ConnectionError::from),
            };
            let n = match result {
                Ok(n) => n,
                Err(e) => {
                    self.state = ConnectionState::Failed;
                    return Err(e);
                }
            };

            if n == 0 {
                let buffered = self.reassembler.buffered();
                if buffered == 0 {
                    self.state = ConnectionState::Closing;
                    return Ok(None); // Clean close
                }
                self.state = ConnectionState::Failed;
                return Err(ConnectionError::Truncated { buffered });
            }

            self.stats.bytes_received += n as u64;
        }
    }

    /// Shut down the write half and mark the connection closed.
    ///
    /// A connection that already failed is closed without a graceful
    /// shutdown attempt.
    pub async fn close(&mut self) -> ConnectionResult<()> {
        let graceful = matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Closing
        );
        self.state = ConnectionState::Closing;

        let result = if graceful {
            self.stream.shutdown().await
        } else {
            Ok(())
        };

        let skipped = self.reassembler.skipped_bytes();
        if skipped > 0 {
            tracing::warn!(
                "Discarded {} unframed bytes from {} while resynchronizing",
                skipped,
                self.remote_addr
            );
        }

        self.state = ConnectionState::Closed;
        self.reassembler.clear();
        result.map_err(ConnectionError::from)
    }

    /// Check if the connection is still active
    pub fn is_active(&self) -> bool {
        matches!(self.state, ConnectionState::Connected)
    }
}

/// Work queued for a connection's task
#[derive(Debug)]
pub enum Outbound {
    Message(OutgoingMessage),
    Close,
}

/// A handle for sending messages to a connection
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    sender: mpsc::Sender<Outbound>,
    remote_addr: SocketAddr,
    connected: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::Sender<Outbound>, remote_addr: SocketAddr) -> Self {
        Self {
            sender,
            remote_addr,
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Queue a message for this connection.
    ///
    /// Lengths are checked here so an unrepresentable message fails the
    /// caller without reaching the connection.
    pub async fn send(&self, message: OutgoingMessage) -> Result<(), ConnectionError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }

        check_lengths(message.json.len(), message.binary.len())?;

        self.sender
            .send(Outbound::Message(message))
            .await
            .map_err(|_| ConnectionError::SendChannelClosed)
    }

    /// Ask the connection task to close gracefully
    pub async fn close(&self) -> Result<(), ConnectionError> {
        self.sender
            .send(Outbound::Close)
            .await
            .map_err(|_| ConnectionError::SendChannelClosed)
    }

    /// Check if the connection is still active
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Mark the connection as disconnected
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}
