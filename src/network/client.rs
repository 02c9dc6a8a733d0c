//! AVDP Client
//!
//! Holds a single outbound connection, sends request frames and forwards
//! every reassembled message to the event channel. A lost connection is
//! reported once and never re-established automatically.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};

use super::connection::{
    Connection, ConnectionError, ConnectionHandle, ConnectionState, Outbound,
};
use super::{Endpoint, NetworkConfig, Role};
use crate::protocol::{Encoder, Message, OutgoingMessage, SequenceCounter};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Connection timeout")]
    Timeout,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Events emitted by the client
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Successfully connected to server
    Connected { server_addr: SocketAddr },
    /// Connection ended; `failed` is set for errors rather than a clean close
    Disconnected { reason: String, failed: bool },
    /// Received a message from the server
    MessageReceived { message: Message },
    /// A send was rejected but the connection is still up
    Error { message: String },
}

/// AVDP Client
pub struct Client {
    /// Client configuration
    config: NetworkConfig,
    /// Current state
    state: Arc<RwLock<ConnectionState>>,
    /// Event sender
    event_tx: mpsc::Sender<ClientEvent>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    /// Connection handle for sending messages
    connection_handle: Arc<RwLock<Option<ConnectionHandle>>>,
}

impl Client {
    /// Create a new client
    pub fn new(config: NetworkConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            config,
            state: Arc::new(RwLock::new(ConnectionState::Closed)),
            event_tx,
            event_rx: Some(event_rx),
            connection_handle: Arc::new(RwLock::new(None)),
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to a server by address
    pub async fn connect(&self, server_addr: SocketAddr) -> ClientResult<()> {
        {
            let mut state = self.state.write().await;
            if !matches!(*state, ConnectionState::Closed | ConnectionState::Failed) {
                return Err(ClientError::AlreadyConnected);
            }
            *state = ConnectionState::Connecting;
        }

        tracing::info!("Connecting to {}", server_addr);

        // Connect with timeout
        let stream = match tokio::time::timeout(
            self.config.connect_timeout(),
            TcpStream::connect(server_addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                *self.state.write().await = ConnectionState::Failed;
                return Err(ClientError::Io(e));
            }
            Err(_) => {
                *self.state.write().await = ConnectionState::Failed;
                return Err(ClientError::Timeout);
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!("Failed to set TCP_NODELAY: {}", e);
        }

        // Client sequence numbers are local to each connection
        let encoder = Encoder::new(
            self.config.protocol_version,
            Arc::new(SequenceCounter::new(self.config.sequence_start)),
        );
        let mut conn = Connection::new(stream, server_addr, encoder, &self.config);

        // Create message channel
        let (msg_tx, mut msg_rx) = mpsc::channel::<Outbound>(256);
        let handle = ConnectionHandle::new(msg_tx, server_addr);

        *self.connection_handle.write().await = Some(handle.clone());
        *self.state.write().await = ConnectionState::Connected;

        tracing::info!("Connected to {}", server_addr);
        let _ = self
            .event_tx
            .send(ClientEvent::Connected { server_addr })
            .await;

        // Spawn the message loop
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let connection_handle = self.connection_handle.clone();

        tokio::spawn(async move {
            let (disconnect_reason, failed) = loop {
                tokio::select! {
                    // Receive messages from the server
                    result = conn.recv() => {
                        match result {
                            Ok(Some(message)) => {
                                let _ = event_tx.send(ClientEvent::MessageReceived { message }).await;
                            }
                            Ok(None) => {
                                break ("Connection closed by server".to_string(), false);
                            }
                            Err(e) => {
                                break (format!("Error: {}", e), true);
                            }
                        }
                    }

                    // Send messages to the server
                    command = msg_rx.recv() => {
                        match command {
                            Some(Outbound::Message(message)) => {
                                match conn.send(&message).await {
                                    Ok(_) => {}
                                    Err(e) if e.is_recoverable() => {
                                        tracing::warn!("Dropped outgoing message: {}", e);
                                        let _ = event_tx.send(ClientEvent::Error {
                                            message: e.to_string(),
                                        }).await;
                                    }
                                    Err(e) => {
                                        break (format!("Send error: {}", e), true);
                                    }
                                }
                            }
                            Some(Outbound::Close) | None => {
                                break ("Client shutdown requested".to_string(), false);
                            }
                        }
                    }
                }
            };

            // Clean up
            handle.mark_disconnected();
            msg_rx.close();
            *connection_handle.write().await = None;
            *state.write().await = if failed {
                ConnectionState::Failed
            } else {
                ConnectionState::Closing
            };

            let stats = conn.stats();
            if failed {
                tracing::warn!("Disconnected from {}: {}", conn.remote_addr(), disconnect_reason);
            } else {
                tracing::info!("Disconnected from {}: {}", conn.remote_addr(), disconnect_reason);
            }
            tracing::debug!(
                "{} frames in, {} frames out, {} bytes in, {} bytes out",
                stats.messages_received,
                stats.messages_sent,
                stats.bytes_received,
                stats.bytes_sent
            );

            let _ = conn.close().await;
            if !failed {
                *state.write().await = ConnectionState::Closed;
            }

            let _ = event_tx
                .send(ClientEvent::Disconnected {
                    reason: disconnect_reason,
                    failed,
                })
                .await;
        });

        Ok(())
    }

    /// Connect to a server by hostname
    pub async fn connect_host(&self, host: &str, port: u16) -> ClientResult<()> {
        let addr = super::resolve_host(host, port).await?;
        self.connect(addr).await
    }

    /// Disconnect from the server
    pub async fn disconnect(&self) -> ClientResult<()> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }

        if let Some(handle) = self.handle().await {
            handle.close().await?;
        }

        Ok(())
    }

    /// Send a message to the server
    pub async fn send(&self, message: OutgoingMessage) -> ClientResult<()> {
        let handle = self.handle().await.ok_or(ClientError::NotConnected)?;
        handle.send(message).await?;
        Ok(())
    }

    /// Clone of the live handle; the lock is not held while sending
    async fn handle(&self) -> Option<ConnectionHandle> {
        self.connection_handle.read().await.clone()
    }

    /// Get the current state
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Check if connected
    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }
}

#[async_trait]
impl Endpoint for Client {
    type Error = ClientError;

    fn role(&self) -> Role {
        Role::Client
    }

    async fn send(&self, message: OutgoingMessage) -> ClientResult<usize> {
        Client::send(self, message).await.map(|_| 1)
    }

    async fn shutdown(&mut self) -> ClientResult<()> {
        match self.disconnect().await {
            Err(ClientError::NotConnected) => Ok(()),
            other => other,
        }
    }

    async fn is_active(&self) -> bool {
        self.is_connected().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode, FrameHeader, Reassembler};
    use bytes::BytesMut;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn next_event(rx: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for client event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_client_creation() {
        let client = Client::new(NetworkConfig::default());
        assert!(!client.is_connected().await);
        assert_eq!(client.role(), Role::Client);
    }

    #[tokio::test]
    async fn test_send_when_not_connected() {
        let client = Client::new(NetworkConfig::default());
        let result = client.send(OutgoingMessage::new(&b"{}"[..])).await;
        assert!(matches!(result, Err(ClientError::NotConnected)));
        assert!(matches!(client.disconnect().await, Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = Client::new(NetworkConfig::default());
        assert!(client.connect(addr).await.is_err());
        assert_eq!(client.state().await, ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_exchange_with_raw_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Peer reads two client frames, then answers with a frame split
        // across two writes and closes.
        let peer = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut reassembler = Reassembler::new();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            while received.len() < 2 {
                let n = socket.read(&mut buf).await.unwrap();
                assert!(n > 0);
                reassembler
                    .on_bytes_received(&buf[..n], |m| received.push(m))
                    .unwrap();
            }

            let header = FrameHeader {
                sequence: 77,
                ..FrameHeader::new(2, 0)
            };
            let mut reply = BytesMut::new();
            encode(&header, br#"{"pong":true}"#, &[1, 2, 3], &mut reply).unwrap();
            socket.write_all(&reply[..10]).await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            socket.write_all(&reply[10..]).await.unwrap();
            socket.shutdown().await.unwrap();

            received
        });

        let mut client = Client::new(NetworkConfig::default());
        let mut events = client.take_event_receiver().unwrap();
        client.connect(addr).await.unwrap();
        assert!(matches!(next_event(&mut events).await, ClientEvent::Connected { .. }));

        client
            .send(OutgoingMessage::new(&br#"{"ping":true}"#[..]))
            .await
            .unwrap();
        client
            .send(OutgoingMessage::new(&b"{}"[..]).with_binary(vec![5u8; 5]))
            .await
            .unwrap();

        match next_event(&mut events).await {
            ClientEvent::MessageReceived { message } => {
                assert_eq!(message.sequence(), 77);
                assert_eq!(message.msg_type(), 2);
                assert_eq!(message.json_str().unwrap(), r#"{"pong":true}"#);
                assert_eq!(&message.binary[..], &[1, 2, 3]);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        match next_event(&mut events).await {
            ClientEvent::Disconnected { failed, .. } => assert!(!failed),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(client.state().await, ConnectionState::Closed);

        let received = peer.await.unwrap();
        assert_eq!(received[0].sequence(), 1);
        assert_eq!(received[0].json_str().unwrap(), r#"{"ping":true}"#);
        assert_eq!(received[1].sequence(), 2);
        assert_eq!(&received[1].binary[..], &[5; 5]);
    }

    #[tokio::test]
    async fn test_desync_from_server_is_terminal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&[0u8; 32]).await.unwrap();
            // Hold the socket open; the client must close on its own
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let mut client = Client::new(NetworkConfig::default());
        let mut events = client.take_event_receiver().unwrap();
        client.connect(addr).await.unwrap();
        assert!(matches!(next_event(&mut events).await, ClientEvent::Connected { .. }));

        match next_event(&mut events).await {
            ClientEvent::Disconnected { failed, reason } => {
                assert!(failed);
                assert!(reason.contains("Sync mismatch"), "{}", reason);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(client.state().await, ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_local_disconnect_then_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = Client::new(NetworkConfig::default());
        let mut events = client.take_event_receiver().unwrap();

        client.connect(addr).await.unwrap();
        let (mut first, _) = listener.accept().await.unwrap();
        assert!(matches!(next_event(&mut events).await, ClientEvent::Connected { .. }));
        assert_eq!(client.state().await, ConnectionState::Connected);

        client.disconnect().await.unwrap();
        match next_event(&mut events).await {
            ClientEvent::Disconnected { failed, .. } => assert!(!failed),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(client.state().await, ConnectionState::Closed);
        assert!(matches!(
            client.send(OutgoingMessage::new(&b"{}"[..])).await,
            Err(ClientError::NotConnected)
        ));

        // The peer sees a clean EOF
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), first.read(&mut buf))
            .await
            .expect("no EOF after disconnect")
            .unwrap();
        assert_eq!(n, 0);

        // A closed client can connect again
        client.connect(addr).await.unwrap();
        let (_second, _) = listener.accept().await.unwrap();
        assert!(matches!(next_event(&mut events).await, ClientEvent::Connected { .. }));
        assert!(client.is_connected().await);
    }
}
