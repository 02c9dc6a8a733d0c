//! AVDP Server
//!
//! The server accepts any number of inbound connections, each with its own
//! reassembly buffer, and stamps a sequence number into every frame it sends.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};

use super::connection::{Connection, ConnectionError, ConnectionHandle, Outbound};
use super::{Endpoint, NetworkConfig, Role, SequenceScope};
use crate::protocol::{check_lengths, Encoder, Message, OutgoingMessage, SequenceCounter};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("Unknown client: {0}")]
    UnknownClient(SocketAddr),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Events emitted by the server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A new client has connected
    ClientConnected { addr: SocketAddr },
    /// A client has disconnected
    ClientDisconnected {
        addr: SocketAddr,
        reason: String,
        failed: bool,
    },
    /// Received a message from a client
    MessageReceived { addr: SocketAddr, message: Message },
    /// Server started
    Started { bind_addr: SocketAddr },
    /// Server stopped
    Stopped,
    /// Error occurred
    Error { message: String },
}

/// Information about a connected client
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Client address
    pub addr: SocketAddr,
    /// Handle for sending messages to this client
    pub handle: ConnectionHandle,
}

type ClientMap = Arc<RwLock<HashMap<SocketAddr, ClientInfo>>>;

/// AVDP Server
pub struct Server {
    /// Server configuration
    config: NetworkConfig,
    /// Connected clients
    clients: ClientMap,
    /// Process-wide sequence counter
    sequence: Arc<SequenceCounter>,
    /// Event sender
    event_tx: mpsc::Sender<ServerEvent>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
    /// Shutdown signal
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Whether the server is running
    running: Arc<RwLock<bool>>,
}

impl Server {
    /// Create a new server
    pub fn new(config: NetworkConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let sequence = Arc::new(SequenceCounter::new(config.sequence_start));

        Self {
            config,
            clients: Arc::new(RwLock::new(HashMap::new())),
            sequence,
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx: None,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    /// Start the server, returning the bound address
    pub async fn start(&mut self) -> ServerResult<SocketAddr> {
        if *self.running.read().await {
            return Err(ServerError::AlreadyRunning);
        }

        let bind_addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let local_addr = listener.local_addr()?;
        tracing::info!("Server listening on {}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        *self.running.write().await = true;

        let _ = self
            .event_tx
            .send(ServerEvent::Started {
                bind_addr: local_addr,
            })
            .await;

        let clients = self.clients.clone();
        let event_tx = self.event_tx.clone();
        let running = self.running.clone();
        let config = self.config.clone();
        let sequence = self.sequence.clone();

        // Spawn the accept loop
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                tracing::info!("New connection from {}", addr);

                                let sequence = match config.sequence_scope {
                                    SequenceScope::Process => sequence.clone(),
                                    SequenceScope::Connection => {
                                        Arc::new(SequenceCounter::new(config.sequence_start))
                                    }
                                };
                                let encoder = Encoder::new(config.protocol_version, sequence);

                                tokio::spawn(handle_client(
                                    stream,
                                    addr,
                                    encoder,
                                    config.clone(),
                                    clients.clone(),
                                    event_tx.clone(),
                                ));
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                                let _ = event_tx.send(ServerEvent::Error {
                                    message: format!("Accept error: {}", e),
                                }).await;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Server shutdown requested");
                        break;
                    }
                }
            }

            *running.write().await = false;

            let _ = event_tx.send(ServerEvent::Stopped).await;
        });

        Ok(local_addr)
    }

    /// Stop accepting and close every client connection
    pub async fn stop(&mut self) -> ServerResult<()> {
        if !*self.running.read().await {
            return Err(ServerError::NotRunning);
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }

        for handle in self.handles().await {
            let _ = handle.close().await;
        }

        Ok(())
    }

    /// Get a list of connected clients
    pub async fn clients(&self) -> Vec<ClientInfo> {
        let clients = self.clients.read().await;
        clients.values().cloned().collect()
    }

    /// Snapshot of the live handles. The map lock is released before any
    /// handle is awaited, so a full send queue never blocks accept or cleanup.
    async fn handles(&self) -> Vec<ConnectionHandle> {
        let clients = self.clients.read().await;
        clients.values().map(|c| c.handle.clone()).collect()
    }

    async fn handle_for(&self, addr: &SocketAddr) -> ServerResult<ConnectionHandle> {
        let clients = self.clients.read().await;
        clients
            .get(addr)
            .map(|c| c.handle.clone())
            .ok_or(ServerError::UnknownClient(*addr))
    }

    /// Send a message to a specific client
    pub async fn send_to(&self, addr: &SocketAddr, message: OutgoingMessage) -> ServerResult<()> {
        let handle = self.handle_for(addr).await?;
        handle.send(message).await?;
        Ok(())
    }

    /// Send a message to all connected clients, returning how many it was
    /// queued for. Each copy takes its own sequence number.
    pub async fn broadcast(&self, message: OutgoingMessage) -> ServerResult<usize> {
        check_lengths(message.json.len(), message.binary.len()).map_err(ConnectionError::from)?;

        let mut queued = 0;
        for handle in self.handles().await {
            match handle.send(message.clone()).await {
                Ok(()) => queued += 1,
                Err(e) => tracing::warn!("Broadcast to {} failed: {}", handle.remote_addr(), e),
            }
        }
        Ok(queued)
    }

    /// Ask one client's connection to close
    pub async fn disconnect(&self, addr: &SocketAddr) -> ServerResult<()> {
        let handle = self.handle_for(addr).await?;
        Ok(handle.close().await?)
    }

    /// Check if the server is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Sequence number the next process-scoped frame will carry
    pub fn next_sequence(&self) -> u32 {
        self.sequence.peek()
    }
}

#[async_trait]
impl Endpoint for Server {
    type Error = ServerError;

    fn role(&self) -> Role {
        Role::Server
    }

    async fn send(&self, message: OutgoingMessage) -> ServerResult<usize> {
        self.broadcast(message).await
    }

    async fn shutdown(&mut self) -> ServerResult<()> {
        match self.stop().await {
            Err(ServerError::NotRunning) => Ok(()),
            other => other,
        }
    }

    async fn is_active(&self) -> bool {
        self.is_running().await
    }
}

/// Handle a client connection
async fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    encoder: Encoder,
    config: NetworkConfig,
    clients: ClientMap,
    event_tx: mpsc::Sender<ServerEvent>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
    }

    let mut conn = Connection::new(stream, addr, encoder, &config);

    // Create message channel for this client
    let (msg_tx, mut msg_rx) = mpsc::channel::<Outbound>(256);
    let handle = ConnectionHandle::new(msg_tx, addr);

    clients.write().await.insert(
        addr,
        ClientInfo {
            addr,
            handle: handle.clone(),
        },
    );

    let _ = event_tx.send(ServerEvent::ClientConnected { addr }).await;

    // Main message loop
    let (disconnect_reason, failed) = loop {
        tokio::select! {
            // Receive messages from the client
            result = conn.recv() => {
                match result {
                    Ok(Some(message)) => {
                        let _ = event_tx.send(ServerEvent::MessageReceived { addr, message }).await;
                    }
                    Ok(None) => {
                        break ("Connection closed".to_string(), false);
                    }
                    Err(e) => {
                        break (format!("Error: {}", e), true);
                    }
                }
            }

            // Send messages to the client
            command = msg_rx.recv() => {
                match command {
                    Some(Outbound::Message(message)) => {
                        match conn.send(&message).await {
                            Ok(_) => {}
                            Err(e) if e.is_recoverable() => {
                                tracing::warn!("Dropped message for {}: {}", addr, e);
                            }
                            Err(e) => {
                                break (format!("Send error: {}", e), true);
                            }
                        }
                    }
                    Some(Outbound::Close) | None => {
                        break ("Closed by server".to_string(), false);
                    }
                }
            }
        }
    };

    // Clean up
    handle.mark_disconnected();
    msg_rx.close();
    clients.write().await.remove(&addr);

    if failed {
        tracing::warn!("Client {} failed: {}", addr, disconnect_reason);
    } else {
        tracing::info!("Client {} disconnected: {}", addr, disconnect_reason);
    }
    tracing::debug!(
        "Client {}: {} frames in, {} frames out",
        addr,
        conn.stats().messages_received,
        conn.stats().messages_sent
    );

    let _ = conn.close().await;

    let _ = event_tx
        .send(ServerEvent::ClientDisconnected {
            addr,
            reason: disconnect_reason,
            failed,
        })
        .await;
}
