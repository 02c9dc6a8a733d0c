//! AVDP - JSON + binary message framing over TCP
//!
//! Runs either end of the protocol from the terminal: stdin lines become
//! outgoing JSON messages, received frames and connection events are printed.

use std::net::SocketAddr;
use std::path::PathBuf;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use avdp::config::{self, Config};
use avdp::network::{Client, ClientEvent, Endpoint, Server, ServerEvent};
use avdp::protocol::{self, Message, OutgoingMessage, DEFAULT_MESSAGE_TYPE};

/// AVDP - framed JSON/binary messaging over TCP
#[derive(Parser)]
#[command(name = "avdp")]
#[command(author = "AVDP Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Exchange framed JSON + binary messages over TCP", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept connections; stdin lines are broadcast, `@ip:port {json}` targets one client
    Server {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Connect to a server; stdin lines are sent as JSON messages
    Client {
        /// Server host name or address
        #[arg(long)]
        host: String,

        /// Server port
        #[arg(short, long)]
        port: Option<u16>,

        /// Message type for outgoing frames
        #[arg(short = 't', long = "type", default_value_t = DEFAULT_MESSAGE_TYPE)]
        msg_type: u8,

        /// Payload-kind tag for outgoing frames
        #[arg(long, default_value_t = 0)]
        m_pt: u8,

        /// File whose bytes are attached as the binary segment
        #[arg(short, long)]
        binary: Option<PathBuf>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol constants
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Server { port } => {
            run_server(config, port).await?;
        }
        Commands::Client {
            host,
            port,
            msg_type,
            m_pt,
            binary,
        } => {
            let binary = match binary {
                Some(path) => Bytes::from(std::fs::read(&path)?),
                None => Bytes::new(),
            };
            let template = OutgoingMessage::new(Bytes::new())
                .with_type(msg_type)
                .with_m_pt(m_pt)
                .with_binary(binary);
            run_client(config, host, port, template).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_protocol_info();
        }
    }

    Ok(())
}

/// Run the server role
async fn run_server(config: Config, port: Option<u16>) -> anyhow::Result<()> {
    let net_config = config.network_config(port);

    tracing::info!(
        "Starting AVDP server '{}' on port {}",
        config.general.name,
        net_config.port
    );

    let mut server = Server::new(net_config);
    let mut event_rx = server
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("server event receiver already taken"))?;

    let bind_addr = server.start().await?;

    println!("\n========================================");
    println!("  AVDP Server Running");
    println!("========================================");
    println!("  Node: {}", config.general.name);
    println!("  Listening: {}", bind_addr);
    println!("========================================");
    println!("\nType JSON to broadcast, `@ip:port {{json}}` for one client,");
    println!("or `/close ip:port` to drop a client.");
    println!("Press Ctrl+C to stop.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    // Main event loop
    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ServerEvent::ClientConnected { addr } => {
                        println!("+ Client connected: {}", addr);
                    }
                    ServerEvent::ClientDisconnected { addr, reason, failed } => {
                        if failed {
                            println!("! Client failed: {} ({})", addr, reason);
                        } else {
                            println!("- Client disconnected: {} ({})", addr, reason);
                        }
                    }
                    ServerEvent::MessageReceived { addr, message } => {
                        println!("< {} {}", addr, describe(&message));
                    }
                    ServerEvent::Error { message } => {
                        tracing::error!("Server error: {}", message);
                    }
                    ServerEvent::Started { .. } | ServerEvent::Stopped => {}
                }
            }
            line = lines.next_line(), if stdin_open => {
                match line? {
                    Some(line) => {
                        if let Some(target) = line.trim().strip_prefix("/close ") {
                            match target.trim().parse::<SocketAddr>() {
                                Ok(target) => {
                                    if let Err(e) = server.disconnect(&target).await {
                                        println!("! Close {} failed: {}", target, e);
                                    }
                                }
                                Err(e) => println!("! Bad address: {}", e),
                            }
                        } else if let Some((target, json)) = parse_targeted(&line) {
                            if let Some(message) = json_message(json, &OutgoingMessage::new(Bytes::new())) {
                                if let Err(e) = server.send_to(&target, message).await {
                                    println!("! Send to {} failed: {}", target, e);
                                }
                            }
                        } else {
                            send_line(&server, &line, &OutgoingMessage::new(Bytes::new())).await;
                        }
                    }
                    None => {
                        tracing::debug!("stdin closed");
                        stdin_open = false;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    server.shutdown().await?;
    tracing::info!("Server stopped");

    Ok(())
}

/// Run the client role
async fn run_client(
    config: Config,
    host: String,
    port: Option<u16>,
    template: OutgoingMessage,
) -> anyhow::Result<()> {
    let net_config = config.network_config(port);
    let port = net_config.port;

    let mut client = Client::new(net_config);
    let mut event_rx = client
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("client event receiver already taken"))?;

    println!("Connecting to {}:{}...", host, port);
    client.connect_host(&host, port).await?;

    println!("\n========================================");
    println!("  AVDP Client Connected");
    println!("========================================");
    println!("  Node: {}", config.general.name);
    println!("  Server: {}:{}", host, port);
    println!("========================================");
    println!("\nType JSON to send.");
    println!("Press Ctrl+C to disconnect.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    // Main event loop
    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ClientEvent::Connected { server_addr } => {
                        tracing::info!("Connected to server: {}", server_addr);
                    }
                    ClientEvent::Disconnected { reason, failed } => {
                        if failed {
                            println!("Connection failed: {}", reason);
                        } else {
                            println!("Disconnected: {}", reason);
                        }
                        break;
                    }
                    ClientEvent::MessageReceived { message } => {
                        println!("< {}", describe(&message));
                    }
                    ClientEvent::Error { message } => {
                        tracing::error!("Client error: {}", message);
                    }
                }
            }
            line = lines.next_line(), if stdin_open => {
                match line? {
                    Some(line) => send_line(&client, &line, &template).await,
                    None => {
                        tracing::debug!("stdin closed");
                        stdin_open = false;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
        }
    }

    client.shutdown().await?;
    tracing::info!("Client stopped");

    Ok(())
}

/// Build a message from one line of JSON text, keeping the template's
/// header tags and binary segment
fn json_message(line: &str, template: &OutgoingMessage) -> Option<OutgoingMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Err(e) = serde_json::from_str::<serde_json::Value>(line) {
        println!("! Not valid JSON: {}", e);
        return None;
    }

    Some(OutgoingMessage {
        json: Bytes::copy_from_slice(line.as_bytes()),
        ..template.clone()
    })
}

/// Send a line through any endpoint
async fn send_line<E: Endpoint>(endpoint: &E, line: &str, template: &OutgoingMessage) {
    if !endpoint.is_active().await {
        println!("! {} is not active, dropping input", endpoint.role());
        return;
    }

    let Some(message) = json_message(line, template) else {
        return;
    };

    match endpoint.send(message).await {
        Ok(count) => tracing::debug!("{} queued message for {} connection(s)", endpoint.role(), count),
        Err(e) => println!("! Send failed: {}", e),
    }
}

/// Split `@ip:port rest` into the target address and the rest of the line
fn parse_targeted(line: &str) -> Option<(SocketAddr, &str)> {
    let rest = line.trim_start().strip_prefix('@')?;
    let (addr, json) = rest.split_once(char::is_whitespace)?;
    Some((addr.parse().ok()?, json))
}

/// One-line summary of a received message
fn describe(message: &Message) -> String {
    let header = &message.header;
    let json = message
        .json_str()
        .map(str::to_string)
        .unwrap_or_else(|_| format!("<{} bytes, invalid UTF-8>", message.json.len()));

    format!(
        "seq={} ver={} type={} m_pt={} reserve={} ts={} json={} binary={} bytes",
        header.sequence,
        header.ver,
        header.msg_type,
        header.m_pt,
        header.reserve,
        header.timestamp,
        json,
        message.binary.len()
    )
}

/// Print protocol constants
fn print_protocol_info() {
    println!("AVDP Protocol Information");
    println!("=========================\n");

    println!("Protocol Version: {}", protocol::PROTOCOL_VERSION);
    println!("Sync Magic: {:#010x}", protocol::SYNC_MAGIC);
    println!("Header Size: {} bytes", protocol::HEADER_SIZE);
    println!("Default Port: {}", protocol::DEFAULT_PORT);
    println!(
        "Default Max Frame Size: {} bytes",
        protocol::DEFAULT_MAX_FRAME_SIZE
    );
}
