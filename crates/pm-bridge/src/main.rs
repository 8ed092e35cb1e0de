//! peermux bridge node
//!
//! Runs one bridge against a local application server, using the loopback
//! native transport with a static peer table from the config file.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pm_bridge::{BridgeEvent, LinkStyle, LoopbackNetwork, LoopbackTransport, PeerBridge};
use pm_core::config::{self, NodeConfig};
use pm_core::traits::NativeTransport;
use pm_core::PeerId;

#[derive(Parser)]
#[command(name = "peermux")]
#[command(about = "Multiplex local TCP conversations over single-stream peer links")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "PEERMUX_CONFIG")]
    config: Option<PathBuf>,

    /// Application server port (overrides config)
    #[arg(short, long)]
    app_port: Option<u16>,

    /// Peer id to advertise (overrides config)
    #[arg(long)]
    peer_id: Option<String>,

    /// Open a local listener for this peer at startup (repeatable)
    #[arg(long = "connect", value_name = "PEER")]
    connect: Vec<String>,

    /// Use reverse links instead of forward ones
    #[arg(long)]
    reverse: bool,

    /// Print bridge events as JSON lines on stdout
    #[arg(long)]
    json: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("peermux starting...");

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                NodeConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            NodeConfig::default()
        }
    };

    if let Some(port) = args.app_port {
        config.application_port = port;
    }
    if let Some(peer_id) = &args.peer_id {
        config.local_peer_id = peer_id.clone();
    }
    if config.application_port == 0 {
        anyhow::bail!("No application port configured; pass --app-port or set application_port");
    }
    config
        .bridge
        .validate()
        .context("Invalid bridge configuration")?;

    // Static peer table
    let network = LoopbackNetwork::new();
    for (peer, addr) in &config.peers {
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("Invalid relay address {:?} for peer {}", addr, peer))?;
        network.register(PeerId::from(peer.as_str()), addr);
    }
    tracing::info!("Loaded {} static peers", config.peers.len());

    let style = if args.reverse {
        LinkStyle::Reverse
    } else {
        LinkStyle::Forward
    };
    let transport = Arc::new(LoopbackTransport::new(
        Arc::clone(&network),
        PeerId::from(config.local_peer_id.as_str()),
        style,
    ));
    let bridge = PeerBridge::new(config.bridge.clone(), transport.clone());

    // Spawn event printer before anything can happen
    let events = bridge.subscribe();
    let json = args.json;
    tokio::spawn(async move { print_events(events, json).await });

    let relay_port = bridge
        .start(config.application_port)
        .await
        .context("Failed to start relay listener")?;
    transport
        .start_listening_for_advertisements()
        .await
        .context("Failed to listen for advertisements")?;
    transport
        .start_advertising_and_listening(relay_port)
        .await
        .context("Failed to advertise")?;
    tracing::info!(
        "Node {} relaying port {} to application port {}",
        config.local_peer_id,
        relay_port,
        config.application_port
    );

    for peer in &args.connect {
        let peer_id = PeerId::from(peer.as_str());
        match bridge.create_peer_listener(&peer_id).await {
            Ok(port) => tracing::info!("Peer {} reachable on 127.0.0.1:{}", peer_id, port),
            Err(e) => tracing::warn!("Could not create listener for {}: {}", peer_id, e),
        }
    }

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Setup signal handlers
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel_clone.cancel();
    });

    cancel.cancelled().await;

    if let Err(e) = transport.stop_advertising_and_listening().await {
        tracing::warn!("Failed to stop advertising: {}", e);
    }
    bridge.stop().await.context("Failed to stop bridge")?;

    tracing::info!("peermux shutdown complete");
    Ok(())
}

/// Report bridge events until the bridge goes away
async fn print_events(mut events: broadcast::Receiver<BridgeEvent>, json: bool) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if json {
                    match serde_json::to_string(&event) {
                        Ok(line) => println!("{}", line),
                        Err(e) => tracing::warn!("Failed to serialize event: {}", e),
                    }
                } else {
                    log_event(&event);
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Event printer lagged by {} events", n);
            }
            Err(broadcast::error::RecvError::Closed) => {
                break;
            }
        }
    }
}

fn log_event(event: &BridgeEvent) {
    match event {
        BridgeEvent::IncomingConnectionState {
            connection_id,
            state,
        } => {
            tracing::info!("Incoming connection {} is {}", connection_id, state);
        }

        BridgeEvent::PeerSessionState {
            peer_id,
            generation,
            state,
        } => {
            tracing::info!("Peer {} generation {} is {}", peer_id, generation, state);
        }

        BridgeEvent::RouterPortConnectionFailed { router_port, error } => {
            tracing::warn!("Application port {} unreachable: {}", router_port, error);
        }

        BridgeEvent::FailedConnection {
            peer_id,
            error,
            recreating,
        } => {
            tracing::warn!(
                "Connection to {} failed: {} (recreating: {})",
                peer_id,
                error,
                recreating
            );
        }

        BridgeEvent::ListenerRecreatedAfterFailure {
            peer_id,
            port_number,
        } => {
            tracing::info!("Peer {} now reachable on port {}", peer_id, port_number);
        }
    }
}
