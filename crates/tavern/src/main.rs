//! # tavern
//!
//! Tavern connection server binary: loads settings, starts the configured
//! transports and runs until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use tavern_server::handshake::{AcceptAllHandshakeProvider, HandshakeProvider, PasswordHandshakeProvider};
use tavern_server::transport::{SocketListener, WebRtcListener};
use tavern_server::{Connection, ConnectionServer, MessageHandler, ServerConfig, ServerObserver};
use tavern_settings::{TavernSettings, TransportMode};

/// Tavern connection server.
#[derive(Parser, Debug)]
#[command(name = "tavern", version, about = "Tavern connection server")]
struct Cli {
    /// Settings file (defaults to `~/.tavern/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Port to bind (0 for auto-assign). Overrides settings.
    #[arg(long)]
    port: Option<u16>,

    /// Server display name. Overrides settings.
    #[arg(long)]
    name: Option<String>,

    /// Transport: socket, webrtc or both. Overrides settings.
    #[arg(long, value_parser = parse_transport)]
    transport: Option<TransportMode>,

    /// Shared password players must present. Without one, everyone is admitted.
    #[arg(long, env = "TAVERN_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Log level. Overrides settings; `RUST_LOG` overrides both.
    #[arg(long)]
    log_level: Option<String>,
}

fn parse_transport(value: &str) -> Result<TransportMode, String> {
    TransportMode::parse(value).ok_or_else(|| format!("unknown transport '{value}'"))
}

impl Cli {
    fn apply(&self, settings: &mut TavernSettings) {
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(name) = &self.name {
            settings.server.name.clone_from(name);
        }
        if let Some(transport) = self.transport {
            settings.server.transport = transport;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
    }

    fn handshake_provider(&self) -> Arc<dyn HandshakeProvider> {
        match &self.password {
            Some(password) => Arc::new(PasswordHandshakeProvider::new(
                password.as_str(),
                tavern_core::constants::VERSION,
            )),
            None => Arc::new(AcceptAllHandshakeProvider),
        }
    }
}

/// Logs every inbound payload. The game layer replaces this.
struct LogHandler;

#[async_trait]
impl MessageHandler for LogHandler {
    async fn handle_message(&self, conn_id: &str, payload: Bytes) -> anyhow::Result<()> {
        tracing::debug!(conn_id, len = payload.len(), "message received");
        Ok(())
    }
}

/// Logs roster changes.
struct LogObserver;

impl ServerObserver for LogObserver {
    fn connection_added(&self, conn: &Arc<dyn Connection>) {
        tracing::info!(conn_id = conn.id(), transport = %conn.transport(), "player joined");
    }

    fn connection_removed(&self, conn: &Arc<dyn Connection>) {
        tracing::info!(conn_id = conn.id(), transport = %conn.transport(), "player left");
    }
}

async fn start_listeners(server: &ConnectionServer, config: &ServerConfig) -> Result<()> {
    if config.transport.uses_socket() {
        let listener = SocketListener::bind(config.bind_addr())
            .await
            .context("Failed to bind socket listener")?;
        let addr = listener.local_addr();
        server
            .start_listener(Box::new(listener))
            .await
            .context("Failed to start socket listener")?;
        tracing::info!("Tavern '{}' listening on {addr}", config.name);
    }
    if config.transport.uses_webrtc() {
        server
            .start_listener(Box::new(WebRtcListener::new(config)))
            .await
            .with_context(|| format!("Failed to reach signaling service at {}", config.signaling_url))?;
        tracing::info!("Tavern '{}' reachable via {}", config.name, config.signaling_url);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args.settings.clone().unwrap_or_else(tavern_settings::settings_path);
    let mut settings = tavern_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    args.apply(&mut settings);
    settings.validate().context("Invalid settings")?;

    tavern_core::logging::init_subscriber(&settings.logging.level);

    let config = ServerConfig::from(&settings.server);
    let server = ConnectionServer::new(config.clone(), args.handshake_provider(), Arc::new(LogHandler));
    server.add_observer(Arc::new(LogObserver));

    if let Err(error) = start_listeners(&server, &config).await {
        server.close().await;
        return Err(error);
    }

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for ctrl-c")?;
            tracing::info!("Shutting down...");
        }
        () = server.wait_closed() => {
            tracing::warn!("Server stopped on its own");
        }
    }
    server.close().await;

    tracing::info!("Shutdown complete");
    Ok(())
}
