//! Runtime configuration for one connection server.

use std::time::Duration;

use tavern_core::compression::PayloadCodec;
use tavern_core::retry::ReconnectPolicy;
use tavern_settings::{IceServerSettings, ServerSettings, TransportMode};

/// Configuration consumed by [`crate::ConnectionServer`] and its listeners.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Display name; also the signaling login identity.
    pub name: String,
    /// Socket bind address.
    pub host: String,
    /// Socket port (0 = ephemeral).
    pub port: u16,
    /// Transports to start.
    pub transport: TransportMode,
    /// Signaling server WebSocket URL.
    pub signaling_url: String,
    /// Default upper bound on one handshake.
    pub handshake_timeout: Duration,
    /// Background reap interval; `None` disables the sweep.
    pub reap_interval: Option<Duration>,
    /// Deflate payloads on the wire.
    pub compression: bool,
    /// Largest accepted payload in bytes.
    pub max_message_size: usize,
    /// Bounded wait for tasks on close.
    pub shutdown_timeout: Duration,
    /// Signaling reconnect policy.
    pub reconnect: ReconnectPolicy,
    /// STUN/TURN servers.
    pub ice_servers: Vec<IceServerSettings>,
}

impl ServerConfig {
    /// Payload codec shared by every connection of this server.
    pub fn payload_codec(&self) -> PayloadCodec {
        PayloadCodec::new(self.compression, self.max_message_size)
    }

    /// `host:port` for the socket listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            name: settings.name.clone(),
            host: settings.host.clone(),
            port: settings.port,
            transport: settings.transport,
            signaling_url: settings.signaling_url.clone(),
            handshake_timeout: Duration::from_secs(settings.handshake_timeout_secs),
            reap_interval: (settings.reap_interval_secs > 0)
                .then(|| Duration::from_secs(settings.reap_interval_secs)),
            compression: settings.compression,
            max_message_size: settings.max_message_size,
            shutdown_timeout: Duration::from_secs(settings.shutdown_timeout_secs),
            reconnect: settings.reconnect,
            ice_servers: settings.ice_servers.clone(),
        }
    }
}

impl From<ServerSettings> for ServerConfig {
    fn from(settings: ServerSettings) -> Self {
        Self::from(&settings)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(ServerSettings::default())
    }
}
