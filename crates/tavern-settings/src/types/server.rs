//! Connection server settings.

use serde::{Deserialize, Serialize};
use tavern_core::framing::DEFAULT_MAX_FRAME_SIZE;
use tavern_core::retry::ReconnectPolicy;

/// Which transports the server accepts connections on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Plain TCP sockets.
    #[default]
    Socket,
    /// WebRTC data channels negotiated through a signaling server.
    Webrtc,
    /// Both of the above on one server.
    Both,
}

impl TransportMode {
    /// Whether a TCP listener is started.
    pub fn uses_socket(self) -> bool {
        matches!(self, Self::Socket | Self::Both)
    }

    /// Whether a WebRTC listener is started.
    pub fn uses_webrtc(self) -> bool {
        matches!(self, Self::Webrtc | Self::Both)
    }

    /// Parse the lowercase name used in settings files and env vars.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "socket" => Some(Self::Socket),
            "webrtc" => Some(Self::Webrtc),
            "both" => Some(Self::Both),
            _ => None,
        }
    }
}

/// One STUN or TURN server.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IceServerSettings {
    /// `stun:` or `turn:` URLs.
    pub urls: Vec<String>,
    /// TURN username.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub username: String,
    /// TURN credential.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub credential: String,
}

/// Public STUN/TURN servers used when none are configured.
pub fn default_ice_servers() -> Vec<IceServerSettings> {
    let stun = |urls: &[&str]| IceServerSettings {
        urls: urls.iter().map(|u| (*u).to_string()).collect(),
        ..IceServerSettings::default()
    };
    let turn = |url: &str| IceServerSettings {
        urls: vec![url.to_string()],
        username: "openrelayproject".to_string(),
        credential: "openrelayproject".to_string(),
    };
    vec![
        stun(&[
            "stun:stun.l.google.com:19302",
            "stun:stun1.l.google.com:19302",
            "stun:stun2.l.google.com:19302",
            "stun:stun3.l.google.com:19302",
            "stun:stun4.l.google.com:19302",
        ]),
        stun(&["stun:openrelay.metered.ca:80"]),
        turn("turn:openrelay.metered.ca:80"),
        turn("turn:openrelay.metered.ca:443"),
        // TURN over TCP for networks that drop UDP.
        turn("turn:openrelay.metered.ca:443?transport=tcp"),
    ]
}

/// Connection server network and runtime settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Display name; also the login identity on the signaling server.
    pub name: String,
    /// Bind address for the socket transport.
    pub host: String,
    /// Socket port (0 picks an ephemeral port).
    pub port: u16,
    /// Transports to accept connections on.
    pub transport: TransportMode,
    /// WebSocket URL of the signaling (rendezvous) server.
    pub signaling_url: String,
    /// Upper bound on one handshake, in seconds.
    pub handshake_timeout_secs: u64,
    /// Background reap interval in seconds (0 disables the sweep).
    pub reap_interval_secs: u64,
    /// Deflate payloads on the wire.
    pub compression: bool,
    /// Largest accepted payload in bytes.
    pub max_message_size: usize,
    /// Bounded wait for tasks to finish on close, in seconds.
    pub shutdown_timeout_secs: u64,
    /// Signaling reconnect policy.
    pub reconnect: ReconnectPolicy,
    /// STUN/TURN servers for peer connections.
    pub ice_servers: Vec<IceServerSettings>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: "tavern".to_string(),
            host: "0.0.0.0".to_string(),
            port: 51234,
            transport: TransportMode::Socket,
            signaling_url: "ws://127.0.0.1:8090".to_string(),
            handshake_timeout_secs: 30,
            reap_interval_secs: 30,
            compression: true,
            max_message_size: DEFAULT_MAX_FRAME_SIZE,
            shutdown_timeout_secs: 5,
            reconnect: ReconnectPolicy::default(),
            ice_servers: default_ice_servers(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_mode_serde() {
        assert_eq!(
            serde_json::to_string(&TransportMode::Webrtc).unwrap(),
            "\"webrtc\""
        );
        let mode: TransportMode = serde_json::from_str("\"both\"").unwrap();
        assert_eq!(mode, TransportMode::Both);
    }

    #[test]
    fn transport_mode_flags() {
        assert!(TransportMode::Socket.uses_socket());
        assert!(!TransportMode::Socket.uses_webrtc());
        assert!(TransportMode::Both.uses_socket());
        assert!(TransportMode::Both.uses_webrtc());
        assert!(!TransportMode::Webrtc.uses_socket());
    }

    #[test]
    fn transport_mode_parse() {
        assert_eq!(TransportMode::parse("WebRTC"), Some(TransportMode::Webrtc));
        assert_eq!(TransportMode::parse("carrier-pigeon"), None);
    }

    #[test]
    fn default_ice_servers_include_stun_and_turn() {
        let servers = default_ice_servers();
        assert!(servers[0].urls.iter().all(|u| u.starts_with("stun:")));
        let turn = servers.iter().find(|s| s.urls[0].starts_with("turn:")).unwrap();
        assert_eq!(turn.username, "openrelayproject");
    }

    #[test]
    fn default_ice_servers_fall_back_to_turn_over_tcp() {
        let tcp = default_ice_servers()
            .into_iter()
            .find(|s| s.urls.iter().any(|u| u.ends_with("?transport=tcp")))
            .unwrap();
        assert_eq!(tcp.urls, vec!["turn:openrelay.metered.ca:443?transport=tcp"]);
        assert_eq!(tcp.credential, "openrelayproject");
    }

    #[test]
    fn ice_server_omits_empty_credentials() {
        let json = serde_json::to_value(IceServerSettings {
            urls: vec!["stun:example.org:3478".to_string()],
            ..IceServerSettings::default()
        })
        .unwrap();
        assert!(json.get("username").is_none());
    }

    #[test]
    fn reconnect_section_deserializes() {
        let settings: ServerSettings =
            serde_json::from_str(r#"{"reconnect": {"maxAttempts": 2}}"#).unwrap();
        assert_eq!(settings.reconnect.max_attempts, 2);
        assert_eq!(settings.reconnect.initial_backoff_secs, 1);
    }
}
