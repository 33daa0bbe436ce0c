//! WebRTC transport: a signaling client plus one data channel per peer.

use tavern_settings::IceServerSettings;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;

use crate::errors::ServerError;

mod connection;
mod listener;
pub mod signaling;

pub use connection::WebRtcConnection;
pub use listener::{SIGNALING_CONNECT_TIMEOUT, WebRtcListener};
pub use signaling::SignalingMessage;

/// WebRTC API with the default interceptors. Data channels only, so no
/// codecs are registered.
pub(crate) fn build_api() -> Result<API, ServerError> {
    let mut media = MediaEngine::default();
    let registry = register_default_interceptors(Registry::new(), &mut media)?;
    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}

/// Peer connection configuration for the given STUN/TURN servers.
pub(crate) fn rtc_configuration(ice_servers: &[IceServerSettings]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone(),
                credential: server.credential.clone(),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}
