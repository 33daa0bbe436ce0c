//! Rendezvous-service message protocol.
//!
//! Every message is a JSON object tagged by `type`. Session descriptions and
//! ICE candidates travel in the `webrtc` crate's own serde form.

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// A message exchanged with the signaling server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingMessage {
    /// Register under `source`. The service echoes it with `success`.
    Login {
        /// Identity being claimed.
        source: String,
        /// Set by the service: `false` means the name is taken.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        success: Option<bool>,
    },
    /// A peer wants to connect.
    Offer {
        /// Remote identity.
        source: String,
        /// Our identity.
        destination: String,
        /// Remote session description.
        offer: RTCSessionDescription,
    },
    /// Our reply to an offer.
    Answer {
        /// Our identity.
        source: String,
        /// Remote identity.
        destination: String,
        /// Local session description.
        answer: RTCSessionDescription,
    },
    /// A trickled ICE candidate, in either direction.
    Candidate {
        /// Sender identity.
        source: String,
        /// Receiver identity.
        destination: String,
        /// The candidate.
        candidate: RTCIceCandidateInit,
    },
    /// Any message type this server does not handle.
    #[serde(other)]
    Unknown,
}

impl SignalingMessage {
    /// Login request for `name`.
    pub fn login(name: &str) -> Self {
        Self::Login {
            source: name.to_owned(),
            success: None,
        }
    }

    /// Serialized form sent over the signaling socket.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse one text frame.
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
