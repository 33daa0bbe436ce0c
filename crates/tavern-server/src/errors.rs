//! Server error taxonomy.
//!
//! - [`ServerError`]: failures surfaced to whoever started or drives the server
//! - [`SendError`]: a single connection could not take a payload
//! - [`HandshakeFailure`]: why a connection was refused admission

use std::time::Duration;

use tavern_core::errors::CompressionError;
use thiserror::Error;

/// Errors surfaced by server operations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// No registered connection has this id.
    #[error("no connection with id '{id}'")]
    NotFound {
        /// The id that was looked up.
        id: String,
    },
    /// A registered connection refused the payload.
    #[error("failed to send to '{id}': {source}")]
    Send {
        /// Target connection.
        id: String,
        /// Why the connection refused it.
        #[source]
        source: SendError,
    },
    /// The server has been closed.
    #[error("server is closed")]
    Closed,
    /// The signaling channel failed or rejected this server.
    #[error("signaling failed: {0}")]
    Signaling(String),
    /// Peer connection setup failed.
    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),
    /// Transport I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised when queuing a payload on one connection.
#[derive(Debug, Error)]
pub enum SendError {
    /// The connection is no longer alive.
    #[error("connection is closed")]
    Closed,
    /// The payload is larger than the configured maximum.
    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    TooLarge {
        /// Payload length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },
    /// The payload could not be compressed.
    #[error(transparent)]
    Encode(#[from] CompressionError),
}

/// Why a handshake did not admit its connection.
#[derive(Debug, Error)]
pub enum HandshakeFailure {
    /// The peer's credentials or identity were refused.
    #[error("handshake rejected: {0}")]
    Rejected(String),
    /// The handshake did not finish in time.
    #[error("handshake timed out after {0:?}")]
    TimedOut(Duration),
    /// The connection died before the handshake finished.
    #[error("connection closed during handshake")]
    Disconnected,
    /// The peer sent something that is not a valid handshake message.
    #[error("handshake protocol error: {0}")]
    Protocol(String),
    /// The server shut down while the handshake was running.
    #[error("server closed during handshake")]
    Cancelled,
}
