//! Transports that accept remote peers and hand them to the server.
//!
//! - [`socket`]: TCP listener with length-prefixed frames
//! - [`webrtc`]: signaling client plus WebRTC data channels

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::connection::TransportKind;
use crate::errors::ServerError;
use crate::server::ConnectionServer;

pub mod socket;
pub mod webrtc;

pub use socket::{SocketConnection, SocketListener};
pub use webrtc::{WebRtcConnection, WebRtcListener};

/// Bound on how long a listener waits for its own tasks during close.
pub const LISTENER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Source of new connections for a [`ConnectionServer`].
///
/// Every accepted peer goes through
/// [`ConnectionServer::handle_connection`]; the server does not know or care
/// which transport produced it.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Transport this listener produces connections for.
    fn transport(&self) -> TransportKind;

    /// Begin accepting. Returns once the listener is ready.
    async fn start(&self, server: ConnectionServer) -> Result<(), ServerError>;

    /// Stop accepting and release OS resources. Idempotent.
    async fn close(&self);
}

/// Shared listeners, so a caller can keep a handle on one the server owns.
#[async_trait]
impl<L: Listener + ?Sized> Listener for Arc<L> {
    fn transport(&self) -> TransportKind {
        (**self).transport()
    }

    async fn start(&self, server: ConnectionServer) -> Result<(), ServerError> {
        (**self).start(server).await
    }

    async fn close(&self) {
        (**self).close().await;
    }
}
