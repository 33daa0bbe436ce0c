//! Admission handshakes.
//!
//! A [`HandshakeProvider`] hands out one [`Handshake`] per accepted
//! connection. The server runs it through a [`HandshakeDriver`] with a
//! deadline and registers the connection only on success.
//!
//! Providers shipped here:
//! - [`PasswordHandshakeProvider`]: shared password, version check, unique
//!   player names
//! - [`AcceptAllHandshakeProvider`]: admits everyone without an exchange
//! - [`RejectAllHandshakeProvider`] and [`StalledHandshakeProvider`]: refuse
//!   immediately or never finish, for exercising failure paths

mod driver;
mod password;

pub use driver::{HandshakeDriver, HandshakeState};
pub use password::{HandshakeRequest, HandshakeResponse, PasswordHandshakeProvider, ResponseCode};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::connection::Connection;
use crate::errors::HandshakeFailure;

/// One admission exchange for one connection.
#[async_trait]
pub trait Handshake: Send {
    /// Run the exchange to completion.
    async fn perform(&mut self) -> Result<(), HandshakeFailure>;
}

/// Factory for per-connection handshakes.
pub trait HandshakeProvider: Send + Sync {
    /// Create the handshake for a freshly accepted connection.
    fn get_connection_handshake(&self, conn: &Arc<dyn Connection>) -> Box<dyn Handshake>;

    /// Reclaim resources once the handshake for `conn_id` concluded.
    fn release_handshake(&self, _conn_id: &str) {}

    /// Deadline override; `None` uses the server's configured timeout.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Trivial providers
// ─────────────────────────────────────────────────────────────────────────────

struct Immediate(Result<(), String>);

#[async_trait]
impl Handshake for Immediate {
    async fn perform(&mut self) -> Result<(), HandshakeFailure> {
        self.0.clone().map_err(HandshakeFailure::Rejected)
    }
}

/// Admits every connection.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAllHandshakeProvider;

impl HandshakeProvider for AcceptAllHandshakeProvider {
    fn get_connection_handshake(&self, _conn: &Arc<dyn Connection>) -> Box<dyn Handshake> {
        Box::new(Immediate(Ok(())))
    }
}

/// Refuses every connection.
#[derive(Clone, Copy, Debug, Default)]
pub struct RejectAllHandshakeProvider;

impl HandshakeProvider for RejectAllHandshakeProvider {
    fn get_connection_handshake(&self, _conn: &Arc<dyn Connection>) -> Box<dyn Handshake> {
        Box::new(Immediate(Err("server is not accepting players".to_string())))
    }
}

/// Handshakes that never finish; only the deadline resolves them.
#[derive(Clone, Copy, Debug, Default)]
pub struct StalledHandshakeProvider {
    /// Deadline override.
    pub timeout: Option<Duration>,
}

struct Stalled;

#[async_trait]
impl Handshake for Stalled {
    async fn perform(&mut self) -> Result<(), HandshakeFailure> {
        futures::future::pending().await
    }
}

impl HandshakeProvider for StalledHandshakeProvider {
    fn get_connection_handshake(&self, _conn: &Arc<dyn Connection>) -> Box<dyn Handshake> {
        Box::new(Stalled)
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}
