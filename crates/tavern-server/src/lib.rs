//! # tavern-server
//!
//! Multi-transport connection server.
//!
//! - [`connection::Connection`]: one duplex byte channel, backed by a TCP
//!   socket or a WebRTC data channel
//! - [`handshake`]: pluggable admission exchange run before registration
//! - [`server::ConnectionServer`]: registry, broadcast, targeted send, reaping,
//!   observer events
//! - [`dispatch`]: single-worker queue between transports and the
//!   application [`dispatch::MessageHandler`]
//! - [`transport`]: socket and WebRTC/signaling listeners
//! - Graceful shutdown via `CancellationToken` with a bounded join

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod errors;
pub mod handshake;
pub mod metrics;
pub mod observer;
mod reaper;
pub mod server;
pub mod shutdown;
pub mod transport;

pub use config::ServerConfig;
pub use connection::{Connection, ConnectionState, TransportKind};
pub use dispatch::MessageHandler;
pub use errors::{HandshakeFailure, SendError, ServerError};
pub use observer::ServerObserver;
pub use server::ConnectionServer;
pub use tavern_core::outbound::ChannelTag;
