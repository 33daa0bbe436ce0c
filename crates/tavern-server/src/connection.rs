//! The transport-agnostic connection contract.
//!
//! Every transport wraps its physical channel in a type implementing
//! [`Connection`]. The shared bookkeeping (liveness, inbound queue, outbound
//! per-channel queues, one-shot disconnect notification) lives in
//! [`ConnectionState`], so a transport only supplies the I/O tasks that move
//! bytes between the state and the wire.
//!
//! Liveness is driven by the transport: a reader that hits EOF or an error,
//! or a writer that fails, calls [`ConnectionState::mark_dead`]. An explicit
//! [`Connection::close`] does the same. The first of these wins; the flag
//! never flips back.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tavern_core::compression::PayloadCodec;
use tavern_core::outbound::{ChannelTag, OutboundQueue};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::SendError;

/// Called once with the connection id when the connection dies.
pub type DisconnectHandler = Box<dyn FnOnce(&str) + Send>;

/// Physical transport behind a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// TCP socket.
    Socket,
    /// WebRTC data channel.
    WebRtc,
}

impl TransportKind {
    /// Lowercase label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Socket => "socket",
            Self::WebRtc => "webrtc",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A duplex channel of opaque payloads to one remote peer.
///
/// Implementors provide [`Connection::state`] and [`Connection::transport`];
/// the remaining methods have defaults that delegate to the shared state.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Shared connection bookkeeping.
    fn state(&self) -> &ConnectionState;

    /// Which transport carries this connection.
    fn transport(&self) -> TransportKind;

    /// Stable id, unique within one server.
    fn id(&self) -> &str {
        self.state().id()
    }

    /// Whether the transport is still usable.
    fn is_alive(&self) -> bool {
        self.state().is_alive()
    }

    /// Queue `payload` on `channel` without waiting for the wire.
    fn send(&self, channel: Option<&ChannelTag>, payload: Bytes) -> Result<(), SendError> {
        self.state().send(channel, payload)
    }

    /// Next inbound payload, or `None` once the connection is dead and
    /// drained.
    async fn recv(&self) -> Option<Bytes> {
        self.state().recv().await
    }

    /// Tear the connection down. Idempotent.
    fn close(&self) {
        let _ = self.state().mark_dead("closed locally");
    }

    /// Install the disconnect handler, replacing any previous one.
    ///
    /// If the connection is already dead the handler runs immediately.
    fn set_disconnect_handler(&self, handler: DisconnectHandler) {
        self.state().set_disconnect_handler(handler);
    }

    /// Remove the disconnect handler, if it has not fired yet.
    fn clear_disconnect_handler(&self) {
        self.state().clear_disconnect_handler();
    }
}

impl fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("transport", &self.transport())
            .field("alive", &self.is_alive())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared state
// ─────────────────────────────────────────────────────────────────────────────

enum DisconnectSlot {
    Pending(Option<DisconnectHandler>),
    Fired,
}

/// Bookkeeping shared by every transport.
pub struct ConnectionState {
    id: String,
    alive: AtomicBool,
    cancel: CancellationToken,
    codec: PayloadCodec,
    connected_at: Instant,
    inbound_tx: mpsc::UnboundedSender<Bytes>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    outbound: OutboundQueue<Bytes>,
    disconnect: Mutex<DisconnectSlot>,
}

impl ConnectionState {
    /// Fresh, alive state.
    pub fn new(id: impl Into<String>, codec: PayloadCodec) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            id: id.into(),
            alive: AtomicBool::new(true),
            cancel: CancellationToken::new(),
            codec,
            connected_at: Instant::now(),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            outbound: OutboundQueue::new(),
            disconnect: Mutex::new(DisconnectSlot::Pending(None)),
        }
    }

    /// Connection id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the connection is alive.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// When the connection was created.
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Payload codec applied in both directions.
    pub fn codec(&self) -> PayloadCodec {
        self.codec
    }

    /// Token cancelled when the connection dies. Transport tasks select on it.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Encode and queue an outbound payload.
    pub fn send(&self, channel: Option<&ChannelTag>, payload: Bytes) -> Result<(), SendError> {
        if !self.is_alive() {
            return Err(SendError::Closed);
        }
        let max = self.codec.max_message_size();
        if payload.len() > max {
            return Err(SendError::TooLarge {
                len: payload.len(),
                max,
            });
        }
        let wire = self.codec.encode(payload)?;
        self.outbound
            .push(channel.cloned(), wire)
            .map_err(|_| SendError::Closed)
    }

    /// Next encoded payload for the writer.
    ///
    /// After death the already-queued payloads are still returned, then
    /// `None`.
    pub async fn next_outbound(&self) -> Option<Bytes> {
        self.outbound.next().await
    }

    /// Payloads waiting for the writer.
    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }

    /// Hand a wire payload from the reader to [`Self::recv`].
    ///
    /// A payload that fails to decode kills the connection.
    pub fn deliver(&self, wire: Bytes) {
        match self.codec.decode(wire) {
            Ok(payload) => {
                let _ = self.inbound_tx.send(payload);
            }
            Err(error) => {
                debug!(conn_id = %self.id, %error, "dropping connection after undecodable payload");
                let _ = self.mark_dead("undecodable payload");
            }
        }
    }

    /// Next decoded inbound payload.
    pub async fn recv(&self) -> Option<Bytes> {
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            biased;
            payload = rx.recv() => payload,
            () = self.cancel.cancelled() => rx.try_recv().ok(),
        }
    }

    /// Flip to dead, wake transport tasks and fire the disconnect handler.
    ///
    /// Returns `true` for the call that performed the transition.
    pub fn mark_dead(&self, reason: &str) -> bool {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return false;
        }
        debug!(conn_id = %self.id, reason, "connection dead");
        self.outbound.close();
        self.cancel.cancel();

        let handler = match mem::replace(&mut *self.disconnect.lock(), DisconnectSlot::Fired) {
            DisconnectSlot::Pending(handler) => handler,
            DisconnectSlot::Fired => None,
        };
        if let Some(handler) = handler {
            handler(&self.id);
        }
        true
    }

    /// Install the disconnect handler; runs it now if already dead.
    pub fn set_disconnect_handler(&self, handler: DisconnectHandler) {
        let mut slot = self.disconnect.lock();
        if let DisconnectSlot::Pending(current) = &mut *slot {
            *current = Some(handler);
            return;
        }
        drop(slot);
        handler(&self.id);
    }

    /// Drop an installed handler that has not fired.
    pub fn clear_disconnect_handler(&self) {
        if let DisconnectSlot::Pending(current) = &mut *self.disconnect.lock() {
            *current = None;
        }
    }
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionState")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .field("pending_outbound", &self.outbound.len())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
