//! TCP transport.
//!
//! Each accepted stream carries length-prefixed frames in both directions.
//! The listener's accept loop never waits on a handshake; it hands every new
//! stream to [`ConnectionServer::handle_connection`] and goes straight back to
//! `accept()`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use metrics::counter;
use parking_lot::Mutex;
use tavern_core::compression::PayloadCodec;
use tavern_core::framing::FrameCodec;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::connection::{Connection, ConnectionState, TransportKind};
use crate::errors::ServerError;
use crate::metrics::CONNECTIONS_ACCEPTED_TOTAL;
use crate::server::{ConnectionServer, WeakServer};
use crate::shutdown::join_bounded;
use crate::transport::{LISTENER_JOIN_TIMEOUT, Listener};

/// How long one frame write may stall before the peer is considered gone.
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause after a failed `accept()` so a persistent error (e.g. fd
/// exhaustion) does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

// ─────────────────────────────────────────────────────────────────────────────
// Connection
// ─────────────────────────────────────────────────────────────────────────────

/// A peer connected over TCP.
pub struct SocketConnection {
    state: ConnectionState,
    remote: SocketAddr,
}

impl SocketConnection {
    /// Wrap `stream` and start its reader and writer tasks.
    pub fn spawn(stream: TcpStream, id: String, remote: SocketAddr, codec: PayloadCodec) -> Arc<Self> {
        let _ = stream.set_nodelay(true);
        let conn = Arc::new(Self {
            state: ConnectionState::new(id, codec),
            remote,
        });

        let max_wire = codec.max_wire_size();
        let (read, write) = stream.into_split();
        let _reader = tokio::spawn(run_reader(
            Arc::clone(&conn),
            FramedRead::new(read, FrameCodec::new(max_wire)),
        ));
        let _writer = tokio::spawn(run_writer(
            Arc::clone(&conn),
            FramedWrite::new(write, FrameCodec::new(max_wire)),
        ));
        conn
    }

    /// Remote address of the peer.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}

impl Connection for SocketConnection {
    fn state(&self) -> &ConnectionState {
        &self.state
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Socket
    }
}

#[instrument(skip_all, fields(conn_id = conn.state.id(), remote = %conn.remote))]
async fn run_reader(conn: Arc<SocketConnection>, mut frames: FramedRead<OwnedReadHalf, FrameCodec>) {
    let cancel = conn.state.cancellation();
    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(wire)) => conn.state.deliver(wire),
                Some(Err(error)) => {
                    debug!(%error, "socket read failed");
                    let _ = conn.state.mark_dead("read failed");
                    break;
                }
                None => {
                    let _ = conn.state.mark_dead("peer closed");
                    break;
                }
            },
            () = cancel.cancelled() => break,
        }
    }
}

#[instrument(skip_all, fields(conn_id = conn.state.id(), remote = %conn.remote))]
async fn run_writer(conn: Arc<SocketConnection>, mut frames: FramedWrite<OwnedWriteHalf, FrameCodec>) {
    // Keeps draining after death so a final reply (e.g. a handshake
    // rejection) still reaches the peer.
    while let Some(wire) = conn.state.next_outbound().await {
        match tokio::time::timeout(WRITE_TIMEOUT, frames.send(wire)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                debug!(%error, "socket write failed");
                let _ = conn.state.mark_dead("write failed");
                return;
            }
            Err(_) => {
                warn!(timeout = ?WRITE_TIMEOUT, "socket write stalled");
                let _ = conn.state.mark_dead("write timed out");
                return;
            }
        }
    }
    let _ = frames.close().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Listener
// ─────────────────────────────────────────────────────────────────────────────

/// Accepts TCP peers for a [`ConnectionServer`].
pub struct SocketListener {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    suppress_errors: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SocketListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketListener")
            .field("local_addr", &self.local_addr)
            .field("started", &self.listener.lock().is_none())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl SocketListener {
    /// Bind the listening socket. Port 0 picks an ephemeral port.
    pub async fn bind(addr: impl ToSocketAddrs + std::fmt::Display) -> Result<Self, ServerError> {
        let shown = addr.to_string();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr: shown, source })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            cancel: CancellationToken::new(),
            suppress_errors: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Listener for SocketListener {
    fn transport(&self) -> TransportKind {
        TransportKind::Socket
    }

    async fn start(&self, server: ConnectionServer) -> Result<(), ServerError> {
        let listener = self.listener.lock().take().ok_or(ServerError::Closed)?;
        info!(addr = %self.local_addr, name = %server.name(), "socket listener accepting");
        let handle = tokio::spawn(accept_loop(
            listener,
            server.downgrade(),
            self.cancel.clone(),
            Arc::clone(&self.suppress_errors),
        ));
        *self.task.lock() = Some(handle);
        Ok(())
    }

    async fn close(&self) {
        self.suppress_errors.store(true, Ordering::Release);
        self.cancel.cancel();
        // Never started: dropping the socket is all there is to do.
        drop(self.listener.lock().take());

        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if !join_bounded(handle, LISTENER_JOIN_TIMEOUT).await {
                warn!(addr = %self.local_addr, "accept loop did not stop in time");
            }
        }
        debug!(addr = %self.local_addr, "socket listener closed");
    }
}

async fn accept_loop(
    listener: TcpListener,
    server: WeakServer,
    cancel: CancellationToken,
    suppress_errors: Arc<AtomicBool>,
) {
    let mut next_id: u64 = 0;
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            () = cancel.cancelled() => break,
        };
        match accepted {
            Ok((stream, remote)) => {
                let Some(server) = server.upgrade() else {
                    break;
                };
                counter!(CONNECTIONS_ACCEPTED_TOTAL, "transport" => "socket").increment(1);
                let id = format!("{}-{next_id}", remote.ip());
                next_id += 1;
                debug!(conn_id = %id, %remote, "accepted socket");
                let conn = SocketConnection::spawn(stream, id, remote, server.config().payload_codec());
                server.handle_connection(conn);
            }
            Err(error) => {
                if suppress_errors.load(Ordering::Acquire) {
                    debug!(%error, "accept failed during close");
                    break;
                }
                error!(%error, "accept failed");
                tokio::select! {
                    () = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                    () = cancel.cancelled() => break,
                }
            }
        }
    }
    debug!("accept loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use tavern_core::framing::encode_frame;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn pair(codec: PayloadCodec) -> (Arc<SocketConnection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_side, remote) = listener.accept().await.unwrap();
        (SocketConnection::spawn(server_side, "peer-0".into(), remote, codec), client)
    }

    async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
        let len = stream.read_u32().await.unwrap() as usize;
        let mut buf = vec![0; len];
        let _ = stream.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (conn, mut client) = pair(PayloadCodec::new(false, 1024)).await;

        client.write_all(&encode_frame(b"ping", 1024).unwrap()).await.unwrap();
        assert_eq!(conn.recv().await.unwrap(), Bytes::from_static(b"ping"));

        conn.send(None, Bytes::from_static(b"pong")).unwrap();
        assert_eq!(read_frame(&mut client).await, b"pong");
    }

    #[tokio::test]
    async fn compressed_frames_are_inflated() {
        let codec = PayloadCodec::new(true, 1024);
        let (conn, mut client) = pair(codec).await;

        let wire = codec.encode(Bytes::from_static(b"initiative order")).unwrap();
        client.write_all(&encode_frame(&wire, 2048).unwrap()).await.unwrap();
        assert_eq!(conn.recv().await.unwrap(), Bytes::from_static(b"initiative order"));
    }

    #[tokio::test]
    async fn peer_hangup_marks_dead() {
        let (conn, client) = pair(PayloadCodec::new(false, 1024)).await;
        drop(client);
        assert!(conn.recv().await.is_none());
        assert!(!conn.is_alive());
    }

    #[tokio::test]
    async fn oversized_frame_kills_connection() {
        let (conn, mut client) = pair(PayloadCodec::new(false, 8)).await;
        client.write_all(&encode_frame(&[0; 64], 1024).unwrap()).await.unwrap();
        assert!(conn.recv().await.is_none());
        assert!(!conn.is_alive());
    }

    #[tokio::test]
    async fn queued_reply_is_flushed_after_close() {
        let (conn, mut client) = pair(PayloadCodec::new(false, 1024)).await;
        conn.send(None, Bytes::from_static(b"goodbye")).unwrap();
        conn.close();
        assert_eq!(read_frame(&mut client).await, b"goodbye");
        let mut rest = Vec::new();
        let _ = client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let first = SocketListener::bind("127.0.0.1:0").await.unwrap();
        let taken = first.local_addr().to_string();
        assert_matches!(
            SocketListener::bind(taken.as_str()).await,
            Err(ServerError::Bind { addr, .. }) if addr == taken
        );
    }

    #[tokio::test]
    async fn debug_shows_bound_address() {
        let listener = SocketListener::bind("127.0.0.1:0").await.unwrap();
        let shown = format!("{listener:?}");
        assert!(shown.contains(&listener.local_addr().to_string()));
        assert!(shown.contains("started: false"));
    }
}
