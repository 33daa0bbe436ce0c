//! Signaling client that turns WebRTC offers into connections.
//!
//! The listener logs in to a rendezvous service under the server's name, then
//! answers every offer addressed to it. Once a peer's data channel opens, the
//! resulting [`WebRtcConnection`] goes through the same admission path as a
//! socket peer.
//!
//! Losing the signaling socket triggers a bounded, doubling backoff. When the
//! attempt budget runs out, or the service refuses the login, the whole server
//! is closed.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use metrics::counter;
use parking_lot::Mutex;
use tavern_core::retry::{ReconnectPolicy, ReconnectState};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use webrtc::api::API;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::connection::WebRtcConnection;
use super::signaling::SignalingMessage;
use super::{build_api, rtc_configuration};
use crate::config::ServerConfig;
use crate::connection::{Connection, TransportKind};
use crate::errors::ServerError;
use crate::metrics::{CONNECTIONS_ACCEPTED_TOTAL, SIGNALING_RECONNECTS_TOTAL};
use crate::server::{ConnectionServer, WeakServer};
use crate::shutdown::join_bounded;
use crate::transport::{LISTENER_JOIN_TIMEOUT, Listener};

/// Bound on opening the signaling socket, TCP connect plus WebSocket upgrade.
pub const SIGNALING_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type SignalingStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PeerMap = Arc<Mutex<HashMap<String, Arc<RTCPeerConnection>>>>;

/// How a signaling session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// The listener is closing.
    Closed,
    /// The service refused our name.
    Rejected,
    /// The socket dropped or failed.
    Lost,
}

/// What one inbound signaling message asks the session to do.
enum Step {
    Continue,
    LoggedIn,
    Rejected,
}

/// Accepts WebRTC peers brokered by a signaling service.
pub struct WebRtcListener {
    name: String,
    signaling_url: String,
    rtc_config: RTCConfiguration,
    policy: ReconnectPolicy,
    peers: PeerMap,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WebRtcListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcListener")
            .field("name", &self.name)
            .field("signaling_url", &self.signaling_url)
            .field("peers", &self.peers.lock().len())
            .finish_non_exhaustive()
    }
}

impl WebRtcListener {
    /// Listener for `config.signaling_url`, logging in as `config.name`.
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            name: config.name.clone(),
            signaling_url: config.signaling_url.clone(),
            rtc_config: rtc_configuration(&config.ice_servers),
            policy: config.reconnect,
            peers: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Remote identities with a tracked peer connection.
    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.peers.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl Listener for WebRtcListener {
    fn transport(&self) -> TransportKind {
        TransportKind::WebRtc
    }

    async fn start(&self, server: ConnectionServer) -> Result<(), ServerError> {
        let api = Arc::new(build_api()?);
        let stream = connect(&self.signaling_url).await?;
        info!(url = %self.signaling_url, name = %self.name, "connected to signaling service");

        let client = SignalingClient {
            name: self.name.clone(),
            url: self.signaling_url.clone(),
            api,
            rtc_config: self.rtc_config.clone(),
            peers: Arc::clone(&self.peers),
            server: server.downgrade(),
        };
        let handle = tokio::spawn(client.run(stream, ReconnectState::new(self.policy), self.cancel.clone()));
        *self.task.lock() = Some(handle);
        Ok(())
    }

    async fn close(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if !join_bounded(handle, LISTENER_JOIN_TIMEOUT).await {
                warn!(url = %self.signaling_url, "signaling task did not stop in time");
            }
        }

        let peers: Vec<_> = self.peers.lock().drain().map(|(_, peer)| peer).collect();
        for peer in peers {
            if let Err(error) = peer.close().await {
                debug!(%error, "peer connection close failed");
            }
        }
        debug!(url = %self.signaling_url, "webrtc listener closed");
    }
}

async fn connect(url: &str) -> Result<SignalingStream, ServerError> {
    let attempt = tokio::time::timeout(SIGNALING_CONNECT_TIMEOUT, connect_async(url))
        .await
        .map_err(|_| {
            ServerError::Signaling(format!(
                "connect to {url}: no handshake within {SIGNALING_CONNECT_TIMEOUT:?}"
            ))
        })?;
    let (stream, _response) =
        attempt.map_err(|e| ServerError::Signaling(format!("connect to {url}: {e}")))?;
    Ok(stream)
}

// ─────────────────────────────────────────────────────────────────────────────
// Signaling session
// ─────────────────────────────────────────────────────────────────────────────

struct SignalingClient {
    name: String,
    url: String,
    api: Arc<API>,
    rtc_config: RTCConfiguration,
    peers: PeerMap,
    server: WeakServer,
}

impl SignalingClient {
    async fn run(self, first: SignalingStream, mut reconnect: ReconnectState, cancel: CancellationToken) {
        let mut stream = Some(first);
        loop {
            let end = match stream.take() {
                Some(ws) => self.session(ws, &mut reconnect, &cancel).await,
                None => {
                    let connected = tokio::select! {
                        connected = connect(&self.url) => connected,
                        () = cancel.cancelled() => return,
                    };
                    match connected {
                        Ok(ws) => {
                            info!(url = %self.url, "reconnected to signaling service");
                            self.session(ws, &mut reconnect, &cancel).await
                        }
                        Err(error) => {
                            warn!(%error, "signaling reconnect failed");
                            SessionEnd::Lost
                        }
                    }
                }
            };

            match end {
                SessionEnd::Closed => reconnect.expect_disconnect(),
                SessionEnd::Rejected => {
                    error!(name = %self.name, "signaling service refused login, name already in use");
                    self.stop_server();
                    return;
                }
                SessionEnd::Lost => {}
            }

            let Some(delay) = reconnect.next_delay() else {
                if !reconnect.is_disconnect_expected() {
                    error!(
                        url = %self.url,
                        attempts = reconnect.attempts(),
                        "signaling retries exhausted, stopping server"
                    );
                    self.stop_server();
                }
                return;
            };
            counter!(SIGNALING_RECONNECTS_TOTAL).increment(1);
            warn!(url = %self.url, attempt = reconnect.attempts(), ?delay, "signaling lost, reconnecting");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => return,
            }
        }
    }

    async fn session(
        &self,
        ws: SignalingStream,
        reconnect: &mut ReconnectState,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let (mut sink, mut source) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SignalingMessage>();
        let _ = out_tx.send(SignalingMessage::login(&self.name));

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    let _ = sink.close().await;
                    return SessionEnd::Closed;
                }
                Some(msg) = out_rx.recv() => {
                    let text = match msg.to_text() {
                        Ok(text) => text,
                        Err(error) => {
                            warn!(%error, "failed to encode signaling message");
                            continue;
                        }
                    };
                    if let Err(error) = sink.send(Message::Text(text.into())).await {
                        warn!(%error, "failed to send signaling message");
                        return SessionEnd::Lost;
                    }
                }
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        match self.on_signal(text.as_str(), &out_tx).await {
                            Step::Continue => {}
                            Step::LoggedIn => reconnect.reset(),
                            Step::Rejected => return SessionEnd::Rejected,
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(url = %self.url, "signaling socket closed");
                        return SessionEnd::Lost;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        warn!(%error, "signaling socket failed");
                        return SessionEnd::Lost;
                    }
                },
            }
        }
    }

    async fn on_signal(&self, text: &str, out: &mpsc::UnboundedSender<SignalingMessage>) -> Step {
        let msg = match SignalingMessage::from_text(text) {
            Ok(msg) => msg,
            Err(error) => {
                warn!(%error, "malformed signaling message");
                return Step::Continue;
            }
        };

        match msg {
            SignalingMessage::Login { success: Some(false), .. } => Step::Rejected,
            SignalingMessage::Login { .. } => {
                info!(name = %self.name, "logged in to signaling service");
                Step::LoggedIn
            }
            SignalingMessage::Offer {
                source,
                destination,
                offer,
            } => {
                if destination != self.name {
                    debug!(%source, %destination, "ignoring offer for another server");
                } else if let Err(error) = self.accept_offer(&source, offer, out).await {
                    warn!(peer = %source, %error, "failed to answer offer");
                }
                Step::Continue
            }
            SignalingMessage::Candidate { source, candidate, .. } => {
                self.add_candidate(&source, candidate).await;
                Step::Continue
            }
            SignalingMessage::Answer { source, .. } => {
                debug!(peer = %source, "ignoring unsolicited answer");
                Step::Continue
            }
            SignalingMessage::Unknown => {
                debug!(raw = text, "ignoring unknown signaling message");
                Step::Continue
            }
        }
    }

    async fn accept_offer(
        &self,
        peer_id: &str,
        offer: RTCSessionDescription,
        out: &mpsc::UnboundedSender<SignalingMessage>,
    ) -> Result<(), ServerError> {
        let Some(server) = self.server.upgrade() else {
            return Err(ServerError::Closed);
        };

        let peer = Arc::new(self.api.new_peer_connection(self.rtc_config.clone()).await?);
        let previous = self.peers.lock().insert(peer_id.to_owned(), Arc::clone(&peer));
        if let Some(previous) = previous {
            debug!(peer = peer_id, "replacing peer connection");
            let _close = tokio::spawn(async move {
                let _ = previous.close().await;
            });
        }

        self.watch_peer(peer_id, &peer, out.clone(), &server);

        peer.set_remote_description(offer).await?;
        let answer = peer.create_answer(None).await?;
        peer.set_local_description(answer.clone()).await?;
        let _ = out.send(SignalingMessage::Answer {
            source: self.name.clone(),
            destination: peer_id.to_owned(),
            answer,
        });
        debug!(peer = peer_id, "answered offer");
        Ok(())
    }

    fn watch_peer(
        &self,
        peer_id: &str,
        peer: &Arc<RTCPeerConnection>,
        out: mpsc::UnboundedSender<SignalingMessage>,
        server: &ConnectionServer,
    ) {
        let local = self.name.clone();
        let remote = peer_id.to_owned();
        peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(candidate) => {
                        let _ = out.send(SignalingMessage::Candidate {
                            source: local.clone(),
                            destination: remote.clone(),
                            candidate,
                        });
                    }
                    Err(error) => debug!(%error, "failed to serialize ICE candidate"),
                }
            }
            Box::pin(async {})
        }));

        // Set once the data channel opens.
        let opened_conn: Arc<Mutex<Option<Weak<WebRtcConnection>>>> = Arc::new(Mutex::new(None));

        let peers = Arc::clone(&self.peers);
        let remote = peer_id.to_owned();
        let weak_peer = Arc::downgrade(peer);
        let watched = Arc::clone(&opened_conn);
        peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            if state == RTCPeerConnectionState::Disconnected {
                debug!(peer = %remote, "peer connection interrupted, waiting for ICE to recover");
            }
            if ends_peer(state) {
                debug!(peer = %remote, %state, "peer connection lost");
                let conn = watched.lock().as_ref().and_then(Weak::upgrade);
                if let Some(conn) = conn {
                    let _ = conn.state().mark_dead("peer connection lost");
                }
                let mut peers = peers.lock();
                let tracked = peers
                    .get(&remote)
                    .is_some_and(|p| std::ptr::eq(Arc::as_ptr(p), weak_peer.as_ptr()));
                if tracked {
                    let _ = peers.remove(&remote);
                }
            }
            Box::pin(async {})
        }));

        let server = server.downgrade();
        let remote = peer_id.to_owned();
        let weak_peer = Arc::downgrade(peer);
        peer.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let server = server.clone();
            let remote = remote.clone();
            let weak_peer = weak_peer.clone();
            let opened_conn = Arc::clone(&opened_conn);
            let opened = Arc::clone(&channel);
            channel.on_open(Box::new(move || {
                if let (Some(server), Some(peer)) = (server.upgrade(), weak_peer.upgrade()) {
                    counter!(CONNECTIONS_ACCEPTED_TOTAL, "transport" => "webrtc").increment(1);
                    debug!(conn_id = %remote, label = opened.label(), "data channel open");
                    let codec = server.config().payload_codec();
                    let conn = WebRtcConnection::spawn(remote, peer, opened, codec);
                    *opened_conn.lock() = Some(Arc::downgrade(&conn));
                    server.handle_connection(conn);
                }
                Box::pin(async {})
            }));
            Box::pin(async {})
        }));
    }

    async fn add_candidate(&self, peer_id: &str, candidate: RTCIceCandidateInit) {
        let peer = self.peers.lock().get(peer_id).cloned();
        let Some(peer) = peer else {
            debug!(peer = peer_id, "candidate for unknown peer");
            return;
        };
        if let Err(error) = peer.add_ice_candidate(candidate).await {
            debug!(peer = peer_id, %error, "failed to add ICE candidate");
        }
    }

    fn stop_server(&self) {
        if let Some(server) = self.server.upgrade() {
            // Closing the server closes this listener, which joins this task.
            let _close = tokio::spawn(async move { server.close().await });
        }
    }
}

/// Whether a peer connection in `state` can no longer carry data.
///
/// `Disconnected` is left out: ICE may still recover from it, and a peer that
/// never does moves on to `Failed`.
fn ends_peer(state: RTCPeerConnectionState) -> bool {
    matches!(state, RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed)
}
