//! A peer connected over a WebRTC data channel.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tavern_core::chunk::{CHUNK_SIZE, ChunkAssembler, split_into_chunks};
use tavern_core::compression::PayloadCodec;
use tavern_core::framing::encode_frame;
use tracing::{debug, instrument};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::peer_connection::RTCPeerConnection;

use crate::connection::{Connection, ConnectionState, TransportKind};

/// One remote peer reached through signaling.
///
/// Payloads are length-prefixed and split into [`CHUNK_SIZE`] data channel
/// messages; inbound chunks are reassembled before decoding. Peer connection
/// state is watched by the listener, which owns the peer's only state
/// handler.
pub struct WebRtcConnection {
    state: ConnectionState,
    peer: Arc<RTCPeerConnection>,
    channel: Arc<RTCDataChannel>,
}

impl WebRtcConnection {
    /// Wrap an open data channel and start its writer task.
    pub fn spawn(
        id: String,
        peer: Arc<RTCPeerConnection>,
        channel: Arc<RTCDataChannel>,
        codec: PayloadCodec,
    ) -> Arc<Self> {
        let conn = Arc::new(Self {
            state: ConnectionState::new(id, codec),
            peer,
            channel,
        });
        conn.install_callbacks();
        let _writer = tokio::spawn(run_writer(Arc::clone(&conn)));
        conn
    }

    /// Label of the underlying data channel.
    pub fn channel_label(&self) -> &str {
        self.channel.label()
    }

    fn install_callbacks(self: &Arc<Self>) {
        let assembler = Arc::new(Mutex::new(ChunkAssembler::new(
            self.state.codec().max_wire_size(),
        )));

        let weak = Arc::downgrade(self);
        self.channel.on_message(Box::new(move |msg: DataChannelMessage| {
            if let Some(conn) = weak.upgrade() {
                conn.on_chunk(&assembler, &msg.data);
            }
            Box::pin(async {})
        }));

        let weak = Arc::downgrade(self);
        self.channel.on_close(Box::new(move || {
            mark_dead(&weak, "data channel closed");
            Box::pin(async {})
        }));
    }

    fn on_chunk(&self, assembler: &Mutex<ChunkAssembler>, chunk: &Bytes) {
        let completed = assembler.lock().push(chunk);
        match completed {
            Ok(payloads) => {
                for wire in payloads {
                    self.state.deliver(wire);
                }
            }
            Err(error) => {
                debug!(conn_id = self.state.id(), %error, "bad data channel frame");
                let _ = self.state.mark_dead("bad frame");
            }
        }
    }
}

impl Connection for WebRtcConnection {
    fn state(&self) -> &ConnectionState {
        &self.state
    }

    fn transport(&self) -> TransportKind {
        TransportKind::WebRtc
    }
}

fn mark_dead(conn: &Weak<WebRtcConnection>, reason: &str) {
    if let Some(conn) = conn.upgrade() {
        let _ = conn.state.mark_dead(reason);
    }
}

#[instrument(skip_all, fields(conn_id = conn.state.id()))]
async fn run_writer(conn: Arc<WebRtcConnection>) {
    let max_wire = conn.state.codec().max_wire_size();
    'outer: while let Some(wire) = conn.state.next_outbound().await {
        let frame = match encode_frame(&wire, max_wire) {
            Ok(frame) => frame,
            Err(error) => {
                debug!(%error, "dropping unframeable payload");
                continue;
            }
        };
        for chunk in split_into_chunks(&frame, CHUNK_SIZE) {
            if let Err(error) = conn.channel.send(&chunk).await {
                debug!(%error, "data channel send failed");
                let _ = conn.state.mark_dead("send failed");
                break 'outer;
            }
        }
    }

    if let Err(error) = conn.channel.close().await {
        debug!(%error, "data channel close failed");
    }
    if let Err(error) = conn.peer.close().await {
        debug!(%error, "peer connection close failed");
    }
}
