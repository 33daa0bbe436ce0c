//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tavern_core::compression::PayloadCodec;
use tavern_core::framing::encode_frame;
use tavern_server::handshake::{HandshakeProvider, HandshakeRequest, HandshakeResponse};
use tavern_server::transport::SocketListener;
use tavern_server::{Connection, ConnectionServer, MessageHandler, ServerConfig, ServerObserver};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn config() -> ServerConfig {
    ServerConfig {
        name: "Game Night".into(),
        host: "127.0.0.1".into(),
        port: 0,
        handshake_timeout: Duration::from_secs(5),
        reap_interval: None,
        compression: true,
        max_message_size: 64 * 1024,
        shutdown_timeout: Duration::from_secs(2),
        ..ServerConfig::default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Recorders
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct Recorder {
    pub added: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
}

impl ServerObserver for Recorder {
    fn connection_added(&self, conn: &Arc<dyn Connection>) {
        self.added.lock().push(conn.id().to_owned());
    }

    fn connection_removed(&self, conn: &Arc<dyn Connection>) {
        self.removed.lock().push(conn.id().to_owned());
    }
}

#[derive(Default)]
pub struct Inbox {
    pub messages: Mutex<Vec<(String, Bytes)>>,
    /// Delay applied to the first message only.
    pub first_delay: Option<Duration>,
}

#[async_trait]
impl MessageHandler for Inbox {
    async fn handle_message(&self, conn_id: &str, payload: Bytes) -> anyhow::Result<()> {
        let first = self.messages.lock().is_empty();
        if first {
            if let Some(delay) = self.first_delay {
                tokio::time::sleep(delay).await;
            }
        }
        self.messages.lock().push((conn_id.to_owned(), payload));
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────────────────────────────────────

pub struct Harness {
    pub server: ConnectionServer,
    pub addr: SocketAddr,
    pub events: Arc<Recorder>,
    pub inbox: Arc<Inbox>,
}

pub async fn start(provider: Arc<dyn HandshakeProvider>, inbox: Inbox) -> Harness {
    let config = config();
    let inbox = Arc::new(inbox);
    let server = ConnectionServer::new(config.clone(), provider, inbox.clone());
    let events = Arc::new(Recorder::default());
    server.add_observer(events.clone());

    let listener = SocketListener::bind(config.bind_addr()).await.unwrap();
    let addr = listener.local_addr();
    server.start_listener(Box::new(listener)).await.unwrap();
    Harness {
        server,
        addr,
        events,
        inbox,
    }
}

pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let polled = tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

pub struct Client {
    pub stream: TcpStream,
    codec: PayloadCodec,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        let config = config();
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            codec: config.payload_codec(),
        }
    }

    pub async fn send(&mut self, payload: &[u8]) {
        let wire = self.codec.encode(Bytes::copy_from_slice(payload)).unwrap();
        let frame = encode_frame(&wire, self.codec.max_wire_size()).unwrap();
        self.stream.write_all(&frame).await.unwrap();
    }

    /// Next payload, or `None` on EOF.
    pub async fn recv(&mut self) -> Option<Bytes> {
        let len = match self.stream.read_u32().await {
            Ok(len) => len as usize,
            Err(_) => return None,
        };
        let mut wire = vec![0; len];
        let _ = self.stream.read_exact(&mut wire).await.ok()?;
        Some(self.codec.decode(Bytes::from(wire)).unwrap())
    }

    pub async fn recv_within(&mut self, limit: Duration) -> Option<Bytes> {
        tokio::time::timeout(limit, self.recv()).await.ok().flatten()
    }

    pub async fn login(&mut self, name: &str, password: &str) -> HandshakeResponse {
        let request = HandshakeRequest {
            name: name.into(),
            version: tavern_core::constants::VERSION.into(),
            password: password.into(),
        };
        self.send(&serde_json::to_vec(&request).unwrap()).await;
        let reply = tokio::time::timeout(WAIT, self.recv())
            .await
            .expect("handshake reply timed out")
            .expect("connection closed before handshake reply");
        serde_json::from_slice(&reply).unwrap()
    }
}
