//! Inbound message dispatch.
//!
//! Transport readers push payloads onto one unbounded queue; a single worker
//! task hands them to the application's [`MessageHandler`] in arrival order.
//! A slow handler delays later messages but never blocks a transport, and a
//! handler that errors or panics is logged and the worker carries on.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace, warn};

/// Application-side consumer of inbound payloads.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one payload received from `conn_id`.
    async fn handle_message(&self, conn_id: &str, payload: Bytes) -> anyhow::Result<()>;
}

/// One queued inbound payload.
#[derive(Debug)]
struct Inbound {
    conn_id: Arc<str>,
    payload: Bytes,
}

/// Producer side of the dispatch queue.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Inbound>,
}

impl Dispatcher {
    /// Start the worker. It runs until `cancel` fires or every producer is
    /// dropped.
    pub fn spawn(handler: Arc<dyn MessageHandler>, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(rx, handler, cancel));
        (Self { tx }, worker)
    }

    /// Queue a payload. Returns `false` once the worker has stopped.
    pub fn submit(&self, conn_id: Arc<str>, payload: Bytes) -> bool {
        self.tx.send(Inbound { conn_id, payload }).is_ok()
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<Inbound>,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
) {
    loop {
        let inbound = tokio::select! {
            () = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(inbound) => inbound,
                None => break,
            },
        };
        counter!(crate::metrics::MESSAGES_DISPATCHED_TOTAL).increment(1);
        trace!(conn_id = %inbound.conn_id, len = inbound.payload.len(), "dispatching message");

        let call = handler.handle_message(&inbound.conn_id, inbound.payload);
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                counter!(crate::metrics::HANDLER_FAILURES_TOTAL).increment(1);
                warn!(conn_id = %inbound.conn_id, error = %error, "message handler failed");
            }
            Err(_) => {
                counter!(crate::metrics::HANDLER_FAILURES_TOTAL).increment(1);
                error!(conn_id = %inbound.conn_id, "message handler panicked");
            }
        }
    }
}
