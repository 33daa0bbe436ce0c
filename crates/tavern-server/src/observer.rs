//! Connect and disconnect notifications.
//!
//! The server queues an event under its registry lock and a single notifier
//! task delivers the queue in order. Observers therefore see `added` before
//! `removed` for the same connection, and may call back into the server.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::connection::Connection;

/// Receives registry membership changes.
pub trait ServerObserver: Send + Sync {
    /// A connection passed its handshake and was registered.
    fn connection_added(&self, conn: &Arc<dyn Connection>);

    /// A registered connection was removed (disconnect, reap, boot or close).
    fn connection_removed(&self, conn: &Arc<dyn Connection>);
}

/// A queued registry change.
#[derive(Debug)]
pub(crate) enum ServerEvent {
    Added(Arc<dyn Connection>),
    Removed(Arc<dyn Connection>),
}

pub(crate) type ObserverList = Arc<Mutex<Vec<Arc<dyn ServerObserver>>>>;

/// Deliver queued events until cancelled, then flush what is left.
pub(crate) async fn run_notifier(
    mut events: mpsc::UnboundedReceiver<ServerEvent>,
    observers: ObserverList,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => notify(&observers, &event),
                None => return,
            },
            () = cancel.cancelled() => break,
        }
    }
    while let Ok(event) = events.try_recv() {
        notify(&observers, &event);
    }
}

fn notify(observers: &ObserverList, event: &ServerEvent) {
    // Snapshot so observers can add or remove observers from the callback.
    let snapshot: Vec<_> = observers.lock().clone();
    for observer in snapshot {
        let outcome = catch_unwind(AssertUnwindSafe(|| match event {
            ServerEvent::Added(conn) => observer.connection_added(conn),
            ServerEvent::Removed(conn) => observer.connection_removed(conn),
        }));
        if outcome.is_err() {
            error!(?event, "server observer panicked");
        }
    }
}
