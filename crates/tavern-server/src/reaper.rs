//! Periodic removal of dead connections.

use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::server::WeakServer;

/// Why the reaper loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReaperResult {
    /// The server started closing.
    Cancelled,
    /// The server was dropped without being closed.
    ServerGone,
}

/// Call [`reap_clients`](crate::ConnectionServer::reap_clients) every
/// `interval` until `cancel` fires.
///
/// The first sweep happens one full interval after start.
pub(crate) async fn run_reaper(
    server: WeakServer,
    interval: Duration,
    cancel: CancellationToken,
) -> ReaperResult {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(server) = server.upgrade() else {
                    return ReaperResult::ServerGone;
                };
                let reaped = server.reap_clients();
                if !reaped.is_empty() {
                    debug!(count = reaped.len(), "reaped dead connections");
                }
            }
            () = cancel.cancelled() => {
                return ReaperResult::Cancelled;
            }
        }
    }
}
