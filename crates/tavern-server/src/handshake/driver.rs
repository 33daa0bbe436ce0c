//! Drives one handshake to a single, bounded outcome.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::Handshake;
use crate::errors::HandshakeFailure;

/// Progress of one handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    /// Created, not yet running.
    Initiated,
    /// Exchange under way.
    InProgress,
    /// Finished; `success` tells which way.
    Completed {
        /// Whether the connection may be admitted.
        success: bool,
    },
}

/// Runs a handshake on its own task with a deadline.
///
/// The outcome is produced exactly once: the exchange's own result, or
/// [`HandshakeFailure::TimedOut`] when the deadline passes first. Dropping the
/// driver aborts a handshake that is still running.
pub struct HandshakeDriver {
    state: Arc<Mutex<HandshakeState>>,
    outcome: oneshot::Receiver<Result<(), HandshakeFailure>>,
    task: JoinHandle<()>,
}

impl HandshakeDriver {
    /// Spawn `handshake` with the given deadline.
    pub fn start(mut handshake: Box<dyn Handshake>, timeout: Duration) -> Self {
        let state = Arc::new(Mutex::new(HandshakeState::Initiated));
        let (tx, outcome) = oneshot::channel();

        let task_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            *task_state.lock() = HandshakeState::InProgress;
            let result = tokio::time::timeout(timeout, handshake.perform())
                .await
                .unwrap_or(Err(HandshakeFailure::TimedOut(timeout)));
            *task_state.lock() = HandshakeState::Completed {
                success: result.is_ok(),
            };
            let _ = tx.send(result);
        });

        Self {
            state,
            outcome,
            task,
        }
    }

    /// Current progress.
    pub fn state(&self) -> HandshakeState {
        *self.state.lock()
    }

    /// `None` until completed, then whether it succeeded.
    pub fn is_successful(&self) -> Option<bool> {
        match self.state() {
            HandshakeState::Completed { success } => Some(success),
            HandshakeState::Initiated | HandshakeState::InProgress => None,
        }
    }

    /// Wait for the outcome. Call at most once.
    pub async fn wait(&mut self) -> Result<(), HandshakeFailure> {
        match (&mut self.outcome).await {
            Ok(result) => result,
            // The task panicked or was aborted before reporting.
            Err(_) => {
                *self.state.lock() = HandshakeState::Completed { success: false };
                Err(HandshakeFailure::Protocol(
                    "handshake ended without an outcome".to_string(),
                ))
            }
        }
    }
}

impl Drop for HandshakeDriver {
    fn drop(&mut self) {
        self.task.abort();
    }
}
