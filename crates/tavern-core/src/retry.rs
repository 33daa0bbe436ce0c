//! Reconnect policy and backoff bookkeeping.
//!
//! Used by the WebRTC listener to re-establish a lost signaling link:
//!
//! - [`ReconnectPolicy`]: initial delay and attempt budget
//! - [`ReconnectState`]: doubling backoff counter plus the "we asked for this
//!   disconnect" flag
//! - [`calculate_backoff_delay`]: `base * 2^attempt` without overflow

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Default delay before the first reconnect attempt, in seconds.
pub const DEFAULT_INITIAL_BACKOFF_SECS: u64 = 1;
/// Default number of reconnect attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 6;

/// Reconnect parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPolicy {
    /// Delay before the first retry (default: 1s).
    #[serde(default = "default_initial_backoff_secs")]
    pub initial_backoff_secs: u64,
    /// Retries allowed without an intervening success (default: 6).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_initial_backoff_secs() -> u64 {
    DEFAULT_INITIAL_BACKOFF_SECS
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_secs: DEFAULT_INITIAL_BACKOFF_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Initial backoff as a [`Duration`].
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs(self.initial_backoff_secs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────────────────

/// Backoff counter for one signaling client.
#[derive(Clone, Debug)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    attempts: u32,
    disconnect_expected: bool,
}

impl ReconnectState {
    /// Fresh state for `policy`.
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            disconnect_expected: false,
        }
    }

    /// Delay before the next retry, advancing the counter.
    ///
    /// Returns `None` when the disconnect was requested locally or the attempt
    /// budget is spent; the caller should stop instead of retrying.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.disconnect_expected || self.attempts >= self.policy.max_attempts {
            return None;
        }
        let secs = calculate_backoff_delay(self.attempts, self.policy.initial_backoff_secs);
        self.attempts += 1;
        Some(Duration::from_secs(secs))
    }

    /// Back to the initial delay after a successful login.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Mark the upcoming disconnect as self-initiated.
    pub fn expect_disconnect(&mut self) {
        self.disconnect_expected = true;
    }

    /// Whether the upcoming disconnect was requested locally.
    pub fn is_disconnect_expected(&self) -> bool {
        self.disconnect_expected
    }

    /// Retries scheduled since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether no further retry will be granted.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.policy.max_attempts
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backoff calculation
// ─────────────────────────────────────────────────────────────────────────────

/// Exponential backoff: `base * 2^attempt`, saturating.
///
/// `attempt` is zero-based, so the first retry waits `base`.
#[must_use]
pub fn calculate_backoff_delay(attempt: u32, base: u64) -> u64 {
    base.saturating_mul(1u64 << attempt.min(63))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
