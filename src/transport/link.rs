//! Per-adapter connection lifecycle and reconnect backoff.

use std::time::Duration;

use crate::core::constants::{
    RECONNECT_BASE_DELAY, RECONNECT_MAX_ATTEMPTS, RECONNECT_MAX_DELAY,
};

/// Connection lifecycle of one transport link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    /// Not connected; a retry may be pending.
    Disconnected,
    /// Connect attempt in flight.
    Connecting,
    /// Channel established and usable.
    Connected,
    /// Retry budget spent; only an explicit caller reconnect revives it.
    Exhausted,
}

/// Exponential-backoff reconnection policy.
///
/// Delays double per attempt from the base, capped at the maximum; after
/// `max_attempts` failures the link is declared persistently down.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on the retry delay.
    pub max_delay: Duration,
    /// Retry budget before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: RECONNECT_BASE_DELAY,
            max_delay: RECONNECT_MAX_DELAY,
            max_attempts: RECONNECT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Backoff delay for the given 1-based attempt number.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay_ms = (self.base_delay.as_millis() as u64).saturating_mul(1u64 << exp);
        Duration::from_millis(delay_ms).min(self.max_delay)
    }
}

/// State machine for one transport link, observed by the session.
///
/// `Disconnected → Connecting → Connected`; `Connected → Disconnected`
/// on close or error; back to `Connecting` automatically while the retry
/// budget lasts, then terminal `Exhausted`.
#[derive(Debug, Clone, Copy)]
pub struct LinkState {
    phase: LinkPhase,
    attempts: u32,
    policy: ReconnectPolicy,
}

impl LinkState {
    /// Fresh disconnected link with the given policy.
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            phase: LinkPhase::Disconnected,
            attempts: 0,
            policy,
        }
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> LinkPhase {
        self.phase
    }

    /// Failed connect attempts since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the retry budget is spent.
    pub fn is_exhausted(&self) -> bool {
        self.phase == LinkPhase::Exhausted
    }

    /// A connect attempt is starting.
    pub fn on_connecting(&mut self) {
        self.phase = LinkPhase::Connecting;
    }

    /// The channel came up; the retry counter resets.
    pub fn on_connected(&mut self) {
        self.phase = LinkPhase::Connected;
        self.attempts = 0;
    }

    /// The channel went down (or a connect attempt failed).
    ///
    /// Returns the backoff delay before the next retry, or `None` when
    /// the budget is exhausted and the link is persistently down.
    pub fn on_disconnected(&mut self) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts {
            self.phase = LinkPhase::Exhausted;
            return None;
        }
        self.attempts += 1;
        self.phase = LinkPhase::Disconnected;
        Some(self.policy.delay_for(self.attempts))
    }

    /// Explicit caller-initiated revival of an exhausted link.
    pub fn reset(&mut self) {
        self.phase = LinkPhase::Disconnected;
        self.attempts = 0;
    }
}
