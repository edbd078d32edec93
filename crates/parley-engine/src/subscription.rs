//! Per-conversation subscription lifecycle.
//!
//! A single transition table replaces the scattered status flags the
//! underlying drivers tend to encourage.  Same-status re-entry is a no-op
//! so duplicate driver callbacks are never treated as protocol violations.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::debug;

use parley_transport::ChannelStatus;

use crate::config::EngineConfig;

/// Connection lifecycle of one conversation membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Initial state, and the state re-entered on every reconnect.
    Connecting,
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
    /// Retry budget exhausted or quota critical; only a manual re-join
    /// leaves this state.
    Failed,
}

impl From<ChannelStatus> for SubscriptionStatus {
    fn from(status: ChannelStatus) -> Self {
        match status {
            ChannelStatus::Subscribed => SubscriptionStatus::Subscribed,
            ChannelStatus::ChannelError => SubscriptionStatus::ChannelError,
            ChannelStatus::TimedOut => SubscriptionStatus::TimedOut,
            ChannelStatus::Closed => SubscriptionStatus::Closed,
        }
    }
}

impl SubscriptionStatus {
    /// Whether the status represents a retryable interruption.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::ChannelError
                | SubscriptionStatus::TimedOut
                | SubscriptionStatus::Closed
        )
    }
}

/// Result of applying a transition against the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Accepted,
    /// Same-status re-entry: idempotent, not an error.
    Noop,
    /// Not in the table; callers log and carry on.
    Rejected,
}

/// Validate a status transition without applying it.
pub fn validate_transition(from: SubscriptionStatus, to: SubscriptionStatus) -> Transition {
    use SubscriptionStatus::*;

    if from == to {
        return Transition::Noop;
    }
    let legal = match from {
        Connecting => matches!(to, Subscribed | ChannelError | TimedOut | Closed | Failed),
        Subscribed => matches!(to, ChannelError | TimedOut | Closed | Connecting | Failed),
        ChannelError | TimedOut | Closed => matches!(to, Connecting | Subscribed | Failed),
        // Terminal; a manual re-join builds a fresh state instead.
        Failed => false,
    };
    if legal {
        Transition::Accepted
    } else {
        Transition::Rejected
    }
}

/// Mutable subscription bookkeeping for one conversation.
#[derive(Debug, Clone)]
pub struct SubscriptionState {
    pub status: SubscriptionStatus,
    pub since: Instant,
    pub retries: u32,
    pub health_probes: u64,
}

impl SubscriptionState {
    pub fn new() -> Self {
        Self {
            status: SubscriptionStatus::Connecting,
            since: Instant::now(),
            retries: 0,
            health_probes: 0,
        }
    }

    /// Apply a transition; state only changes when the table accepts it.
    pub fn apply(&mut self, to: SubscriptionStatus) -> Transition {
        let outcome = validate_transition(self.status, to);
        match outcome {
            Transition::Accepted => {
                debug!(from = ?self.status, to = ?to, "Subscription transition");
                self.status = to;
                self.since = Instant::now();
            }
            Transition::Noop => {}
            Transition::Rejected => {
                debug!(from = ?self.status, to = ?to, "Ignoring illegal transition");
            }
        }
        outcome
    }
}

impl Default for SubscriptionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential backoff with jitter for reconnect attempt `attempt`
/// (1-indexed): `min(base * 2^(attempt-1), cap) + jitter[0, jitter_max)`.
pub fn backoff_delay(attempt: u32, config: &EngineConfig) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    let raw = config
        .backoff_base
        .saturating_mul(1u32 << exp)
        .min(config.backoff_cap);
    let jitter_max = config.backoff_jitter.as_millis() as u64;
    let jitter_ms = if jitter_max == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..jitter_max)
    };
    raw + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use SubscriptionStatus::*;

    #[test]
    fn test_same_status_is_noop() {
        for status in [Connecting, Subscribed, ChannelError, TimedOut, Closed, Failed] {
            assert_eq!(validate_transition(status, status), Transition::Noop);
        }
    }

    #[test]
    fn test_connect_lifecycle() {
        let mut state = SubscriptionState::new();
        assert_eq!(state.apply(Subscribed), Transition::Accepted);
        assert_eq!(state.apply(ChannelError), Transition::Accepted);
        assert_eq!(state.apply(Connecting), Transition::Accepted);
        assert_eq!(state.apply(Subscribed), Transition::Accepted);
    }

    #[test]
    fn test_illegal_transition_rejected_not_applied() {
        let mut state = SubscriptionState::new();
        state.apply(Closed);
        // closed -> channel-error requires an intervening connecting.
        assert_eq!(state.apply(ChannelError), Transition::Rejected);
        assert_eq!(state.status, Closed);
    }

    #[test]
    fn test_failed_is_terminal() {
        let mut state = SubscriptionState::new();
        state.apply(TimedOut);
        state.apply(Failed);
        assert_eq!(state.apply(Connecting), Transition::Rejected);
        assert_eq!(state.apply(Subscribed), Transition::Rejected);
        assert_eq!(state.status, Failed);
    }

    #[test]
    fn test_unexpected_close_while_subscribed() {
        let mut state = SubscriptionState::new();
        state.apply(Subscribed);
        assert_eq!(state.apply(Closed), Transition::Accepted);
        assert!(state.status.is_retryable());
    }

    #[test]
    fn test_backoff_growth_bounds() {
        let config = EngineConfig::default();
        for _ in 0..50 {
            let a1 = backoff_delay(1, &config).as_millis();
            assert!((1_000..2_000).contains(&a1), "attempt 1 was {a1}");

            let a5 = backoff_delay(5, &config).as_millis();
            assert!((16_000..17_000).contains(&a5), "attempt 5 was {a5}");

            let a6 = backoff_delay(6, &config).as_millis();
            assert!((30_000..31_000).contains(&a6), "attempt 6 was {a6}");

            let a12 = backoff_delay(12, &config).as_millis();
            assert!((30_000..31_000).contains(&a12), "attempt 12 was {a12}");
        }
    }
}
