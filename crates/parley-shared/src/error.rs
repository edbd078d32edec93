use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the realtime conversation engine.
///
/// Retryable variants are handled internally by the subscription state
/// machine up to its retry budget; the rest reject the calling operation
/// immediately.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Transient transport failure: {0}")]
    Network(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Message quota exceeded ({used}/{limit})")]
    Quota { used: u64, limit: u64 },

    #[error("Circuit open, retry after {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    #[error("Subscription timed out")]
    SubscriptionTimeout,

    #[error("Retry budget exhausted after {attempts} attempts")]
    PermanentFailure { attempts: u32 },

    #[error("Not connected to this conversation")]
    NotConnected,

    #[error("Transport channel closed")]
    ChannelClosed,
}

impl EngineError {
    /// Whether the subscription state machine may retry this error
    /// automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Network(_) | EngineError::SubscriptionTimeout | EngineError::ChannelClosed
        )
    }
}
