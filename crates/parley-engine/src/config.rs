//! Engine configuration.
//!
//! Every knob defaults to the values in `parley_shared::constants`;
//! embedders override only what they need.

use std::time::Duration;

use parley_shared::constants::*;

/// Tuning configuration for [`crate::RealtimeConversationEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Optimistic-write reconciliation window.
    pub reconcile_window: Duration,
    /// Per-conversation cache ceiling before overflow eviction.
    pub cache_ceiling: usize,
    /// Automatic reconnect attempts before permanent failure.
    pub retry_budget: u32,
    /// Backoff base delay for attempt 1.
    pub backoff_base: Duration,
    /// Backoff cap.
    pub backoff_cap: Duration,
    /// Upper bound (exclusive) of backoff jitter.
    pub backoff_jitter: Duration,
    /// Interval between transport liveness probes.
    pub health_check_interval: Duration,
    /// Probe round-trips slower than this count as failures.
    pub health_staleness: Duration,
    /// Debounce for outbound start-typing broadcasts.
    pub typing_debounce: Duration,
    /// Received start-typing signals expire after this long.
    pub typing_expiry: Duration,
    /// Max typing notifications per second, per conversation.
    pub typing_notify_per_sec: u32,
    /// Initial inbound batching window.
    pub batch_window: Duration,
    /// Adaptive batching window bounds.
    pub batch_window_min: Duration,
    pub batch_window_max: Duration,
    /// Callback latency above which the window widens.
    pub batch_latency_threshold: Duration,
    /// Immediate-flush backlog sizes per priority tier.
    pub high_water_high: usize,
    pub high_water_normal: usize,
    pub high_water_low: usize,
    /// Rolling message allowance shared across conversations.
    pub quota_allowance: u64,
    /// Allowance reset interval.
    pub quota_reset_interval: Duration,
    /// Warning / critical thresholds as fractions of the allowance.
    pub quota_warning_ratio: f64,
    pub quota_critical_ratio: f64,
    /// Consecutive failures that open a conversation's circuit.
    pub circuit_failure_threshold: u32,
    /// How long an open circuit refuses subscribe attempts.
    pub circuit_open_window: Duration,
    /// History rows fetched on subscribe.
    pub history_fetch_limit: usize,
    /// Poll interval for the concurrent-join guard.
    pub join_settle_poll: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconcile_window: Duration::from_millis(RECONCILE_WINDOW_MS as u64),
            cache_ceiling: CACHE_CEILING,
            retry_budget: RETRY_BUDGET,
            backoff_base: Duration::from_millis(BACKOFF_BASE_MS),
            backoff_cap: Duration::from_millis(BACKOFF_CAP_MS),
            backoff_jitter: Duration::from_millis(BACKOFF_JITTER_MS),
            health_check_interval: Duration::from_secs(HEALTH_CHECK_INTERVAL_SECS),
            health_staleness: Duration::from_millis(HEALTH_STALENESS_MS),
            typing_debounce: Duration::from_millis(TYPING_DEBOUNCE_MS),
            typing_expiry: Duration::from_millis(TYPING_EXPIRY_MS),
            typing_notify_per_sec: TYPING_NOTIFY_PER_SEC,
            batch_window: Duration::from_millis(BATCH_WINDOW_DEFAULT_MS),
            batch_window_min: Duration::from_millis(BATCH_WINDOW_MIN_MS),
            batch_window_max: Duration::from_millis(BATCH_WINDOW_MAX_MS),
            batch_latency_threshold: Duration::from_millis(BATCH_LATENCY_THRESHOLD_MS),
            high_water_high: HIGH_WATER_HIGH,
            high_water_normal: HIGH_WATER_NORMAL,
            high_water_low: HIGH_WATER_LOW,
            quota_allowance: QUOTA_ALLOWANCE,
            quota_reset_interval: Duration::from_secs(QUOTA_RESET_INTERVAL_SECS),
            quota_warning_ratio: QUOTA_WARNING_RATIO,
            quota_critical_ratio: QUOTA_CRITICAL_RATIO,
            circuit_failure_threshold: CIRCUIT_FAILURE_THRESHOLD,
            circuit_open_window: Duration::from_secs(CIRCUIT_OPEN_SECS),
            history_fetch_limit: HISTORY_FETCH_LIMIT,
            join_settle_poll: Duration::from_millis(JOIN_SETTLE_POLL_MS),
        }
    }
}
