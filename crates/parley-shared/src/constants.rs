//! Tuning constants for the realtime conversation engine.
//!
//! `EngineConfig` in `parley-engine` exposes the knobs that embedders may
//! want to override; everything defaults to the values here.

/// Fingerprint timestamp rounding granularity in seconds.
pub const FINGERPRINT_ROUNDING_SECS: i64 = 1;

/// Window within which an optimistic entry may be reconciled against a
/// server-confirmed row (milliseconds).
pub const RECONCILE_WINDOW_MS: i64 = 5_000;

/// Maximum cached entries per conversation before overflow eviction.
pub const CACHE_CEILING: usize = 500;

/// Maximum automatic reconnect attempts before permanent failure.
pub const RETRY_BUDGET: u32 = 5;

/// Reconnect backoff base delay (milliseconds).
pub const BACKOFF_BASE_MS: u64 = 1_000;

/// Reconnect backoff cap (milliseconds).
pub const BACKOFF_CAP_MS: u64 = 30_000;

/// Upper bound (exclusive) of random backoff jitter (milliseconds).
pub const BACKOFF_JITTER_MS: u64 = 1_000;

/// Interval between transport liveness probes (seconds).
pub const HEALTH_CHECK_INTERVAL_SECS: u64 = 60;

/// A health probe round-trip slower than this counts as a failure (milliseconds).
pub const HEALTH_STALENESS_MS: u64 = 5_000;

/// Debounce applied to outbound start-typing broadcasts (milliseconds).
pub const TYPING_DEBOUNCE_MS: u64 = 500;

/// A received start-typing signal expires this long after its timestamp
/// unless refreshed (milliseconds).
pub const TYPING_EXPIRY_MS: u64 = 3_000;

/// Maximum typing notifications delivered to the UI per second, per
/// conversation.
pub const TYPING_NOTIFY_PER_SEC: u32 = 10;

/// Default inbound batching window (milliseconds).
pub const BATCH_WINDOW_DEFAULT_MS: u64 = 300;

/// Adaptive batching window bounds (milliseconds).
pub const BATCH_WINDOW_MIN_MS: u64 = 100;
pub const BATCH_WINDOW_MAX_MS: u64 = 1_000;

/// Callback processing latency above which the batching window widens
/// (milliseconds).
pub const BATCH_LATENCY_THRESHOLD_MS: u64 = 100;

/// Queued-message counts that force an immediate flush, per priority tier.
pub const HIGH_WATER_HIGH: usize = 10;
pub const HIGH_WATER_NORMAL: usize = 25;
pub const HIGH_WATER_LOW: usize = 50;

/// Rolling message allowance shared across all conversations.
pub const QUOTA_ALLOWANCE: u64 = 10_000;

/// Quota allowance reset interval (seconds).
pub const QUOTA_RESET_INTERVAL_SECS: u64 = 3_600;

/// Fraction of the allowance at which a warning is logged.
pub const QUOTA_WARNING_RATIO: f64 = 0.90;

/// Fraction of the allowance at which new sends are refused.
pub const QUOTA_CRITICAL_RATIO: f64 = 0.975;

/// Consecutive failures that open a conversation's circuit.
pub const CIRCUIT_FAILURE_THRESHOLD: u32 = 5;

/// How long an open circuit refuses subscribe attempts (seconds).
pub const CIRCUIT_OPEN_SECS: u64 = 60;

/// Poll interval while waiting for a concurrent join on the same
/// conversation to settle (milliseconds).
pub const JOIN_SETTLE_POLL_MS: u64 = 10;

/// Number of history rows fetched when a subscription is established.
pub const HISTORY_FETCH_LIMIT: usize = 50;
