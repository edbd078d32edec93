//! Batching and backpressure: inbound event coalescing with priority
//! tiers and an adaptive window, the process-wide quota ledger, and the
//! per-conversation circuit breaker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use parley_shared::{EngineError, Message, MessageId, MessageKind};

use crate::config::EngineConfig;

// ---------------------------------------------------------------------------
// Priority tiers
// ---------------------------------------------------------------------------

/// Flush-order tier for inbound events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// Voice, system, and reply messages outrank plain text; ephemeral
    /// signals ride in the low tier.
    pub fn for_message(message: &Message) -> Self {
        match message.kind {
            MessageKind::Voice | MessageKind::System => Priority::High,
            MessageKind::Text if message.reply_to.is_some() => Priority::High,
            MessageKind::Text => Priority::Normal,
        }
    }
}

/// One cache admission surfaced to `on_messages` subscribers.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub enum MessageEvent {
    /// A new confirmed message.
    Inserted(Message),
    /// A server row settled a pending optimistic entry; `retired` is the
    /// temporary id the UI should drop in place.
    Replaced {
        retired: MessageId,
        message: Message,
    },
    /// An existing message changed (edit, reaction, read flag).
    Updated(Message),
}

impl MessageEvent {
    pub fn message(&self) -> &Message {
        match self {
            MessageEvent::Inserted(m) => m,
            MessageEvent::Replaced { message, .. } => message,
            MessageEvent::Updated(m) => m,
        }
    }
}

// ---------------------------------------------------------------------------
// Batch queue
// ---------------------------------------------------------------------------

/// Per-conversation inbound batch queue.
///
/// Events accumulate until the batching window elapses, a tier's
/// high-water mark is hit, or a critical event forces an immediate flush.
/// Flushing drains tiers in priority order; ordering inside a tier is
/// FIFO.
pub struct BatchQueue {
    high: VecDeque<MessageEvent>,
    normal: VecDeque<MessageEvent>,
    low: VecDeque<MessageEvent>,
    window: Duration,
    window_min: Duration,
    window_max: Duration,
    latency_threshold: Duration,
    high_water_high: usize,
    high_water_normal: usize,
    high_water_low: usize,
    /// Set when the first event of a batch arrives; cleared on flush.
    opened_at: Option<Instant>,
    force_flush: bool,
}

impl BatchQueue {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            high: VecDeque::new(),
            normal: VecDeque::new(),
            low: VecDeque::new(),
            window: config.batch_window,
            window_min: config.batch_window_min,
            window_max: config.batch_window_max,
            latency_threshold: config.batch_latency_threshold,
            high_water_high: config.high_water_high,
            high_water_normal: config.high_water_normal,
            high_water_low: config.high_water_low,
            opened_at: None,
            force_flush: false,
        }
    }

    /// Queue an event.  `critical` marks content that must bypass the
    /// window entirely (e.g. a broadcast-to-all announcement).
    pub fn enqueue(&mut self, event: MessageEvent, priority: Priority, now: Instant, critical: bool) {
        if self.opened_at.is_none() {
            self.opened_at = Some(now);
        }
        match priority {
            Priority::High => self.high.push_back(event),
            Priority::Normal => self.normal.push_back(event),
            Priority::Low => self.low.push_back(event),
        }
        if critical {
            self.force_flush = true;
        }
    }

    /// Whether the queue should be flushed right now, ignoring the window.
    pub fn should_flush_now(&self) -> bool {
        self.force_flush
            || self.high.len() >= self.high_water_high
            || self.normal.len() >= self.high_water_normal
            || self.low.len() >= self.high_water_low
    }

    /// When the current window closes, if a batch is open.
    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|t| t + self.window)
    }

    /// Drain everything queued, high tier first, FIFO within each tier.
    pub fn flush(&mut self) -> Vec<MessageEvent> {
        let mut batch =
            Vec::with_capacity(self.high.len() + self.normal.len() + self.low.len());
        batch.extend(self.high.drain(..));
        batch.extend(self.normal.drain(..));
        batch.extend(self.low.drain(..));
        self.opened_at = None;
        self.force_flush = false;
        batch
    }

    pub fn is_empty(&self) -> bool {
        self.high.is_empty() && self.normal.is_empty() && self.low.is_empty()
    }

    /// Adapt the window to observed callback latency: widen when the
    /// consumer is slow, narrow when it keeps up.
    pub fn observe_latency(&mut self, elapsed: Duration) {
        let before = self.window;
        if elapsed > self.latency_threshold {
            self.window = (self.window * 3 / 2).min(self.window_max);
        } else {
            self.window = (self.window * 3 / 4).max(self.window_min);
        }
        if self.window != before {
            debug!(
                from_ms = before.as_millis() as u64,
                to_ms = self.window.as_millis() as u64,
                "Batch window adapted"
            );
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

// ---------------------------------------------------------------------------
// Quota ledger
// ---------------------------------------------------------------------------

/// How full the rolling allowance is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaLevel {
    Ok,
    Warning,
    Critical,
}

/// Snapshot for diagnostics.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QuotaUsage {
    pub used: u64,
    pub allowance: u64,
    pub level: QuotaLevel,
}

/// Process-wide counter of messages sent and received against a rolling
/// allowance.  Shared across all conversations; increments are atomic.
pub struct QuotaLedger {
    used: AtomicU64,
    window_start: Mutex<Instant>,
    allowance: u64,
    reset_interval: Duration,
    warning_at: u64,
    critical_at: u64,
}

impl QuotaLedger {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            used: AtomicU64::new(0),
            window_start: Mutex::new(Instant::now()),
            allowance: config.quota_allowance,
            reset_interval: config.quota_reset_interval,
            warning_at: (config.quota_allowance as f64 * config.quota_warning_ratio) as u64,
            critical_at: (config.quota_allowance as f64 * config.quota_critical_ratio) as u64,
        }
    }

    /// Count one sent or processed event.
    pub fn record(&self) -> QuotaLevel {
        self.roll_window();
        let used = self.used.fetch_add(1, Ordering::Relaxed) + 1;
        let level = self.level_for(used);
        if level == QuotaLevel::Warning {
            warn!(used, allowance = self.allowance, "Message quota nearing limit");
        }
        level
    }

    /// Refuse new sends once the critical threshold is reached.  Rejected
    /// calls never increment the counter.
    pub fn check(&self) -> Result<QuotaLevel, EngineError> {
        self.roll_window();
        let used = self.used.load(Ordering::Relaxed);
        match self.level_for(used) {
            QuotaLevel::Critical => Err(EngineError::Quota {
                used,
                limit: self.allowance,
            }),
            level => Ok(level),
        }
    }

    pub fn usage(&self) -> QuotaUsage {
        self.roll_window();
        let used = self.used.load(Ordering::Relaxed);
        QuotaUsage {
            used,
            allowance: self.allowance,
            level: self.level_for(used),
        }
    }

    pub fn is_critical(&self) -> bool {
        self.check().is_err()
    }

    fn level_for(&self, used: u64) -> QuotaLevel {
        if used >= self.critical_at {
            QuotaLevel::Critical
        } else if used >= self.warning_at {
            QuotaLevel::Warning
        } else {
            QuotaLevel::Ok
        }
    }

    fn roll_window(&self) {
        let mut start = self.window_start.lock().unwrap();
        if start.elapsed() >= self.reset_interval {
            *start = Instant::now();
            self.used.store(0, Ordering::Relaxed);
            debug!("Quota window reset");
        }
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-conversation circuit: opens after a run of consecutive failures,
/// refuses attempts for the open window, then half-opens for one trial.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    failure_threshold: u32,
    open_window: Duration,
}

impl CircuitBreaker {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            failure_threshold: config.circuit_failure_threshold,
            open_window: config.circuit_open_window,
        }
    }

    /// Gate a subscribe or send attempt.  An open circuit that has cooled
    /// down half-opens, allowing exactly one trial.
    pub fn check(&mut self, now: Instant) -> Result<(), EngineError> {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let opened = self.opened_at.unwrap_or(now);
                let elapsed = now.duration_since(opened);
                if elapsed >= self.open_window {
                    debug!("Circuit half-open, allowing one trial");
                    self.state = CircuitState::HalfOpen;
                    Ok(())
                } else {
                    Err(EngineError::CircuitOpen {
                        retry_after: self.open_window - elapsed,
                    })
                }
            }
        }
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures += 1;
        let tripped = match self.state {
            // A half-open trial failing reopens immediately.
            CircuitState::HalfOpen => true,
            _ => self.consecutive_failures >= self.failure_threshold,
        };
        if tripped {
            warn!(failures = self.consecutive_failures, "Circuit opened");
            self.state = CircuitState::Open;
            self.opened_at = Some(now);
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.state = CircuitState::Closed;
    }

    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }
}
