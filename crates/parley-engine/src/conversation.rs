//! Per-conversation owned state.
//!
//! Everything belonging to one conversation membership lives in a single
//! [`ConversationState`] value: cache, subscription bookkeeping, roster,
//! typing state, batch queue, callback sets, and the driving task handle.
//! Cleanup is dropping the value; the task handle aborts on drop, so
//! cancellation on leave is structural rather than remembered.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tokio::task::JoinHandle;
use tracing::warn;

use parley_shared::{PresenceMember, TypingSignal};
use parley_transport::{ChannelHandle, PresenceMeta};

use crate::cache::MessageCache;
use crate::config::EngineConfig;
use crate::governor::{BatchQueue, MessageEvent};
use crate::presence::{PresenceRoster, TypingTracker};
use crate::subscription::{SubscriptionState, SubscriptionStatus};

/// Aborts the wrapped task when dropped.
pub struct AbortOnDrop(JoinHandle<()>);

impl AbortOnDrop {
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self(handle)
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub type MessagesCallback = Box<dyn Fn(&[MessageEvent]) + Send + Sync>;
pub type PresenceCallback = Box<dyn Fn(&[PresenceMember]) + Send + Sync>;
pub type TypingCallback = Box<dyn Fn(&TypingSignal) + Send + Sync>;
pub type StatusCallback = Box<dyn Fn(SubscriptionStatus) + Send + Sync>;

/// Registered listener sets.  Registration is additive, never one-shot.
#[derive(Default)]
pub struct Callbacks {
    pub messages: Vec<MessagesCallback>,
    pub presence: Vec<PresenceCallback>,
    pub typing: Vec<TypingCallback>,
    pub status: Vec<StatusCallback>,
}

/// All state owned by one active conversation membership.
pub struct ConversationState {
    pub local_user: PresenceMeta,
    /// Present while a channel is open; replaced on every reconnect.
    pub handle: Option<ChannelHandle>,
    pub cache: MessageCache,
    pub subscription: SubscriptionState,
    pub roster: PresenceRoster,
    pub typing: TypingTracker,
    pub batch: BatchQueue,
    pub callbacks: Callbacks,
    /// Callback panics and per-event handling errors, for diagnostics.
    pub error_count: u64,
    /// Drives the event loop; aborting it cancels every pending timer.
    pub task: Option<AbortOnDrop>,
}

impl ConversationState {
    pub fn new(local_user: PresenceMeta, config: &EngineConfig) -> Self {
        Self {
            local_user,
            handle: None,
            cache: MessageCache::new(
                config.cache_ceiling,
                config.reconcile_window.as_millis() as i64,
            ),
            subscription: SubscriptionState::new(),
            roster: PresenceRoster::new(),
            typing: TypingTracker::new(
                config.typing_debounce,
                config.typing_expiry,
                config.typing_notify_per_sec,
            ),
            batch: BatchQueue::new(config),
            callbacks: Callbacks::default(),
            error_count: 0,
            task: None,
        }
    }

    /// Deliver a message batch to every listener.  A panicking listener is
    /// counted and skipped; it never breaks delivery to the others.
    pub fn deliver_messages(&mut self, batch: &[MessageEvent]) {
        for callback in &self.callbacks.messages {
            if catch_unwind(AssertUnwindSafe(|| callback(batch))).is_err() {
                self.error_count += 1;
                warn!("Message listener panicked; continuing delivery");
            }
        }
    }

    pub fn deliver_presence(&mut self) {
        let members = self.roster.members().to_vec();
        for callback in &self.callbacks.presence {
            if catch_unwind(AssertUnwindSafe(|| callback(&members))).is_err() {
                self.error_count += 1;
                warn!("Presence listener panicked; continuing delivery");
            }
        }
    }

    pub fn deliver_typing(&mut self, signal: &TypingSignal) {
        for callback in &self.callbacks.typing {
            if catch_unwind(AssertUnwindSafe(|| callback(signal))).is_err() {
                self.error_count += 1;
                warn!("Typing listener panicked; continuing delivery");
            }
        }
    }

    pub fn deliver_status(&mut self, status: SubscriptionStatus) {
        for callback in &self.callbacks.status {
            if catch_unwind(AssertUnwindSafe(|| callback(status))).is_err() {
                self.error_count += 1;
                warn!("Status listener panicked; continuing delivery");
            }
        }
    }
}
