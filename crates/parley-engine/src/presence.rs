//! Presence roster and typing state for one conversation.
//!
//! The roster is rebuilt wholesale from every presence-sync snapshot;
//! join/leave events are advisory and only trigger a resync request, so a
//! missed event can never cause permanent drift.  Typing signals are
//! debounced outbound, expired inbound, and throttled toward the UI.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use parley_shared::{PresenceMember, TypingSignal, UserId};

// ---------------------------------------------------------------------------
// Roster
// ---------------------------------------------------------------------------

/// Member list derived from the latest presence snapshot.
#[derive(Debug, Default)]
pub struct PresenceRoster {
    members: Vec<PresenceMember>,
}

impl PresenceRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole roster with a new snapshot (last-write-wins).
    /// Returns whether the roster actually changed.
    pub fn apply_snapshot(&mut self, mut snapshot: Vec<PresenceMember>) -> bool {
        snapshot.sort_by(|a, b| a.user_id.0.cmp(&b.user_id.0));
        if snapshot == self.members {
            return false;
        }
        debug!(members = snapshot.len(), "Presence snapshot applied");
        self.members = snapshot;
        true
    }

    pub fn members(&self) -> &[PresenceMember] {
        &self.members
    }

    pub fn online_count(&self) -> usize {
        self.members.iter().filter(|m| m.online).count()
    }

    pub fn is_online(&self, user: &UserId) -> bool {
        self.members.iter().any(|m| m.user_id == *user && m.online)
    }
}

// ---------------------------------------------------------------------------
// Typing
// ---------------------------------------------------------------------------

struct ActiveTyping {
    signal: TypingSignal,
    received_at: Instant,
}

/// Tracks inbound and outbound typing state for one conversation.
pub struct TypingTracker {
    active: HashMap<UserId, ActiveTyping>,
    last_start_broadcast: Option<Instant>,
    expiry: Duration,
    debounce: Duration,
    /// UI notification throttle: fixed one-second window.
    notify_window_start: Option<Instant>,
    notify_count: u32,
    notify_per_sec: u32,
}

impl TypingTracker {
    pub fn new(debounce: Duration, expiry: Duration, notify_per_sec: u32) -> Self {
        Self {
            active: HashMap::new(),
            last_start_broadcast: None,
            expiry,
            debounce,
            notify_window_start: None,
            notify_count: 0,
            notify_per_sec,
        }
    }

    /// Decide whether an outbound typing change should be broadcast now.
    ///
    /// Start signals are debounced so rapid keystrokes produce one
    /// broadcast per debounce interval; stop signals always go out and
    /// clear the debounce state.
    pub fn note_outbound(&mut self, is_typing: bool, now: Instant) -> bool {
        if !is_typing {
            self.last_start_broadcast = None;
            return true;
        }
        match self.last_start_broadcast {
            Some(last) if now.duration_since(last) < self.debounce => false,
            _ => {
                self.last_start_broadcast = Some(now);
                true
            }
        }
    }

    /// Record a received typing signal.  Returns the signal to forward to
    /// subscribers, if any (stop signals for users not known to be typing
    /// are dropped).
    pub fn observe(&mut self, signal: TypingSignal, now: Instant) -> Option<TypingSignal> {
        if signal.is_stop() {
            self.active.remove(&signal.user_id)?;
            return Some(signal);
        }
        self.active.insert(
            signal.user_id.clone(),
            ActiveTyping {
                signal: signal.clone(),
                received_at: now,
            },
        );
        Some(signal)
    }

    /// Remove signals older than the expiry and return synthetic stop
    /// signals for each.
    pub fn expire(&mut self, now: Instant) -> Vec<TypingSignal> {
        let expiry = self.expiry;
        let expired: Vec<UserId> = self
            .active
            .iter()
            .filter(|(_, a)| now.duration_since(a.received_at) >= expiry)
            .map(|(user, _)| user.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|user| self.active.remove(&user))
            .map(|a| TypingSignal::stopped(a.signal.user_id, a.signal.display_name))
            .collect()
    }

    /// Deadline of the next pending expiry, for timer scheduling.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.active
            .values()
            .map(|a| a.received_at + self.expiry)
            .min()
    }

    /// UI notification throttle: at most `notify_per_sec` deliveries per
    /// rolling one-second window.
    pub fn allow_notify(&mut self, now: Instant) -> bool {
        match self.notify_window_start {
            Some(start) if now.duration_since(start) < Duration::from_secs(1) => {
                if self.notify_count < self.notify_per_sec {
                    self.notify_count += 1;
                    true
                } else {
                    false
                }
            }
            _ => {
                self.notify_window_start = Some(now);
                self.notify_count = 1;
                true
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}
