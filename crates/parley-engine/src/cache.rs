//! Per-conversation message cache with content-fingerprint deduplication
//! and optimistic-write reconciliation.
//!
//! The cache is the single owner of all entries for its conversation.
//! Confirmed entries are unique by fingerprint (sender + body + kind +
//! timestamp rounded to one second); optimistic entries stay outside that
//! uniqueness check until a matching server row retires them.

use std::collections::HashMap;

use chrono::Duration as ChronoDuration;
use tracing::{debug, warn};

use parley_shared::constants::FINGERPRINT_ROUNDING_SECS;
use parley_shared::{Message, MessageId, MessageLifecycle};

/// Deduplication key: sender + body + kind + rounded timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(message: &Message) -> Self {
        let rounded = message.created_at.timestamp() / FINGERPRINT_ROUNDING_SECS;
        Self(format!(
            "{}|{:?}|{}|{}",
            message.sender_id, message.kind, rounded, message.body
        ))
    }
}

/// One cached message with lifecycle bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub message: Message,
    pub lifecycle: MessageLifecycle,
    fingerprint: Fingerprint,
    /// Monotonic insertion sequence; overflow eviction keeps the highest.
    seq: u64,
}

/// Outcome of [`MessageCache::admit_remote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// New confirmed entry appended.
    Inserted,
    /// A pending optimistic entry was retired in place by this row.
    Replaced { retired: MessageId },
    /// Duplicate by id or by content fingerprint; nothing changed.
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    DuplicateId,
    DuplicateContent,
}

impl Admission {
    pub fn accepted(&self) -> bool {
        !matches!(self, Admission::Rejected(_))
    }
}

/// In-memory store of one conversation's messages.
#[derive(Debug)]
pub struct MessageCache {
    entries: Vec<CacheEntry>,
    /// Fingerprints of *confirmed* entries only.
    confirmed: HashMap<Fingerprint, MessageId>,
    ceiling: usize,
    reconcile_window_ms: i64,
    next_seq: u64,
}

impl MessageCache {
    pub fn new(ceiling: usize, reconcile_window_ms: i64) -> Self {
        Self {
            entries: Vec::new(),
            confirmed: HashMap::new(),
            ceiling,
            reconcile_window_ms,
            next_seq: 0,
        }
    }

    /// Replace all entries with a freshly loaded history page.
    ///
    /// Duplicate fingerprints inside the page keep the first occurrence.
    pub fn seed_history(&mut self, messages: Vec<Message>) {
        self.entries.clear();
        self.confirmed.clear();
        for message in messages {
            let fingerprint = Fingerprint::of(&message);
            if self.confirmed.contains_key(&fingerprint) {
                continue;
            }
            self.confirmed
                .insert(fingerprint.clone(), message.id.clone());
            let seq = self.bump_seq();
            self.entries.push(CacheEntry {
                message,
                lifecycle: MessageLifecycle::Confirmed,
                fingerprint,
                seq,
            });
        }
        self.evict_overflow();
    }

    /// Admit a server-confirmed row (insert event).
    pub fn admit_remote(&mut self, message: Message) -> Admission {
        if self.entries.iter().any(|e| e.message.id == message.id) {
            debug!(id = %message.id, "Rejecting duplicate row by id");
            return Admission::Rejected(RejectReason::DuplicateId);
        }

        let fingerprint = Fingerprint::of(&message);
        if self.confirmed.contains_key(&fingerprint) {
            debug!(id = %message.id, "Rejecting duplicate row by fingerprint");
            return Admission::Rejected(RejectReason::DuplicateContent);
        }

        if let Some(idx) = self.find_reconcilable(&message, &fingerprint) {
            let retired = self.entries[idx].message.id.clone();
            debug!(retired = %retired, confirmed = %message.id, "Reconciling optimistic entry");
            self.entries[idx] = CacheEntry {
                message: message.clone(),
                lifecycle: MessageLifecycle::Confirmed,
                fingerprint: fingerprint.clone(),
                seq: self.entries[idx].seq,
            };
            self.confirmed.insert(fingerprint, message.id);
            return Admission::Replaced { retired };
        }

        self.confirmed
            .insert(fingerprint.clone(), message.id.clone());
        let seq = self.bump_seq();
        self.entries.push(CacheEntry {
            message,
            lifecycle: MessageLifecycle::Confirmed,
            fingerprint,
            seq,
        });
        self.evict_overflow();
        Admission::Inserted
    }

    /// Insert an optimistic local write.  Always accepted.
    pub fn admit_optimistic(&mut self, message: Message) {
        let fingerprint = Fingerprint::of(&message);
        let seq = self.bump_seq();
        self.entries.push(CacheEntry {
            message,
            lifecycle: MessageLifecycle::Optimistic,
            fingerprint,
            seq,
        });
        self.evict_overflow();
    }

    /// Apply a row-update event (edit, reaction, read flag).  Unknown rows
    /// fall back to remote admission so a missed insert is self-healing.
    ///
    /// An edit changes the content fingerprint; the confirmed index follows
    /// so the pre-edit content stops blocking new rows and the post-edit
    /// content starts to.
    pub fn apply_update(&mut self, message: Message) -> Admission {
        let Some(idx) = self.entries.iter().position(|e| e.message.id == message.id) else {
            return self.admit_remote(message);
        };
        let new_fingerprint = Fingerprint::of(&message);
        let entry = &mut self.entries[idx];
        if entry.fingerprint != new_fingerprint {
            if self.confirmed.get(&entry.fingerprint) == Some(&message.id) {
                self.confirmed.remove(&entry.fingerprint);
            }
            entry.fingerprint = new_fingerprint.clone();
        }
        self.confirmed.insert(new_fingerprint, message.id.clone());
        entry.message = message;
        entry.lifecycle = MessageLifecycle::Confirmed;
        Admission::Inserted
    }

    /// Transition an entry to `Sent` once the transport acknowledged it.
    pub fn mark_sent(&mut self, id: &MessageId) -> bool {
        self.set_lifecycle(id, MessageLifecycle::Sent)
    }

    /// Transition an entry to `Failed` so the UI can offer a retry without
    /// losing the drafted content.
    pub fn mark_failed(&mut self, id: &MessageId) -> bool {
        self.set_lifecycle(id, MessageLifecycle::Failed)
    }

    /// Drop the oldest entries (by insertion order) above the ceiling,
    /// along with their fingerprints.
    pub fn evict_overflow(&mut self) {
        if self.entries.len() <= self.ceiling {
            return;
        }
        let excess = self.entries.len() - self.ceiling;
        self.entries.sort_by_key(|e| e.seq);
        for evicted in self.entries.drain(..excess) {
            if self.confirmed.get(&evicted.fingerprint) == Some(&evicted.message.id) {
                self.confirmed.remove(&evicted.fingerprint);
            }
        }
        warn!(dropped = excess, retained = self.entries.len(), "Cache overflow eviction");
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &MessageId) -> Option<&CacheEntry> {
        self.entries.iter().find(|e| e.message.id == *id)
    }

    /// All messages in insertion order.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter().map(|e| &e.message)
    }

    fn set_lifecycle(&mut self, id: &MessageId, lifecycle: MessageLifecycle) -> bool {
        match self.entries.iter_mut().find(|e| e.message.id == *id) {
            Some(entry) => {
                entry.lifecycle = lifecycle;
                true
            }
            None => false,
        }
    }

    /// Find a pending optimistic/sent entry this confirmed row settles:
    /// exact fingerprint match, or same sender and body with timestamps
    /// within the reconciliation window.
    ///
    /// Known ambiguity: a user sending two identical messages within the
    /// window can reconcile the second send against the first row.  The
    /// matching rule is kept as the product defined it rather than guessing
    /// a fix.
    fn find_reconcilable(&self, message: &Message, fingerprint: &Fingerprint) -> Option<usize> {
        self.entries.iter().position(|e| {
            if !matches!(
                e.lifecycle,
                MessageLifecycle::Optimistic | MessageLifecycle::Sent
            ) {
                return false;
            }
            if e.fingerprint == *fingerprint {
                return true;
            }
            e.message.sender_id == message.sender_id
                && e.message.body == message.body
                && (message.created_at - e.message.created_at).abs()
                    <= ChronoDuration::milliseconds(self.reconcile_window_ms)
        })
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}
