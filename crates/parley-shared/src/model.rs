//! Domain model structs exchanged with the transport and handed to the UI
//! layer.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be passed
//! directly across an IPC or FFI boundary without remapping.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConversationId, MessageId, UserId};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// What kind of utterance a message carries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Voice,
    System,
}

/// Aggregate of reactions on a message: emoji -> contributing users.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReactionSummary {
    pub by_emoji: BTreeMap<String, BTreeSet<UserId>>,
}

impl ReactionSummary {
    pub fn count(&self, emoji: &str) -> usize {
        self.by_emoji.get(emoji).map(|u| u.len()).unwrap_or(0)
    }
}

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Server-assigned id, or a `temp-` id while optimistic.
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub body: String,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    pub read: bool,
    /// The message this one replies to, if any.
    pub reply_to: Option<MessageId>,
    pub reactions: Option<ReactionSummary>,
    /// Remote reference to the audio blob for voice messages.
    pub audio_url: Option<String>,
    /// Voice message duration in seconds.
    pub audio_duration_secs: Option<u32>,
}

impl Message {
    /// Minimal constructor for a plain message; optional fields default off.
    pub fn new(
        id: MessageId,
        conversation_id: ConversationId,
        sender_id: UserId,
        sender_name: impl Into<String>,
        body: impl Into<String>,
        kind: MessageKind,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            conversation_id,
            sender_id,
            sender_name: sender_name.into(),
            body: body.into(),
            kind,
            created_at,
            read: false,
            reply_to: None,
            reactions: None,
            audio_url: None,
            audio_duration_secs: None,
        }
    }
}

/// Lifecycle of a cached message entry.
///
/// `Failed` is distinct from `Optimistic` so the UI can offer a retry
/// affordance without losing the drafted content.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageLifecycle {
    /// Created locally, not yet acknowledged by the transport.
    Optimistic,
    /// Acknowledged by the transport, server-confirmed row not yet seen.
    Sent,
    /// Seen as a server row (insert/update event or history load).
    Confirmed,
    /// The send was rejected or the transport reported an error.
    Failed,
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

/// One member in a conversation's presence snapshot.
///
/// Derived wholesale from every presence-sync event and never partially
/// mutated, so a missed join/leave cannot cause permanent drift.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceMember {
    pub user_id: UserId,
    pub display_name: String,
    pub online: bool,
    pub joined_at: DateTime<Utc>,
    pub role: Option<String>,
}

// ---------------------------------------------------------------------------
// Typing
// ---------------------------------------------------------------------------

/// Ephemeral typing signal.  A zero (epoch) timestamp is the sentinel for
/// "stopped typing"; live signals auto-expire after a few seconds unless
/// refreshed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypingSignal {
    pub user_id: UserId,
    pub display_name: String,
    pub timestamp: DateTime<Utc>,
}

impl TypingSignal {
    pub fn started(user_id: UserId, display_name: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            timestamp: at,
        }
    }

    /// Build the stop-typing sentinel for a user.
    pub fn stopped(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            timestamp: DateTime::UNIX_EPOCH,
        }
    }

    /// Whether this signal is the stop sentinel.
    pub fn is_stop(&self) -> bool {
        self.timestamp.timestamp() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_sentinel() {
        let stop = TypingSignal::stopped(UserId::from("u1"), "Ann");
        assert!(stop.is_stop());

        let start = TypingSignal::started(UserId::from("u1"), "Ann", Utc::now());
        assert!(!start.is_stop());
    }

    #[test]
    fn test_reaction_count() {
        let mut summary = ReactionSummary::default();
        summary
            .by_emoji
            .entry("❤️".to_string())
            .or_default()
            .insert(UserId::from("u1"));
        summary
            .by_emoji
            .entry("❤️".to_string())
            .or_default()
            .insert(UserId::from("u2"));

        assert_eq!(summary.count("❤️"), 2);
        assert_eq!(summary.count("👍"), 0);
    }
}
