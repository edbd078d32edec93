use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a conversation (one pub/sub topic per conversation).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConversationId(pub Uuid);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Topic name on the pub/sub transport.
    pub fn to_topic(&self) -> String {
        format!("conversation:{}", self.0)
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Backend-assigned user identifier, treated as opaque.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserId(pub String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message identifier: either server-assigned, or a locally generated
/// temporary id (`temp-<uuid>`) that is retired when the server-confirmed
/// row arrives and reconciliation replaces it in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

const LOCAL_PREFIX: &str = "temp-";

impl MessageId {
    /// Generate a fresh temporary id for an optimistic local write.
    pub fn local() -> Self {
        Self(format!("{}{}", LOCAL_PREFIX, Uuid::new_v4()))
    }

    /// Whether this id is a local temporary id pending confirmation.
    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_format() {
        let id = ConversationId::new();
        assert_eq!(id.to_topic(), format!("conversation:{}", id.0));
    }

    #[test]
    fn test_local_message_id() {
        let id = MessageId::local();
        assert!(id.is_local());
        assert!(!MessageId::from("m-123").is_local());
    }

    #[test]
    fn test_local_ids_unique() {
        assert_ne!(MessageId::local(), MessageId::local());
    }

    #[test]
    fn test_conversation_id_serde_roundtrip() {
        let id = ConversationId::new();
        let json = serde_json::to_string(&id).unwrap();
        let back: ConversationId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn test_user_ids_order_lexically() {
        let mut users = std::collections::BTreeSet::new();
        users.insert(UserId::from("carol"));
        users.insert(UserId::from("alice"));
        users.insert(UserId::from("bob"));
        let ordered: Vec<_> = users.iter().map(UserId::as_str).collect();
        assert_eq!(ordered, vec!["alice", "bob", "carol"]);
    }
}
