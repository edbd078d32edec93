//! Realtime conversation engine.
//!
//! Maintains live, ordered, deduplicated conversation state over an
//! unreliable pub/sub transport: message deduplication and optimistic-write
//! reconciliation, subscription lifecycle with backoff and health checks,
//! presence and typing coordination, and adaptive batching with quota and
//! circuit-breaker gating.
//!
//! The engine is an in-process library; the UI layer registers listeners
//! with [`RealtimeConversationEngine::on_messages`] and friends and calls
//! the async operations (`join_conversation`, `send_message`, ...).

pub mod cache;
pub mod config;
pub mod conversation;
pub mod engine;
pub mod governor;
pub mod presence;
pub mod subscription;

pub use cache::{Admission, CacheEntry, MessageCache, RejectReason};
pub use config::EngineConfig;
pub use engine::RealtimeConversationEngine;
pub use governor::{MessageEvent, Priority, QuotaLedger, QuotaLevel, QuotaUsage};
pub use presence::{PresenceRoster, TypingTracker};
pub use subscription::{backoff_delay, SubscriptionState, SubscriptionStatus, Transition};
