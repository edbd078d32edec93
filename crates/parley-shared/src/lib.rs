//! Shared domain types, constants, and the error taxonomy for the
//! realtime conversation engine.

pub mod constants;
pub mod error;
pub mod model;
pub mod types;

pub use error::EngineError;
pub use model::{Message, MessageKind, MessageLifecycle, PresenceMember, ReactionSummary, TypingSignal};
pub use types::{ConversationId, MessageId, UserId};
