//! Transport adapter for the realtime conversation engine.
//!
//! The adapter is a thin, faithful mirror of the remote pub/sub primitive:
//! channel open/close, send, presence track/untrack, plus typed events
//! flowing back (row changes, presence sync, broadcasts, status changes).
//! No retry logic lives here — reconnection policy belongs to the
//! subscription state machine one layer up.

pub mod channel;
pub mod local;

pub use channel::{
    ChannelCommand, ChannelDriver, ChannelEvent, ChannelHandle, ChannelStatus, PresenceMeta,
    TransportError, EVENT_ANNOUNCEMENT, EVENT_MESSAGE, EVENT_TYPING,
};
pub use local::LocalBroker;
