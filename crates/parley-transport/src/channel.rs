//! Per-conversation channel: typed command/event types and the handle
//! used by the engine to talk to whatever backend drives the channel.
//!
//! A channel task services [`ChannelCommand`]s and emits [`ChannelEvent`]s,
//! so the engine never sees the backend's concrete API.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use parley_shared::{ConversationId, Message, MessageId, PresenceMember, UserId};

/// Broadcast event name for chat message rows.
pub const EVENT_MESSAGE: &str = "message";
/// Broadcast event name for typing signals.
pub const EVENT_TYPING: &str = "typing";
/// Broadcast event name for operator announcements (critical tier).
pub const EVENT_ANNOUNCEMENT: &str = "announcement";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Channel closed")]
    Closed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("History fetch failed: {0}")]
    HistoryFailed(String),
}

impl From<TransportError> for parley_shared::EngineError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Closed => parley_shared::EngineError::ChannelClosed,
            other => parley_shared::EngineError::Network(other.to_string()),
        }
    }
}

/// Presence metadata tracked for the local user on a channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceMeta {
    pub user_id: UserId,
    pub display_name: String,
    pub role: Option<String>,
}

/// Subscription status as reported by the pub/sub primitive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

/// Commands sent *into* a channel task.
#[derive(Debug)]
pub enum ChannelCommand {
    /// Publish a payload under an event name; the ack reports whether the
    /// backend accepted it.
    Send {
        event: String,
        payload: Value,
        ack: oneshot::Sender<Result<(), TransportError>>,
    },
    /// Begin tracking the local user in the channel's presence set.
    TrackPresence(PresenceMeta),
    /// Stop tracking the local user.
    UntrackPresence,
    /// Fetch the most recent rows for this conversation.
    FetchHistory {
        limit: usize,
        reply: oneshot::Sender<Result<Vec<Message>, TransportError>>,
    },
    /// Request the current full presence snapshot.
    PresenceState {
        reply: oneshot::Sender<Vec<PresenceMember>>,
    },
    /// Mark rows as read up to (and including) the given message.
    MarkRead { up_to: MessageId },
    /// Liveness probe; the reply arriving at all is the signal.
    Ping { reply: oneshot::Sender<()> },
    /// Tear the channel down.
    Close,
}

/// Events emitted *from* a channel task.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A new row was inserted for this conversation.
    RowInserted(Message),
    /// An existing row changed (edit, reaction, read flag).
    RowUpdated(Message),
    /// Full presence snapshot; always supersedes prior snapshots.
    PresenceSync(Vec<PresenceMember>),
    /// Advisory join notification; triggers a full resync upstream.
    PresenceJoin(UserId),
    /// Advisory leave notification; triggers a full resync upstream.
    PresenceLeave(UserId),
    /// An arbitrary broadcast on the channel.
    Broadcast { event: String, payload: Value },
    /// The pub/sub primitive reported a subscription status change.
    StatusChanged(ChannelStatus),
}

/// Handle to one open conversation channel.
///
/// Cheap to clone; all clones feed the same channel task.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    pub conversation: ConversationId,
    cmd_tx: mpsc::Sender<ChannelCommand>,
}

impl ChannelHandle {
    pub fn new(conversation: ConversationId, cmd_tx: mpsc::Sender<ChannelCommand>) -> Self {
        Self {
            conversation,
            cmd_tx,
        }
    }

    pub async fn send(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(ChannelCommand::Send {
                event: event.to_string(),
                payload,
                ack: ack_tx,
            })
            .await
            .map_err(|_| TransportError::Closed)?;
        ack_rx.await.map_err(|_| TransportError::Closed)?
    }

    pub async fn track_presence(&self, meta: PresenceMeta) -> Result<(), TransportError> {
        self.cmd_tx
            .send(ChannelCommand::TrackPresence(meta))
            .await
            .map_err(|_| TransportError::Closed)
    }

    pub async fn untrack_presence(&self) -> Result<(), TransportError> {
        self.cmd_tx
            .send(ChannelCommand::UntrackPresence)
            .await
            .map_err(|_| TransportError::Closed)
    }

    pub async fn fetch_history(&self, limit: usize) -> Result<Vec<Message>, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ChannelCommand::FetchHistory {
                limit,
                reply: reply_tx,
            })
            .await
            .map_err(|_| TransportError::Closed)?;
        reply_rx.await.map_err(|_| TransportError::Closed)?
    }

    pub async fn presence_state(&self) -> Result<Vec<PresenceMember>, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ChannelCommand::PresenceState { reply: reply_tx })
            .await
            .map_err(|_| TransportError::Closed)?;
        reply_rx.await.map_err(|_| TransportError::Closed)
    }

    pub async fn mark_read(&self, up_to: MessageId) -> Result<(), TransportError> {
        self.cmd_tx
            .send(ChannelCommand::MarkRead { up_to })
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Liveness probe.  Resolves when the channel task answers; the caller
    /// applies its own staleness timeout.
    pub async fn ping(&self) -> Result<(), TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ChannelCommand::Ping { reply: reply_tx })
            .await
            .map_err(|_| TransportError::Closed)?;
        reply_rx.await.map_err(|_| TransportError::Closed)
    }

    pub async fn close(&self) -> Result<(), TransportError> {
        self.cmd_tx
            .send(ChannelCommand::Close)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

/// The seam a concrete pub/sub backend implements.
///
/// `open` registers a subscription and returns immediately; the backend
/// confirms (or fails) asynchronously via `ChannelEvent::StatusChanged`.
pub trait ChannelDriver: Send + Sync {
    fn open(
        &self,
        conversation: ConversationId,
        local_user: PresenceMeta,
    ) -> (ChannelHandle, mpsc::Receiver<ChannelEvent>);
}
