//! In-process pub/sub broker implementing [`ChannelDriver`].
//!
//! One topic per conversation with fan-out of row and broadcast events, a
//! presence registry that pushes full snapshots on every change, and an
//! in-memory message store servicing history fetches.  Fault-injection
//! switches (duplicate delivery, failed sends, refused subscribes, forced
//! status changes) make it the backend for the engine's integration tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use parley_shared::{ConversationId, Message, MessageId, PresenceMember, UserId};

use crate::channel::{
    ChannelCommand, ChannelDriver, ChannelEvent, ChannelHandle, ChannelStatus, PresenceMeta,
    TransportError, EVENT_MESSAGE,
};

struct Subscriber {
    user_id: UserId,
    event_tx: mpsc::Sender<ChannelEvent>,
}

#[derive(Default)]
struct Topic {
    subscribers: HashMap<u64, Subscriber>,
    presence: BTreeMap<UserId, PresenceMember>,
    history: Vec<Message>,
}

#[derive(Default)]
struct Inner {
    topics: HashMap<ConversationId, Topic>,
    duplicate_delivery: bool,
    fail_sends: bool,
    refuse_subscribes: u32,
}

/// In-memory topic broker.  Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LocalBroker {
    inner: Arc<Mutex<Inner>>,
    next_sub: Arc<AtomicU64>,
    next_row: Arc<AtomicU64>,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            next_sub: Arc::new(AtomicU64::new(1)),
            next_row: Arc::new(AtomicU64::new(1)),
        }
    }

    // -- fault injection -----------------------------------------------------

    /// Deliver every row event twice (simulates duplicate delivery).
    pub fn set_duplicate_delivery(&self, on: bool) {
        self.inner.lock().unwrap().duplicate_delivery = on;
    }

    /// Make every message send fail at the backend.
    pub fn set_fail_sends(&self, on: bool) {
        self.inner.lock().unwrap().fail_sends = on;
    }

    /// The next `n` channel opens report `TimedOut` instead of `Subscribed`.
    pub fn refuse_subscribes(&self, n: u32) {
        self.inner.lock().unwrap().refuse_subscribes = n;
    }

    /// Push a status change to every subscriber of a conversation.
    pub async fn inject_status(&self, conversation: ConversationId, status: ChannelStatus) {
        let txs = self.subscriber_txs(conversation);
        for tx in txs {
            let _ = tx.send(ChannelEvent::StatusChanged(status)).await;
        }
    }

    /// Append a server-confirmed row and fan it out, as if another client
    /// had written it directly to the backend.
    pub async fn inject_row(&self, conversation: ConversationId, message: Message) {
        let (txs, duplicate) = {
            let mut inner = self.inner.lock().unwrap();
            let topic = inner.topics.entry(conversation).or_default();
            topic.history.push(message.clone());
            let txs: Vec<_> = topic
                .subscribers
                .values()
                .map(|s| s.event_tx.clone())
                .collect();
            (txs, inner.duplicate_delivery)
        };
        for tx in &txs {
            let _ = tx.send(ChannelEvent::RowInserted(message.clone())).await;
            if duplicate {
                let _ = tx.send(ChannelEvent::RowInserted(message.clone())).await;
            }
        }
    }

    /// Number of rows stored for a conversation.
    pub fn history_len(&self, conversation: ConversationId) -> usize {
        self.inner
            .lock()
            .unwrap()
            .topics
            .get(&conversation)
            .map(|t| t.history.len())
            .unwrap_or(0)
    }

    // -- internals -----------------------------------------------------------

    fn subscriber_txs(&self, conversation: ConversationId) -> Vec<mpsc::Sender<ChannelEvent>> {
        self.inner
            .lock()
            .unwrap()
            .topics
            .get(&conversation)
            .map(|t| t.subscribers.values().map(|s| s.event_tx.clone()).collect())
            .unwrap_or_default()
    }

    fn assign_row_id(&self) -> MessageId {
        MessageId(format!("m-{}", self.next_row.fetch_add(1, Ordering::Relaxed)))
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelDriver for LocalBroker {
    fn open(
        &self,
        conversation: ConversationId,
        local_user: PresenceMeta,
    ) -> (ChannelHandle, mpsc::Receiver<ChannelEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(256);

        let sub_id = self.next_sub.fetch_add(1, Ordering::Relaxed);
        let initial_status = {
            let mut inner = self.inner.lock().unwrap();
            if inner.refuse_subscribes > 0 {
                inner.refuse_subscribes -= 1;
                ChannelStatus::TimedOut
            } else {
                let topic = inner.topics.entry(conversation).or_default();
                topic.subscribers.insert(
                    sub_id,
                    Subscriber {
                        user_id: local_user.user_id.clone(),
                        event_tx: event_tx.clone(),
                    },
                );
                ChannelStatus::Subscribed
            }
        };

        debug!(conversation = %conversation, sub = sub_id, status = ?initial_status, "Channel opened");

        let broker = self.clone();
        tokio::spawn(async move {
            let _ = event_tx.send(ChannelEvent::StatusChanged(initial_status)).await;
            if initial_status != ChannelStatus::Subscribed {
                return;
            }
            channel_task(broker, conversation, sub_id, local_user, cmd_rx, event_tx).await;
        });

        (ChannelHandle::new(conversation, cmd_tx), event_rx)
    }
}

/// Services one subscriber's command stream until `Close` or all handles
/// are dropped.
async fn channel_task(
    broker: LocalBroker,
    conversation: ConversationId,
    sub_id: u64,
    local_user: PresenceMeta,
    mut cmd_rx: mpsc::Receiver<ChannelCommand>,
    event_tx: mpsc::Sender<ChannelEvent>,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            ChannelCommand::Send { event, payload, ack } => {
                handle_send(&broker, conversation, sub_id, event, payload, ack).await;
            }

            ChannelCommand::TrackPresence(meta) => {
                let (peer_txs, snapshot) = {
                    let mut inner = broker.inner.lock().unwrap();
                    let topic = inner.topics.entry(conversation).or_default();
                    topic.presence.insert(
                        meta.user_id.clone(),
                        PresenceMember {
                            user_id: meta.user_id.clone(),
                            display_name: meta.display_name.clone(),
                            online: true,
                            joined_at: Utc::now(),
                            role: meta.role.clone(),
                        },
                    );
                    let snapshot: Vec<_> = topic.presence.values().cloned().collect();
                    let peer_txs: Vec<_> = topic
                        .subscribers
                        .values()
                        .map(|s| (s.user_id.clone(), s.event_tx.clone()))
                        .collect();
                    (peer_txs, snapshot)
                };
                for (user, tx) in &peer_txs {
                    if *user != meta.user_id {
                        let _ = tx
                            .send(ChannelEvent::PresenceJoin(meta.user_id.clone()))
                            .await;
                    }
                    let _ = tx.send(ChannelEvent::PresenceSync(snapshot.clone())).await;
                }
            }

            ChannelCommand::UntrackPresence => {
                let (peer_txs, snapshot) = {
                    let mut inner = broker.inner.lock().unwrap();
                    let topic = inner.topics.entry(conversation).or_default();
                    topic.presence.remove(&local_user.user_id);
                    let snapshot: Vec<_> = topic.presence.values().cloned().collect();
                    let peer_txs: Vec<_> = topic
                        .subscribers
                        .values()
                        .map(|s| (s.user_id.clone(), s.event_tx.clone()))
                        .collect();
                    (peer_txs, snapshot)
                };
                for (user, tx) in &peer_txs {
                    if *user != local_user.user_id {
                        let _ = tx
                            .send(ChannelEvent::PresenceLeave(local_user.user_id.clone()))
                            .await;
                    }
                    let _ = tx.send(ChannelEvent::PresenceSync(snapshot.clone())).await;
                }
            }

            ChannelCommand::FetchHistory { limit, reply } => {
                let rows = {
                    let inner = broker.inner.lock().unwrap();
                    inner
                        .topics
                        .get(&conversation)
                        .map(|t| {
                            let start = t.history.len().saturating_sub(limit);
                            t.history[start..].to_vec()
                        })
                        .unwrap_or_default()
                };
                let _ = reply.send(Ok(rows));
            }

            ChannelCommand::PresenceState { reply } => {
                let snapshot = {
                    let inner = broker.inner.lock().unwrap();
                    inner
                        .topics
                        .get(&conversation)
                        .map(|t| t.presence.values().cloned().collect())
                        .unwrap_or_default()
                };
                let _ = reply.send(snapshot);
            }

            ChannelCommand::MarkRead { up_to } => {
                let updated = {
                    let mut inner = broker.inner.lock().unwrap();
                    let mut updated = Vec::new();
                    if let Some(topic) = inner.topics.get_mut(&conversation) {
                        for row in topic.history.iter_mut() {
                            if !row.read {
                                row.read = true;
                                updated.push(row.clone());
                            }
                            if row.id == up_to {
                                break;
                            }
                        }
                    }
                    updated
                };
                let txs = broker.subscriber_txs(conversation);
                for row in updated {
                    for tx in &txs {
                        let _ = tx.send(ChannelEvent::RowUpdated(row.clone())).await;
                    }
                }
            }

            ChannelCommand::Ping { reply } => {
                let _ = reply.send(());
            }

            ChannelCommand::Close => {
                remove_subscriber(&broker, conversation, sub_id);
                let _ = event_tx
                    .send(ChannelEvent::StatusChanged(ChannelStatus::Closed))
                    .await;
                return;
            }
        }
    }

    // All command senders dropped without an explicit Close.
    remove_subscriber(&broker, conversation, sub_id);
}

async fn handle_send(
    broker: &LocalBroker,
    conversation: ConversationId,
    sub_id: u64,
    event: String,
    payload: Value,
    ack: tokio::sync::oneshot::Sender<Result<(), TransportError>>,
) {
    if event == EVENT_MESSAGE {
        if broker.inner.lock().unwrap().fail_sends {
            let _ = ack.send(Err(TransportError::SendFailed("backend refused".into())));
            return;
        }
        let mut message: Message = match serde_json::from_value(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "Malformed message payload");
                let _ = ack.send(Err(TransportError::SendFailed(e.to_string())));
                return;
            }
        };
        // The backend assigns the durable row id; the client keeps its
        // original timestamp.
        message.id = broker.assign_row_id();
        let (txs, duplicate) = {
            let mut inner = broker.inner.lock().unwrap();
            let topic = inner.topics.entry(conversation).or_default();
            topic.history.push(message.clone());
            let txs: Vec<_> = topic
                .subscribers
                .values()
                .map(|s| s.event_tx.clone())
                .collect();
            (txs, inner.duplicate_delivery)
        };
        let _ = ack.send(Ok(()));
        for tx in &txs {
            let _ = tx.send(ChannelEvent::RowInserted(message.clone())).await;
            if duplicate {
                let _ = tx.send(ChannelEvent::RowInserted(message.clone())).await;
            }
        }
    } else {
        // Broadcasts are not echoed back to the sender.
        let txs: Vec<_> = {
            let inner = broker.inner.lock().unwrap();
            inner
                .topics
                .get(&conversation)
                .map(|t| {
                    t.subscribers
                        .iter()
                        .filter(|(id, _)| **id != sub_id)
                        .map(|(_, s)| s.event_tx.clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        let _ = ack.send(Ok(()));
        for tx in &txs {
            let _ = tx
                .send(ChannelEvent::Broadcast {
                    event: event.clone(),
                    payload: payload.clone(),
                })
                .await;
        }
    }
}

fn remove_subscriber(broker: &LocalBroker, conversation: ConversationId, sub_id: u64) {
    let mut inner = broker.inner.lock().unwrap();
    if let Some(topic) = inner.topics.get_mut(&conversation) {
        if topic.subscribers.remove(&sub_id).is_some() {
            debug!(conversation = %conversation, sub = sub_id, "Subscriber removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parley_shared::MessageKind;

    fn meta(user: &str) -> PresenceMeta {
        PresenceMeta {
            user_id: UserId::from(user),
            display_name: user.to_string(),
            role: None,
        }
    }

    fn test_message(conversation: ConversationId, sender: &str, body: &str) -> Message {
        Message::new(
            MessageId::local(),
            conversation,
            UserId::from(sender),
            sender,
            body,
            MessageKind::Text,
            Utc::now(),
        )
    }

    async fn expect_subscribed(rx: &mut mpsc::Receiver<ChannelEvent>) {
        match rx.recv().await {
            Some(ChannelEvent::StatusChanged(ChannelStatus::Subscribed)) => {}
            other => panic!("expected subscribed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_assigns_server_id_and_echoes() {
        let broker = LocalBroker::new();
        let conversation = ConversationId::new();
        let (handle, mut rx) = broker.open(conversation, meta("u1"));
        expect_subscribed(&mut rx).await;

        let msg = test_message(conversation, "u1", "hi");
        let payload = serde_json::to_value(&msg).unwrap();
        handle.send(EVENT_MESSAGE, payload).await.unwrap();

        match rx.recv().await {
            Some(ChannelEvent::RowInserted(row)) => {
                assert!(!row.id.is_local());
                assert_eq!(row.body, "hi");
            }
            other => panic!("expected row insert, got {other:?}"),
        }
        assert_eq!(broker.history_len(conversation), 1);
    }

    #[tokio::test]
    async fn test_broadcast_not_echoed_to_sender() {
        let broker = LocalBroker::new();
        let conversation = ConversationId::new();
        let (h1, mut rx1) = broker.open(conversation, meta("u1"));
        let (_h2, mut rx2) = broker.open(conversation, meta("u2"));
        expect_subscribed(&mut rx1).await;
        expect_subscribed(&mut rx2).await;

        h1.send("typing", serde_json::json!({"user": "u1"}))
            .await
            .unwrap();

        match rx2.recv().await {
            Some(ChannelEvent::Broadcast { event, .. }) => assert_eq!(event, "typing"),
            other => panic!("expected broadcast, got {other:?}"),
        }
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_presence_track_pushes_snapshot() {
        let broker = LocalBroker::new();
        let conversation = ConversationId::new();
        let (h1, mut rx1) = broker.open(conversation, meta("u1"));
        expect_subscribed(&mut rx1).await;

        h1.track_presence(meta("u1")).await.unwrap();
        match rx1.recv().await {
            Some(ChannelEvent::PresenceSync(members)) => {
                assert_eq!(members.len(), 1);
                assert_eq!(members[0].user_id, UserId::from("u1"));
                assert!(members[0].online);
            }
            other => panic!("expected presence sync, got {other:?}"),
        }

        h1.untrack_presence().await.unwrap();
        match rx1.recv().await {
            Some(ChannelEvent::PresenceSync(members)) => assert!(members.is_empty()),
            other => panic!("expected empty sync, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_refused_subscribe_reports_timeout() {
        let broker = LocalBroker::new();
        let conversation = ConversationId::new();
        broker.refuse_subscribes(1);

        let (_h, mut rx) = broker.open(conversation, meta("u1"));
        match rx.recv().await {
            Some(ChannelEvent::StatusChanged(ChannelStatus::TimedOut)) => {}
            other => panic!("expected timeout, got {other:?}"),
        }
        // Next open succeeds.
        let (_h2, mut rx2) = broker.open(conversation, meta("u1"));
        expect_subscribed(&mut rx2).await;
    }

    #[tokio::test]
    async fn test_fetch_history_limit() {
        let broker = LocalBroker::new();
        let conversation = ConversationId::new();
        for i in 0..5 {
            let mut m = test_message(conversation, "u1", &format!("m{i}"));
            m.id = MessageId::from(format!("srv-{i}").as_str());
            broker.inject_row(conversation, m).await;
        }

        let (handle, mut rx) = broker.open(conversation, meta("u2"));
        expect_subscribed(&mut rx).await;
        let rows = handle.fetch_history(3).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].body, "m2");
        assert_eq!(rows[2].body, "m4");
    }

    #[tokio::test]
    async fn test_duplicate_delivery_switch() {
        let broker = LocalBroker::new();
        let conversation = ConversationId::new();
        broker.set_duplicate_delivery(true);

        let (_h, mut rx) = broker.open(conversation, meta("u1"));
        expect_subscribed(&mut rx).await;

        let mut m = test_message(conversation, "u2", "dup");
        m.id = MessageId::from("srv-1");
        broker.inject_row(conversation, m).await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first, ChannelEvent::RowInserted(_)));
        assert!(matches!(second, ChannelEvent::RowInserted(_)));
    }
}
