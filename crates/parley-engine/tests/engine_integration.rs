//! End-to-end engine tests over the in-process broker.
//!
//! All tests run with a paused tokio clock so backoff, batching, and
//! expiry timers elapse instantly and deterministically.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use parley_engine::{
    EngineConfig, MessageEvent, RealtimeConversationEngine, SubscriptionStatus,
};
use parley_shared::{
    ConversationId, EngineError, Message, MessageId, MessageKind, TypingSignal, UserId,
};
use parley_transport::{ChannelDriver, ChannelStatus, LocalBroker, PresenceMeta};

fn engine_with(broker: &LocalBroker, config: EngineConfig) -> RealtimeConversationEngine {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    RealtimeConversationEngine::new(Arc::new(broker.clone()), config)
}

fn engine(broker: &LocalBroker) -> RealtimeConversationEngine {
    engine_with(broker, EngineConfig::default())
}

fn remote_message(conversation: ConversationId, id: &str, sender: &str, body: &str) -> Message {
    Message::new(
        MessageId::from(id),
        conversation,
        UserId::from(sender),
        sender,
        body,
        MessageKind::Text,
        Utc::now(),
    )
}

/// Poll until `predicate` holds or the attempt budget runs out.
async fn wait_for<F, Fut>(mut predicate: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    // Generous on the paused clock: covers a full backed-off retry run.
    for _ in 0..10_000 {
        if predicate().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn test_join_subscribes_and_seeds_history() {
    let broker = LocalBroker::new();
    let conversation = ConversationId::new();
    for i in 0..3 {
        broker
            .inject_row(
                conversation,
                remote_message(conversation, &format!("srv-{i}"), "u2", &format!("old {i}")),
            )
            .await;
    }

    let engine = engine(&broker);
    engine
        .join_conversation(conversation, UserId::from("u1"), "Ann")
        .await
        .unwrap();

    assert_eq!(
        engine.connection_status(conversation).await,
        Some(SubscriptionStatus::Subscribed)
    );
    assert_eq!(engine.active_conversation_count().await, 1);
    assert_eq!(engine.messages(conversation).await.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_join_rejects_invalid_input() {
    let broker = LocalBroker::new();
    let engine = engine(&broker);
    let err = engine
        .join_conversation(ConversationId::new(), UserId::from(""), "Ann")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(engine.active_conversation_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_send_reconciles_against_server_row() {
    let broker = LocalBroker::new();
    let conversation = ConversationId::new();
    let engine = engine(&broker);
    engine
        .join_conversation(conversation, UserId::from("u1"), "Ann")
        .await
        .unwrap();

    let events: Arc<Mutex<Vec<MessageEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    engine
        .on_messages(
            conversation,
            Box::new(move |batch| sink.lock().unwrap().extend_from_slice(batch)),
        )
        .await
        .unwrap();

    let temp_id = engine
        .send_message(conversation, "hello", MessageKind::Text, None)
        .await
        .unwrap();
    assert!(temp_id.is_local());

    wait_for(|| async { !events.lock().unwrap().is_empty() }).await;

    let recorded = events.lock().unwrap();
    match &recorded[0] {
        MessageEvent::Replaced { retired, message } => {
            assert_eq!(*retired, temp_id);
            assert!(!message.id.is_local());
            assert_eq!(message.body, "hello");
        }
        other => panic!("expected replace, got {other:?}"),
    }
    drop(recorded);

    let cached = engine.messages(conversation).await;
    assert_eq!(cached.len(), 1);
    assert!(!cached[0].id.is_local());
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_delivery_collapses_to_one() {
    let broker = LocalBroker::new();
    broker.set_duplicate_delivery(true);
    let conversation = ConversationId::new();
    let engine = engine(&broker);
    engine
        .join_conversation(conversation, UserId::from("u1"), "Ann")
        .await
        .unwrap();

    broker
        .inject_row(
            conversation,
            remote_message(conversation, "srv-1", "u2", "hi"),
        )
        .await;

    wait_for(|| async { !engine.messages(conversation).await.is_empty() }).await;
    // Let the duplicate arrive and be dropped.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(engine.messages(conversation).await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_quota_gating_rejects_sends() {
    let broker = LocalBroker::new();
    let conversation = ConversationId::new();
    let config = EngineConfig {
        quota_allowance: 8,
        ..EngineConfig::default()
    };
    let engine = engine_with(&broker, config);
    engine
        .join_conversation(conversation, UserId::from("u1"), "Ann")
        .await
        .unwrap();

    // critical at floor(8 * 0.975) = 7 recorded events.  Each send records
    // once plus once for the echoed row.
    let mut quota_error = None;
    for i in 0..8 {
        match engine
            .send_message(conversation, &format!("msg {i}"), MessageKind::Text, None)
            .await
        {
            Ok(_) => {}
            Err(e) => {
                quota_error = Some(e);
                break;
            }
        }
    }
    let err = quota_error.expect("quota should trip");
    assert!(matches!(err, EngineError::Quota { .. }));

    // Rejected sends must not move the counter.
    let used = engine.quota_usage().used;
    let again = engine
        .send_message(conversation, "more", MessageKind::Text, None)
        .await
        .unwrap_err();
    assert!(matches!(again, EngineError::Quota { .. }));
    assert_eq!(engine.quota_usage().used, used);
}

#[tokio::test(start_paused = true)]
async fn test_channel_error_triggers_reconnect() {
    let broker = LocalBroker::new();
    let conversation = ConversationId::new();
    let engine = engine(&broker);
    engine
        .join_conversation(conversation, UserId::from("u1"), "Ann")
        .await
        .unwrap();

    broker
        .inject_status(conversation, ChannelStatus::ChannelError)
        .await;

    // Backoff elapses on the paused clock; the engine resubscribes.
    wait_for(|| async {
        engine.connection_status(conversation).await == Some(SubscriptionStatus::Subscribed)
    })
    .await;

    // Still usable after the reconnect.
    engine
        .send_message(conversation, "back", MessageKind::Text, None)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_exhaustion_fails_join() {
    let broker = LocalBroker::new();
    let conversation = ConversationId::new();
    // Initial attempt plus the full retry budget all refused.
    broker.refuse_subscribes(10);
    let engine = engine(&broker);

    let err = engine
        .join_conversation(conversation, UserId::from("u1"), "Ann")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PermanentFailure { .. }));
    assert_eq!(engine.active_conversation_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_circuit_opens_after_failed_join_run() {
    let broker = LocalBroker::new();
    let conversation = ConversationId::new();
    // Exactly the five attempts the circuit needs to trip; later opens succeed.
    broker.refuse_subscribes(5);
    let engine = engine(&broker);

    let err = engine
        .join_conversation(conversation, UserId::from("u1"), "Ann")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PermanentFailure { .. }));

    // The failure run opened the circuit; an immediate re-join is refused
    // without touching the transport.
    let err = engine
        .join_conversation(conversation, UserId::from("u1"), "Ann")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CircuitOpen { .. }));

    // After the open window the circuit half-opens and the trial succeeds.
    tokio::time::sleep(Duration::from_secs(61)).await;
    engine
        .join_conversation(conversation, UserId::from("u1"), "Ann")
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_typing_signal_expires_with_synthetic_stop() {
    let broker = LocalBroker::new();
    let conversation = ConversationId::new();
    let engine = engine(&broker);
    engine
        .join_conversation(conversation, UserId::from("u1"), "Ann")
        .await
        .unwrap();

    let log: Arc<Mutex<Vec<(TypingSignal, tokio::time::Instant)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    engine
        .on_typing(
            conversation,
            Box::new(move |signal| {
                sink.lock()
                    .unwrap()
                    .push((signal.clone(), tokio::time::Instant::now()));
            }),
        )
        .await
        .unwrap();

    // A second participant starts typing and never refreshes.
    let (peer, mut peer_rx) = broker.open(
        conversation,
        PresenceMeta {
            user_id: UserId::from("u2"),
            display_name: "Bob".into(),
            role: None,
        },
    );
    // Drain the peer's own subscribe confirmation.
    let _ = peer_rx.recv().await;
    let start = TypingSignal::started(UserId::from("u2"), "Bob", Utc::now());
    peer.send("typing", serde_json::json!(start)).await.unwrap();

    wait_for(|| async { log.lock().unwrap().len() >= 2 }).await;

    let recorded = log.lock().unwrap();
    let (first, started_at) = &recorded[0];
    let (second, stopped_at) = &recorded[1];
    assert!(!first.is_stop());
    assert!(second.is_stop());
    assert_eq!(second.user_id, UserId::from("u2"));

    let gap = stopped_at.duration_since(*started_at);
    assert!(
        gap >= Duration::from_millis(2_900) && gap <= Duration::from_millis(3_100),
        "expiry gap was {gap:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn test_presence_snapshot_tracks_membership() {
    let broker = LocalBroker::new();
    let conversation = ConversationId::new();
    let engine = engine(&broker);
    engine
        .join_conversation(conversation, UserId::from("u1"), "Ann")
        .await
        .unwrap();

    let rosters: Arc<Mutex<Vec<Vec<UserId>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = rosters.clone();
    engine
        .on_presence(
            conversation,
            Box::new(move |members| {
                sink.lock()
                    .unwrap()
                    .push(members.iter().map(|m| m.user_id.clone()).collect());
            }),
        )
        .await
        .unwrap();

    let (peer, mut peer_rx) = broker.open(
        conversation,
        PresenceMeta {
            user_id: UserId::from("u2"),
            display_name: "Bob".into(),
            role: None,
        },
    );
    let _ = peer_rx.recv().await;
    peer.track_presence(PresenceMeta {
        user_id: UserId::from("u2"),
        display_name: "Bob".into(),
        role: None,
    })
    .await
    .unwrap();

    wait_for(|| async {
        rosters
            .lock()
            .unwrap()
            .last()
            .is_some_and(|r| r.contains(&UserId::from("u2")))
    })
    .await;

    peer.untrack_presence().await.unwrap();
    wait_for(|| async {
        rosters
            .lock()
            .unwrap()
            .last()
            .is_some_and(|r| !r.contains(&UserId::from("u2")))
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_batches_deliver_high_tier_first() {
    let broker = LocalBroker::new();
    let conversation = ConversationId::new();
    let engine = engine(&broker);
    engine
        .join_conversation(conversation, UserId::from("u1"), "Ann")
        .await
        .unwrap();

    let batches: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = batches.clone();
    engine
        .on_messages(
            conversation,
            Box::new(move |batch| {
                sink.lock().unwrap().push(
                    batch
                        .iter()
                        .map(|e| e.message().id.as_str().to_string())
                        .collect(),
                );
            }),
        )
        .await
        .unwrap();

    let text = remote_message(conversation, "n1", "u2", "plain");
    let mut voice = remote_message(conversation, "h1", "u2", "voice note");
    voice.kind = MessageKind::Voice;
    broker.inject_row(conversation, text).await;
    broker.inject_row(conversation, voice).await;

    wait_for(|| async {
        batches.lock().unwrap().iter().flatten().count() == 2
    })
    .await;

    let recorded = batches.lock().unwrap();
    for batch in recorded.iter() {
        if batch.len() == 2 {
            // Voice outranks text within a single flush.
            assert_eq!(batch[0], "h1");
            assert_eq!(batch[1], "n1");
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_overflow_eviction_on_seed() {
    let broker = LocalBroker::new();
    let conversation = ConversationId::new();
    for i in 0..600 {
        broker
            .inject_row(
                conversation,
                remote_message(conversation, &format!("srv-{i}"), "u2", &format!("m {i}")),
            )
            .await;
    }

    let config = EngineConfig {
        history_fetch_limit: 600,
        ..EngineConfig::default()
    };
    let engine = engine_with(&broker, config);
    engine
        .join_conversation(conversation, UserId::from("u1"), "Ann")
        .await
        .unwrap();

    let cached = engine.messages(conversation).await;
    assert_eq!(cached.len(), 500);
    // The 500 newest survive.
    assert_eq!(cached[0].id, MessageId::from("srv-100"));
    assert_eq!(cached[499].id, MessageId::from("srv-599"));
}

#[tokio::test(start_paused = true)]
async fn test_leave_is_idempotent_and_stops_delivery() {
    let broker = LocalBroker::new();
    let conversation = ConversationId::new();
    let engine = engine(&broker);
    engine
        .join_conversation(conversation, UserId::from("u1"), "Ann")
        .await
        .unwrap();

    let events: Arc<Mutex<Vec<MessageEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    engine
        .on_messages(
            conversation,
            Box::new(move |batch| sink.lock().unwrap().extend_from_slice(batch)),
        )
        .await
        .unwrap();

    engine.leave_conversation(conversation).await;
    engine.leave_conversation(conversation).await;
    assert_eq!(engine.active_conversation_count().await, 0);
    assert_eq!(engine.connection_status(conversation).await, None);

    broker
        .inject_row(
            conversation,
            remote_message(conversation, "srv-9", "u2", "after leave"),
        )
        .await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(events.lock().unwrap().is_empty());

    let err = engine
        .send_message(conversation, "hi", MessageKind::Text, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotConnected));
}

#[tokio::test(start_paused = true)]
async fn test_failed_send_leaves_failed_entry() {
    let broker = LocalBroker::new();
    let conversation = ConversationId::new();
    let engine = engine(&broker);
    engine
        .join_conversation(conversation, UserId::from("u1"), "Ann")
        .await
        .unwrap();

    broker.set_fail_sends(true);
    let err = engine
        .send_message(conversation, "doomed", MessageKind::Text, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Network(_)));

    // The drafted content survives in the cache for a retry affordance.
    let cached = engine.messages(conversation).await;
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].body, "doomed");
    assert!(cached[0].id.is_local());
}

#[tokio::test(start_paused = true)]
async fn test_mark_read_flows_back_as_updates() {
    let broker = LocalBroker::new();
    let conversation = ConversationId::new();
    let engine = engine(&broker);
    engine
        .join_conversation(conversation, UserId::from("u1"), "Ann")
        .await
        .unwrap();

    broker
        .inject_row(
            conversation,
            remote_message(conversation, "srv-1", "u2", "read me"),
        )
        .await;
    wait_for(|| async { !engine.messages(conversation).await.is_empty() }).await;

    engine
        .mark_read(conversation, MessageId::from("srv-1"))
        .await
        .unwrap();

    wait_for(|| async {
        engine
            .messages(conversation)
            .await
            .first()
            .is_some_and(|m| m.read)
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_rejoin_after_permanent_failure_rebuilds() {
    let broker = LocalBroker::new();
    let conversation = ConversationId::new();
    let config = EngineConfig {
        // Keep the circuit out of the picture; this is about the retry budget.
        circuit_failure_threshold: 50,
        ..EngineConfig::default()
    };
    let engine = engine_with(&broker, config);
    engine
        .join_conversation(conversation, UserId::from("u1"), "Ann")
        .await
        .unwrap();

    // Kill the channel with every reconnect refused until the budget runs out.
    broker.refuse_subscribes(5);
    broker
        .inject_status(conversation, ChannelStatus::ChannelError)
        .await;
    wait_for(|| async {
        engine.connection_status(conversation).await == Some(SubscriptionStatus::Failed)
    })
    .await;

    // The backend is healthy again; a manual re-join must build a fresh
    // subscription rather than report the dead membership as joined.
    engine
        .join_conversation(conversation, UserId::from("u1"), "Ann")
        .await
        .unwrap();
    assert_eq!(
        engine.connection_status(conversation).await,
        Some(SubscriptionStatus::Subscribed)
    );
    engine
        .send_message(conversation, "alive again", MessageKind::Text, None)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_join_does_not_wedge_later_joins() {
    let broker = LocalBroker::new();
    let conversation = ConversationId::new();
    broker.refuse_subscribes(6);
    let config = EngineConfig {
        circuit_failure_threshold: 50,
        ..EngineConfig::default()
    };
    let engine = engine_with(&broker, config);

    // The caller gives up long before the retry run settles.
    let abandoned = tokio::time::timeout(
        Duration::from_millis(100),
        engine.join_conversation(conversation, UserId::from("u1"), "Ann"),
    )
    .await;
    assert!(abandoned.is_err());

    // The background run fails on its own; a later join must not spin on a
    // leftover in-flight marker.
    let rejoined = tokio::time::timeout(
        Duration::from_secs(300),
        engine.join_conversation(conversation, UserId::from("u1"), "Ann"),
    )
    .await;
    rejoined.expect("join wedged on the in-flight guard").unwrap();
    assert_eq!(
        engine.connection_status(conversation).await,
        Some(SubscriptionStatus::Subscribed)
    );
}

#[tokio::test(start_paused = true)]
async fn test_typing_broadcasts_count_against_quota() {
    let broker = LocalBroker::new();
    let conversation = ConversationId::new();
    let engine = engine(&broker);
    engine
        .join_conversation(conversation, UserId::from("u1"), "Ann")
        .await
        .unwrap();

    let before = engine.quota_usage().used;
    engine.set_typing(conversation, true).await.unwrap();
    assert_eq!(engine.quota_usage().used, before + 1);

    // A debounced repeat broadcasts nothing and records nothing.
    engine.set_typing(conversation, true).await.unwrap();
    assert_eq!(engine.quota_usage().used, before + 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_join_settles_once() {
    let broker = LocalBroker::new();
    let conversation = ConversationId::new();
    let engine = Arc::new(engine(&broker));

    let a = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .join_conversation(conversation, UserId::from("u1"), "Ann")
                .await
        })
    };
    let b = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .join_conversation(conversation, UserId::from("u1"), "Ann")
                .await
        })
    };

    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();
    assert_eq!(engine.active_conversation_count().await, 1);
}
