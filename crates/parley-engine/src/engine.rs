//! The realtime conversation engine facade.
//!
//! One tokio task per joined conversation consumes transport events and
//! drives the cache, roster, typing tracker, batch queue, and subscription
//! state machine.  The task is the only code touching that conversation's
//! state besides the short synchronous sections behind the engine lock, so
//! conversations stay independent; the quota ledger and circuit breakers
//! are the only cross-conversation shared state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use parley_shared::{
    ConversationId, EngineError, Message, MessageId, MessageKind, TypingSignal, UserId,
};
use parley_transport::{
    ChannelDriver, ChannelEvent, ChannelHandle, PresenceMeta, EVENT_ANNOUNCEMENT, EVENT_MESSAGE,
    EVENT_TYPING,
};

use crate::cache::Admission;
use crate::config::EngineConfig;
use crate::conversation::{
    AbortOnDrop, ConversationState, MessagesCallback, PresenceCallback, StatusCallback,
    TypingCallback,
};
use crate::governor::{CircuitBreaker, MessageEvent, Priority, QuotaLedger, QuotaUsage};
use crate::subscription::{backoff_delay, SubscriptionStatus, Transition};

struct EngineInner {
    conversations: HashMap<ConversationId, ConversationState>,
    circuits: HashMap<ConversationId, CircuitBreaker>,
    /// Conversations with a join or leave in flight; a second join polls
    /// until the id leaves this set.
    settling: HashSet<ConversationId>,
}

/// Client-side engine maintaining live, ordered, deduplicated conversation
/// state over a pub/sub transport.
pub struct RealtimeConversationEngine {
    driver: Arc<dyn ChannelDriver>,
    config: EngineConfig,
    quota: Arc<QuotaLedger>,
    inner: Arc<Mutex<EngineInner>>,
}

impl RealtimeConversationEngine {
    pub fn new(driver: Arc<dyn ChannelDriver>, config: EngineConfig) -> Self {
        let quota = Arc::new(QuotaLedger::new(&config));
        Self {
            driver,
            config,
            quota,
            inner: Arc::new(Mutex::new(EngineInner {
                conversations: HashMap::new(),
                circuits: HashMap::new(),
                settling: HashSet::new(),
            })),
        }
    }

    /// Join a conversation and resolve once the subscription is live.
    ///
    /// Retryable interruptions during the initial subscribe are retried
    /// internally with backoff; the call fails only on validation, an open
    /// circuit, or an exhausted retry budget.
    pub async fn join_conversation(
        &self,
        conversation: ConversationId,
        user_id: UserId,
        user_name: &str,
    ) -> Result<(), EngineError> {
        if user_id.as_str().is_empty() {
            return Err(EngineError::Validation("empty user id".into()));
        }
        if user_name.is_empty() {
            return Err(EngineError::Validation("empty user name".into()));
        }

        let local_user = PresenceMeta {
            user_id,
            display_name: user_name.to_string(),
            role: None,
        };

        loop {
            let mut inner = self.inner.lock().await;
            if inner.settling.contains(&conversation) {
                drop(inner);
                sleep(self.config.join_settle_poll).await;
                continue;
            }
            if let Some(state) = inner.conversations.get(&conversation) {
                // A permanently failed membership stays resident so its
                // status is observable; a manual re-join rebuilds it from
                // scratch instead of reporting the dead one as joined.
                if state.subscription.status != SubscriptionStatus::Failed {
                    return Ok(());
                }
                inner.conversations.remove(&conversation);
            }

            inner
                .circuits
                .entry(conversation)
                .or_insert_with(|| CircuitBreaker::new(&self.config))
                .check(Instant::now())?;

            let mut state = ConversationState::new(local_user.clone(), &self.config);
            let task = tokio::spawn(conversation_loop(
                self.driver.clone(),
                self.config.clone(),
                self.quota.clone(),
                self.inner.clone(),
                conversation,
                local_user.clone(),
            ));
            state.task = Some(AbortOnDrop::new(task));
            inner.conversations.insert(conversation, state);
            inner.settling.insert(conversation);
            info!(conversation = %conversation, "Joining conversation");
            break;
        }

        // Wait for the subscription to settle one way or the other.
        loop {
            sleep(self.config.join_settle_poll).await;
            let mut inner = self.inner.lock().await;
            let status = match inner.conversations.get(&conversation) {
                Some(state) => state.subscription.status,
                None => {
                    inner.settling.remove(&conversation);
                    return Err(EngineError::NotConnected);
                }
            };
            match status {
                SubscriptionStatus::Subscribed => {
                    inner.settling.remove(&conversation);
                    return Ok(());
                }
                SubscriptionStatus::Failed => {
                    let attempts = inner
                        .conversations
                        .remove(&conversation)
                        .map(|s| s.subscription.retries)
                        .unwrap_or(0);
                    inner.settling.remove(&conversation);
                    return Err(EngineError::PermanentFailure { attempts });
                }
                _ => {}
            }
        }
    }

    /// Leave a conversation.  Idempotent; cancels every pending timer for
    /// the conversation by dropping its state object.
    pub async fn leave_conversation(&self, conversation: ConversationId) {
        let taken = {
            let mut inner = self.inner.lock().await;
            let taken = inner.conversations.remove(&conversation);
            if taken.is_some() {
                inner.settling.insert(conversation);
            }
            taken
        };

        let Some(mut state) = taken else { return };
        // Dropping the task handle aborts the event loop and with it the
        // health, batch, typing, and reconnect timers.
        state.task.take();
        if let Some(handle) = state.handle.take() {
            let _ = handle.untrack_presence().await;
            let _ = handle.close().await;
        }
        info!(conversation = %conversation, "Left conversation");

        self.inner.lock().await.settling.remove(&conversation);
    }

    /// Send a message.  The returned id is the local temporary id; the
    /// cache retires it when the server-confirmed row arrives.
    pub async fn send_message(
        &self,
        conversation: ConversationId,
        body: &str,
        kind: MessageKind,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId, EngineError> {
        if body.is_empty() {
            return Err(EngineError::Validation("empty message body".into()));
        }
        self.quota.check()?;

        let (handle, message) = {
            let mut inner = self.inner.lock().await;
            let inner = &mut *inner;
            let state = inner
                .conversations
                .get_mut(&conversation)
                .ok_or(EngineError::NotConnected)?;
            if state.subscription.status != SubscriptionStatus::Subscribed {
                return Err(EngineError::NotConnected);
            }
            if let Some(circuit) = inner.circuits.get_mut(&conversation) {
                circuit.check(Instant::now())?;
            }
            let handle = state.handle.clone().ok_or(EngineError::NotConnected)?;

            let mut message = Message::new(
                MessageId::local(),
                conversation,
                state.local_user.user_id.clone(),
                state.local_user.display_name.clone(),
                body,
                kind,
                chrono::Utc::now(),
            );
            message.reply_to = reply_to;
            state.cache.admit_optimistic(message.clone());
            self.quota.record();
            (handle, message)
        };

        let temp_id = message.id.clone();
        let payload = serde_json::to_value(&message)
            .map_err(|e| EngineError::Validation(e.to_string()))?;

        match handle.send(EVENT_MESSAGE, payload).await {
            Ok(()) => {
                let mut inner = self.inner.lock().await;
                let inner = &mut *inner;
                if let Some(state) = inner.conversations.get_mut(&conversation) {
                    state.cache.mark_sent(&temp_id);
                }
                if let Some(circuit) = inner.circuits.get_mut(&conversation) {
                    circuit.record_success();
                }
                Ok(temp_id)
            }
            Err(e) => {
                warn!(conversation = %conversation, error = %e, "Send failed");
                let mut inner = self.inner.lock().await;
                let inner = &mut *inner;
                if let Some(state) = inner.conversations.get_mut(&conversation) {
                    state.cache.mark_failed(&temp_id);
                }
                if let Some(circuit) = inner.circuits.get_mut(&conversation) {
                    circuit.record_failure(Instant::now());
                }
                Err(e.into())
            }
        }
    }

    /// Broadcast a typing change.  Fire-and-forget: start signals are
    /// debounced, stop signals go out immediately.
    pub async fn set_typing(
        &self,
        conversation: ConversationId,
        is_typing: bool,
    ) -> Result<(), EngineError> {
        let (handle, signal) = {
            let mut inner = self.inner.lock().await;
            let state = inner
                .conversations
                .get_mut(&conversation)
                .ok_or(EngineError::NotConnected)?;
            if !state.typing.note_outbound(is_typing, Instant::now()) {
                return Ok(());
            }
            let handle = state.handle.clone().ok_or(EngineError::NotConnected)?;
            let signal = if is_typing {
                TypingSignal::started(
                    state.local_user.user_id.clone(),
                    state.local_user.display_name.clone(),
                    chrono::Utc::now(),
                )
            } else {
                TypingSignal::stopped(
                    state.local_user.user_id.clone(),
                    state.local_user.display_name.clone(),
                )
            };
            (handle, signal)
        };

        // Outbound typing broadcasts count against the shared allowance
        // like any other send; debounced calls never reach this point.
        self.quota.record();
        let payload = json!(signal);
        if let Err(e) = handle.send(EVENT_TYPING, payload).await {
            debug!(conversation = %conversation, error = %e, "Typing broadcast dropped");
        }
        Ok(())
    }

    /// Mark messages read up to (and including) the given id.  The read
    /// flags come back as row-update events.
    pub async fn mark_read(
        &self,
        conversation: ConversationId,
        up_to: MessageId,
    ) -> Result<(), EngineError> {
        let handle = {
            let inner = self.inner.lock().await;
            inner
                .conversations
                .get(&conversation)
                .and_then(|s| s.handle.clone())
                .ok_or(EngineError::NotConnected)?
        };
        handle.mark_read(up_to).await.map_err(Into::into)
    }

    // -- listener registration ----------------------------------------------

    pub async fn on_messages(
        &self,
        conversation: ConversationId,
        callback: MessagesCallback,
    ) -> Result<(), EngineError> {
        self.with_state(conversation, |state| state.callbacks.messages.push(callback))
            .await
    }

    pub async fn on_presence(
        &self,
        conversation: ConversationId,
        callback: PresenceCallback,
    ) -> Result<(), EngineError> {
        self.with_state(conversation, |state| state.callbacks.presence.push(callback))
            .await
    }

    pub async fn on_typing(
        &self,
        conversation: ConversationId,
        callback: TypingCallback,
    ) -> Result<(), EngineError> {
        self.with_state(conversation, |state| state.callbacks.typing.push(callback))
            .await
    }

    pub async fn on_status(
        &self,
        conversation: ConversationId,
        callback: StatusCallback,
    ) -> Result<(), EngineError> {
        self.with_state(conversation, |state| state.callbacks.status.push(callback))
            .await
    }

    // -- diagnostics ---------------------------------------------------------

    pub async fn connection_status(
        &self,
        conversation: ConversationId,
    ) -> Option<SubscriptionStatus> {
        self.inner
            .lock()
            .await
            .conversations
            .get(&conversation)
            .map(|s| s.subscription.status)
    }

    pub async fn active_conversation_count(&self) -> usize {
        self.inner.lock().await.conversations.len()
    }

    pub fn quota_usage(&self) -> QuotaUsage {
        self.quota.usage()
    }

    /// Snapshot of a conversation's cached messages, in insertion order.
    pub async fn messages(&self, conversation: ConversationId) -> Vec<Message> {
        self.inner
            .lock()
            .await
            .conversations
            .get(&conversation)
            .map(|s| s.cache.messages().cloned().collect())
            .unwrap_or_default()
    }

    /// Leave every conversation.
    pub async fn shutdown(&self) {
        let ids: Vec<_> = {
            let inner = self.inner.lock().await;
            inner.conversations.keys().copied().collect()
        };
        for id in ids {
            self.leave_conversation(id).await;
        }
    }

    async fn with_state(
        &self,
        conversation: ConversationId,
        f: impl FnOnce(&mut ConversationState),
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        let state = inner
            .conversations
            .get_mut(&conversation)
            .ok_or(EngineError::NotConnected)?;
        f(state);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-conversation event loop
// ---------------------------------------------------------------------------

enum LoopExit {
    /// The conversation state is gone (leave or engine shutdown).
    Gone,
    /// The channel went down; the outer loop decides whether to retry.
    Down,
}

enum EventOutcome {
    Continue,
    /// The subscription just went live; resets the retry run.
    Live,
    ChannelDown,
    Gone,
}

async fn conversation_loop(
    driver: Arc<dyn ChannelDriver>,
    config: EngineConfig,
    quota: Arc<QuotaLedger>,
    inner: Arc<Mutex<EngineInner>>,
    conversation: ConversationId,
    local_user: PresenceMeta,
) {
    let mut attempt: u32 = 0;

    loop {
        {
            let mut guard = inner.lock().await;
            let inner_ref = &mut *guard;
            let Some(state) = inner_ref.conversations.get_mut(&conversation) else {
                return;
            };
            state.subscription.apply(SubscriptionStatus::Connecting);
            state.subscription.retries = attempt;

            if let Some(circuit) = inner_ref.circuits.get_mut(&conversation) {
                if circuit.check(Instant::now()).is_err() {
                    error!(conversation = %conversation, "Circuit open, abandoning reconnect");
                    state.subscription.apply(SubscriptionStatus::Failed);
                    state.deliver_status(SubscriptionStatus::Failed);
                    inner_ref.settling.remove(&conversation);
                    return;
                }
            }
        }

        let (handle, mut events) = driver.open(conversation, local_user.clone());
        {
            let mut guard = inner.lock().await;
            let Some(state) = guard.conversations.get_mut(&conversation) else {
                return;
            };
            state.handle = Some(handle.clone());
        }

        let mut health = tokio::time::interval(config.health_check_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the immediate first tick; the subscribe itself proves liveness.
        health.reset();

        let exit = channel_loop(
            &config,
            &quota,
            &inner,
            conversation,
            &local_user,
            &handle,
            &mut events,
            &mut health,
            &mut attempt,
        )
        .await;

        if matches!(exit, LoopExit::Gone) {
            return;
        }

        attempt += 1;
        let give_up = {
            let mut guard = inner.lock().await;
            let inner_ref = &mut *guard;
            let Some(state) = inner_ref.conversations.get_mut(&conversation) else {
                return;
            };
            state.subscription.retries = attempt;
            if let Some(circuit) = inner_ref.circuits.get_mut(&conversation) {
                circuit.record_failure(Instant::now());
            }
            attempt > config.retry_budget
                || quota.is_critical()
                || !state.subscription.status.is_retryable()
        };

        if give_up {
            let mut guard = inner.lock().await;
            if let Some(state) = guard.conversations.get_mut(&conversation) {
                error!(
                    conversation = %conversation,
                    attempts = attempt,
                    "Giving up on conversation, manual re-join required"
                );
                state.subscription.apply(SubscriptionStatus::Failed);
                state.deliver_status(SubscriptionStatus::Failed);
            }
            guard.settling.remove(&conversation);
            return;
        }

        let delay = backoff_delay(attempt, &config);
        info!(
            conversation = %conversation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        sleep(delay).await;
    }
}

/// Drive one open channel until it dies or the conversation goes away.
#[allow(clippy::too_many_arguments)]
async fn channel_loop(
    config: &EngineConfig,
    quota: &Arc<QuotaLedger>,
    inner: &Arc<Mutex<EngineInner>>,
    conversation: ConversationId,
    local_user: &PresenceMeta,
    handle: &ChannelHandle,
    events: &mut mpsc::Receiver<ChannelEvent>,
    health: &mut tokio::time::Interval,
    attempt: &mut u32,
) -> LoopExit {
    loop {
        let (batch_deadline, typing_deadline) = {
            let guard = inner.lock().await;
            let Some(state) = guard.conversations.get(&conversation) else {
                return LoopExit::Gone;
            };
            (state.batch.deadline(), state.typing.next_expiry())
        };

        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    // The transport dropped the event stream without a
                    // status callback; treat it as a channel error.
                    let mut guard = inner.lock().await;
                    if let Some(state) = guard.conversations.get_mut(&conversation) {
                        state.subscription.apply(SubscriptionStatus::ChannelError);
                        state.deliver_status(SubscriptionStatus::ChannelError);
                    }
                    return LoopExit::Down;
                };
                match handle_event(config, quota, inner, conversation, local_user, handle, event).await {
                    EventOutcome::Continue => {}
                    EventOutcome::Live => {
                        *attempt = 0;
                        let mut guard = inner.lock().await;
                        if let Some(circuit) = guard.circuits.get_mut(&conversation) {
                            circuit.record_success();
                        }
                        // The loop owns the settling guard so an abandoned
                        // join future cannot leave it stuck.
                        guard.settling.remove(&conversation);
                    }
                    EventOutcome::ChannelDown => return LoopExit::Down,
                    EventOutcome::Gone => return LoopExit::Gone,
                }
            }

            _ = health.tick() => {
                let healthy = matches!(
                    timeout(config.health_staleness, handle.ping()).await,
                    Ok(Ok(()))
                );
                let mut guard = inner.lock().await;
                let Some(state) = guard.conversations.get_mut(&conversation) else {
                    return LoopExit::Gone;
                };
                state.subscription.health_probes += 1;
                if !healthy {
                    warn!(conversation = %conversation, "Health probe failed, escalating");
                    state.subscription.apply(SubscriptionStatus::ChannelError);
                    state.deliver_status(SubscriptionStatus::ChannelError);
                    return LoopExit::Down;
                }
                debug!(conversation = %conversation, probes = state.subscription.health_probes, "Health probe ok");
            }

            _ = sleep_until(batch_deadline.unwrap_or_else(Instant::now)),
                if batch_deadline.is_some() =>
            {
                flush_batch(inner, conversation).await;
            }

            _ = sleep_until(typing_deadline.unwrap_or_else(Instant::now)),
                if typing_deadline.is_some() =>
            {
                let mut guard = inner.lock().await;
                let Some(state) = guard.conversations.get_mut(&conversation) else {
                    return LoopExit::Gone;
                };
                for stop in state.typing.expire(Instant::now()) {
                    state.deliver_typing(&stop);
                }
            }
        }
    }
}

async fn handle_event(
    config: &EngineConfig,
    quota: &Arc<QuotaLedger>,
    inner: &Arc<Mutex<EngineInner>>,
    conversation: ConversationId,
    local_user: &PresenceMeta,
    handle: &ChannelHandle,
    event: ChannelEvent,
) -> EventOutcome {
    match event {
        ChannelEvent::RowInserted(message) => {
            quota.record();
            let mut guard = inner.lock().await;
            let Some(state) = guard.conversations.get_mut(&conversation) else {
                return EventOutcome::Gone;
            };
            let priority = Priority::for_message(&message);
            match state.cache.admit_remote(message.clone()) {
                Admission::Inserted => {
                    state
                        .batch
                        .enqueue(MessageEvent::Inserted(message), priority, Instant::now(), false);
                }
                Admission::Replaced { retired } => {
                    state.batch.enqueue(
                        MessageEvent::Replaced { retired, message },
                        priority,
                        Instant::now(),
                        false,
                    );
                }
                Admission::Rejected(reason) => {
                    debug!(conversation = %conversation, reason = ?reason, "Dropped duplicate row");
                    return EventOutcome::Continue;
                }
            }
            if state.batch.should_flush_now() {
                flush_batch_locked(state);
            }
            EventOutcome::Continue
        }

        ChannelEvent::RowUpdated(message) => {
            quota.record();
            let mut guard = inner.lock().await;
            let Some(state) = guard.conversations.get_mut(&conversation) else {
                return EventOutcome::Gone;
            };
            let priority = Priority::for_message(&message);
            state.cache.apply_update(message.clone());
            state
                .batch
                .enqueue(MessageEvent::Updated(message), priority, Instant::now(), false);
            if state.batch.should_flush_now() {
                flush_batch_locked(state);
            }
            EventOutcome::Continue
        }

        ChannelEvent::PresenceSync(snapshot) => {
            let mut guard = inner.lock().await;
            let Some(state) = guard.conversations.get_mut(&conversation) else {
                return EventOutcome::Gone;
            };
            if state.roster.apply_snapshot(snapshot) {
                state.deliver_presence();
            }
            EventOutcome::Continue
        }

        // Join/leave notifications are advisory: always re-pull the full
        // snapshot instead of patching incrementally.
        ChannelEvent::PresenceJoin(user) | ChannelEvent::PresenceLeave(user) => {
            debug!(conversation = %conversation, user = %user, "Presence change, resyncing");
            let snapshot = match handle.presence_state().await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    debug!(conversation = %conversation, error = %e, "Presence resync failed");
                    return EventOutcome::Continue;
                }
            };
            let mut guard = inner.lock().await;
            let Some(state) = guard.conversations.get_mut(&conversation) else {
                return EventOutcome::Gone;
            };
            if state.roster.apply_snapshot(snapshot) {
                state.deliver_presence();
            }
            EventOutcome::Continue
        }

        ChannelEvent::Broadcast { event, payload } if event == EVENT_TYPING => {
            quota.record();
            let signal: TypingSignal = match serde_json::from_value(payload) {
                Ok(signal) => signal,
                Err(e) => {
                    debug!(conversation = %conversation, error = %e, "Malformed typing payload");
                    return EventOutcome::Continue;
                }
            };
            if signal.user_id == local_user.user_id {
                return EventOutcome::Continue;
            }
            let mut guard = inner.lock().await;
            let Some(state) = guard.conversations.get_mut(&conversation) else {
                return EventOutcome::Gone;
            };
            let now = Instant::now();
            if let Some(signal) = state.typing.observe(signal, now) {
                if state.typing.allow_notify(now) {
                    state.deliver_typing(&signal);
                }
            }
            EventOutcome::Continue
        }

        ChannelEvent::Broadcast { event, payload } if event == EVENT_ANNOUNCEMENT => {
            quota.record();
            let mut guard = inner.lock().await;
            let Some(state) = guard.conversations.get_mut(&conversation) else {
                return EventOutcome::Gone;
            };
            // Announcements are synthesized as system messages and flush
            // everything pending along with them.
            if let Ok(message) = serde_json::from_value::<Message>(payload) {
                state.batch.enqueue(
                    MessageEvent::Inserted(message),
                    Priority::High,
                    Instant::now(),
                    true,
                );
            }
            flush_batch_locked(state);
            EventOutcome::Continue
        }

        ChannelEvent::Broadcast { event, .. } => {
            debug!(conversation = %conversation, event = %event, "Ignoring unknown broadcast");
            EventOutcome::Continue
        }

        ChannelEvent::StatusChanged(status) => {
            let to = SubscriptionStatus::from(status);
            let transition = {
                let mut guard = inner.lock().await;
                let Some(state) = guard.conversations.get_mut(&conversation) else {
                    return EventOutcome::Gone;
                };
                let transition = state.subscription.apply(to);
                if transition == Transition::Accepted {
                    state.deliver_status(to);
                }
                transition
            };
            if transition != Transition::Accepted {
                return EventOutcome::Continue;
            }

            match to {
                SubscriptionStatus::Subscribed => {
                    if let Err(e) = handle.track_presence(local_user.clone()).await {
                        debug!(conversation = %conversation, error = %e, "Presence track failed");
                    }
                    match handle.fetch_history(config.history_fetch_limit).await {
                        Ok(rows) => {
                            let mut guard = inner.lock().await;
                            let Some(state) = guard.conversations.get_mut(&conversation) else {
                                return EventOutcome::Gone;
                            };
                            info!(conversation = %conversation, rows = rows.len(), "History seeded");
                            state.cache.seed_history(rows);
                        }
                        // Non-fatal: live events still flow into the cache.
                        Err(e) => {
                            warn!(conversation = %conversation, error = %e, "History fetch failed")
                        }
                    }
                    EventOutcome::Live
                }
                // Closed while subscribed counts as an error for retry
                // purposes, same as an explicit channel error.
                SubscriptionStatus::ChannelError
                | SubscriptionStatus::TimedOut
                | SubscriptionStatus::Closed => EventOutcome::ChannelDown,
                _ => EventOutcome::Continue,
            }
        }
    }
}

async fn flush_batch(inner: &Arc<Mutex<EngineInner>>, conversation: ConversationId) {
    let mut guard = inner.lock().await;
    if let Some(state) = guard.conversations.get_mut(&conversation) {
        flush_batch_locked(state);
    }
}

/// Drain and deliver the pending batch, feeding observed callback latency
/// back into the adaptive window.
fn flush_batch_locked(state: &mut ConversationState) {
    let batch = state.batch.flush();
    if batch.is_empty() {
        return;
    }
    let started = std::time::Instant::now();
    state.deliver_messages(&batch);
    state.batch.observe_latency(started.elapsed());
}
