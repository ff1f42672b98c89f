//! In-process topic exchange broker.
//!
//! Follows AMQP semantics closely enough to exercise the publisher and consumer:
//! durable topic exchanges, `*`/`#` bindings, the default exchange, per-session
//! prefetch, ack/nack with requeue, dead-letter exchanges, and requeue of
//! unacknowledged messages when a session goes away.
//!
//! Failure injection (`fail_next_connects`, `set_unavailable`, `disconnect_all`)
//! drives the reconnect paths in tests.

use super::{
    Acknowledger, BrokerConnector, BrokerSession, Delivery, DeliveryStream, ExchangeSpec,
    OutboundMessage, QueueSpec,
};
use crate::error::TransportError;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};

/// Counters for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages waiting for a consumer
    pub ready: usize,
    /// Delivered and not yet settled
    pub unacked: usize,
    pub delivered: u64,
    pub acked: u64,
    pub nacked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub discarded: u64,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
}

struct ConsumerHandle {
    session_id: u64,
    tx: mpsc::UnboundedSender<Result<Delivery, TransportError>>,
}

struct Unacked {
    session_id: u64,
    message: StoredMessage,
}

struct MemoryQueue {
    durable: bool,
    dead_letter_exchange: Option<String>,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerHandle>,
    next_consumer: usize,
    unacked: HashMap<u64, Unacked>,
    stats: QueueStats,
}

impl MemoryQueue {
    fn new(spec: &QueueSpec) -> Self {
        Self {
            durable: spec.durable,
            dead_letter_exchange: spec.dead_letter_exchange.clone(),
            ready: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
            unacked: HashMap::new(),
            stats: QueueStats::default(),
        }
    }

    fn snapshot(&self) -> QueueStats {
        QueueStats {
            ready: self.ready.len(),
            unacked: self.unacked.len(),
            ..self.stats
        }
    }
}

struct Binding {
    exchange: String,
    queue: String,
    pattern: String,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, bool>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<Binding>,
    sessions: HashMap<u64, Option<u16>>,
    next_session_id: u64,
    next_delivery_tag: u64,
    published: u64,
    unroutable: u64,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    connect_attempts: AtomicU32,
    pending_connect_failures: AtomicU32,
    unavailable: AtomicBool,
    changed: Notify,
}

impl BrokerInner {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory broker. Clones share the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.inner
            .pending_connect_failures
            .store(count, Ordering::SeqCst);
    }

    /// Refuse every connection attempt while `unavailable` is true.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Total connection attempts seen, successful or not.
    pub fn connect_attempts(&self) -> u32 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Drop every open session, as if the broker restarted. Unacked messages are requeued.
    pub fn disconnect_all(&self) {
        let ids: Vec<u64> = self.inner.state().sessions.keys().copied().collect();
        for id in ids {
            close_session(&self.inner, id);
        }
    }

    pub fn open_sessions(&self) -> usize {
        self.inner.state().sessions.len()
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        self.inner.state().exchanges.contains_key(name)
    }

    /// Durability flag of a declared queue.
    pub fn queue_durable(&self, name: &str) -> Option<bool> {
        self.inner.state().queues.get(name).map(|q| q.durable)
    }

    /// Routing patterns bound to `queue` on `exchange`.
    pub fn bindings(&self, exchange: &str, queue: &str) -> Vec<String> {
        self.inner
            .state()
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && b.queue == queue)
            .map(|b| b.pattern.clone())
            .collect()
    }

    pub fn queue_stats(&self, name: &str) -> Option<QueueStats> {
        self.inner.state().queues.get(name).map(MemoryQueue::snapshot)
    }

    /// Bodies of messages waiting in `queue`.
    pub fn ready_messages(&self, name: &str) -> Vec<Vec<u8>> {
        self.inner
            .state()
            .queues
            .get(name)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Messages accepted by any exchange.
    pub fn published_count(&self) -> u64 {
        self.inner.state().published
    }

    /// Messages that matched no binding.
    pub fn unroutable_count(&self) -> u64 {
        self.inner.state().unroutable
    }

    /// Wait until the stats of `queue` satisfy `predicate`.
    ///
    /// Wrap in `tokio::time::timeout` in tests.
    pub async fn wait_for_queue<F>(&self, queue: &str, predicate: F) -> QueueStats
    where
        F: Fn(&QueueStats) -> bool,
    {
        loop {
            let notified = self.inner.changed.notified();
            if let Some(stats) = self.queue_stats(queue) {
                if predicate(&stats) {
                    return stats;
                }
            }
            notified.await;
        }
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerSession>, TransportError> {
        let attempt = self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1;

        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(TransportError::Connection(
                "connection refused (broker unavailable)".to_string(),
            ));
        }

        let pending = self.inner.pending_connect_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.inner
                .pending_connect_failures
                .store(pending - 1, Ordering::SeqCst);
            return Err(TransportError::Connection(format!(
                "connection refused (injected failure, attempt {})",
                attempt
            )));
        }

        let id = {
            let mut state = self.inner.state();
            state.next_session_id += 1;
            let id = state.next_session_id;
            state.sessions.insert(id, None);
            id
        };
        debug!(session_id = id, "In-memory broker session opened");

        Ok(Arc::new(MemorySession {
            id,
            broker: Arc::clone(&self.inner),
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

struct MemorySession {
    id: u64,
    broker: Arc<BrokerInner>,
}

impl MemorySession {
    fn ensure_open(&self, state: &BrokerState) -> Result<(), TransportError> {
        if state.sessions.contains_key(&self.id) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        self.ensure_open(&state)?;

        match state.exchanges.get(&exchange.name) {
            Some(durable) if *durable != exchange.durable => Err(TransportError::Channel(format!(
                "PRECONDITION_FAILED - inequivalent arg 'durable' for exchange '{}'",
                exchange.name
            ))),
            Some(_) => Ok(()),
            None => {
                state
                    .exchanges
                    .insert(exchange.name.clone(), exchange.durable);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        self.ensure_open(&state)?;

        match state.queues.get(&queue.name) {
            Some(existing) if existing.durable != queue.durable => {
                Err(TransportError::Channel(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{}'",
                    queue.name
                )))
            }
            Some(_) => Ok(()),
            None => {
                state
                    .queues
                    .insert(queue.name.clone(), MemoryQueue::new(queue));
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        self.ensure_open(&state)?;

        if !state.exchanges.contains_key(exchange) {
            return Err(TransportError::Channel(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }
        if !state.queues.contains_key(queue) {
            return Err(TransportError::Channel(format!(
                "NOT_FOUND - no queue '{}'",
                queue
            )));
        }

        let exists = state
            .bindings
            .iter()
            .any(|b| b.exchange == exchange && b.queue == queue && b.pattern == routing_key);
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                pattern: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        self.ensure_open(&state)?;
        state
            .sessions
            .insert(self.id, if count == 0 { None } else { Some(count) });
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        {
            let state = self.broker.state();
            self.ensure_open(&state)?;
        }
        route(&self.broker, exchange, routing_key, message.body, false)?;
        self.broker.changed.notify_waiters();
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.broker.state();
            self.ensure_open(&state)?;
            let q = state.queues.get_mut(queue).ok_or_else(|| {
                TransportError::Channel(format!("NOT_FOUND - no queue '{}'", queue))
            })?;
            q.consumers.push(ConsumerHandle {
                session_id: self.id,
                tx,
            });
            dispatch(&self.broker, &mut state, queue);
        }
        debug!(queue, consumer_tag, session_id = self.id, "In-memory consumer registered");
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    fn is_open(&self) -> bool {
        self.broker.state().sessions.contains_key(&self.id)
    }

    async fn close(&self) -> Result<(), TransportError> {
        close_session(&self.broker, self.id);
        Ok(())
    }
}

struct MemoryAcker {
    broker: Arc<BrokerInner>,
    queue: String,
    session_id: u64,
    delivery_tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> Result<(), TransportError> {
        let dead_letter = {
            let mut state = self.broker.state();
            if !state.sessions.contains_key(&self.session_id) {
                return Err(TransportError::Closed);
            }
            let q = state
                .queues
                .get_mut(&self.queue)
                .ok_or(TransportError::UnknownDeliveryTag(self.delivery_tag))?;
            let entry = q
                .unacked
                .remove(&self.delivery_tag)
                .ok_or(TransportError::UnknownDeliveryTag(self.delivery_tag))?;

            let dead_letter = match requeue {
                None => {
                    q.stats.acked += 1;
                    None
                }
                Some(true) => {
                    q.stats.nacked += 1;
                    q.stats.requeued += 1;
                    let mut message = entry.message;
                    message.redelivered = true;
                    q.ready.push_front(message);
                    None
                }
                Some(false) => {
                    q.stats.nacked += 1;
                    match q.dead_letter_exchange.clone() {
                        Some(dlx) => Some((dlx, entry.message)),
                        None => {
                            q.stats.discarded += 1;
                            None
                        }
                    }
                }
            };
            dispatch(&self.broker, &mut state, &self.queue);
            dead_letter
        };

        if let Some((dlx, message)) = dead_letter {
            let routed = route(&self.broker, &dlx, &message.routing_key, message.body, true);
            let mut state = self.broker.state();
            if let Some(q) = state.queues.get_mut(&self.queue) {
                match routed {
                    Ok(true) => q.stats.dead_lettered += 1,
                    _ => q.stats.discarded += 1,
                }
            }
        }

        self.broker.changed.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.settle(None)
    }

    async fn nack(&self, requeue: bool) -> Result<(), TransportError> {
        self.settle(Some(requeue))
    }
}

/// AMQP topic matching: words split on `.`, `*` matches one word, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&k, key_rest)) => (word == "*" || word == k) && match_words(rest, key_rest),
            None => false,
        },
    }
}

/// Route a message through an exchange. Returns whether any queue received it.
fn route(
    broker: &Arc<BrokerInner>,
    exchange: &str,
    routing_key: &str,
    body: Vec<u8>,
    redelivered: bool,
) -> Result<bool, TransportError> {
    let mut state = broker.state();

    let targets: Vec<String> = if exchange.is_empty() {
        // Default exchange: routing key names the queue
        if state.queues.contains_key(routing_key) {
            vec![routing_key.to_string()]
        } else {
            Vec::new()
        }
    } else {
        if !state.exchanges.contains_key(exchange) {
            return Err(TransportError::Channel(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }
        let mut seen = HashSet::new();
        state
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && topic_matches(&b.pattern, routing_key))
            .filter(|b| seen.insert(b.queue.clone()))
            .map(|b| b.queue.clone())
            .collect()
    };

    state.published += 1;
    if targets.is_empty() {
        state.unroutable += 1;
        trace!(exchange, routing_key, "Message matched no binding");
        return Ok(false);
    }

    for queue in &targets {
        if let Some(q) = state.queues.get_mut(queue) {
            q.ready.push_back(StoredMessage {
                routing_key: routing_key.to_string(),
                body: body.clone(),
                redelivered,
            });
        }
        dispatch(broker, &mut state, queue);
    }
    Ok(true)
}

/// Hand ready messages to consumers, honouring each session's prefetch.
fn dispatch(broker: &Arc<BrokerInner>, state: &mut BrokerState, queue: &str) {
    loop {
        let Some(q) = state.queues.get(queue) else {
            return;
        };
        if q.ready.is_empty() || q.consumers.is_empty() {
            return;
        }

        // Pick the next consumer with prefetch capacity, round robin
        let count = q.consumers.len();
        let chosen = (0..count)
            .map(|offset| (q.next_consumer + offset) % count)
            .find(|&idx| {
                let session_id = q.consumers[idx].session_id;
                match state.sessions.get(&session_id) {
                    Some(Some(limit)) => {
                        let in_flight =
                            q.unacked.values().filter(|u| u.session_id == session_id).count();
                        in_flight < usize::from(*limit)
                    }
                    Some(None) => true,
                    None => false,
                }
            });
        let Some(idx) = chosen else {
            return;
        };

        state.next_delivery_tag += 1;
        let delivery_tag = state.next_delivery_tag;

        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        let Some(message) = q.ready.pop_front() else {
            return;
        };
        let session_id = q.consumers[idx].session_id;
        q.next_consumer = (idx + 1) % count;

        let delivery = Delivery::new(
            queue,
            delivery_tag,
            message.routing_key.clone(),
            message.redelivered,
            message.body.clone(),
            Box::new(MemoryAcker {
                broker: Arc::clone(broker),
                queue: queue.to_string(),
                session_id,
                delivery_tag,
            }),
        );

        if q.consumers[idx].tx.send(Ok(delivery)).is_err() {
            // Receiver dropped: forget the consumer and keep the message
            q.consumers.remove(idx);
            q.next_consumer = 0;
            q.ready.push_front(message);
            continue;
        }

        q.unacked.insert(
            delivery_tag,
            Unacked {
                session_id,
                message,
            },
        );
        q.stats.delivered += 1;
    }
}

/// Remove a session: its consumer streams end and its unacked messages are requeued.
fn close_session(broker: &Arc<BrokerInner>, session_id: u64) {
    let mut state = broker.state();
    if state.sessions.remove(&session_id).is_none() {
        return;
    }

    let names: Vec<String> = state.queues.keys().cloned().collect();
    for name in &names {
        if let Some(q) = state.queues.get_mut(name) {
            q.consumers.retain(|c| c.session_id != session_id);
            q.next_consumer = 0;

            let mut orphaned: Vec<(u64, StoredMessage)> = q
                .unacked
                .iter()
                .filter(|(_, u)| u.session_id == session_id)
                .map(|(tag, u)| (*tag, u.message.clone()))
                .collect();
            // Oldest first back at the head of the queue
            orphaned.sort_by_key(|(tag, _)| *tag);
            for (tag, mut message) in orphaned.into_iter().rev() {
                q.unacked.remove(&tag);
                message.redelivered = true;
                q.ready.push_front(message);
                q.stats.requeued += 1;
            }
        }
        dispatch(broker, &mut state, name);
    }

    debug!(session_id, "In-memory broker session closed");
    drop(state);
    broker.changed.notify_waiters();
}
