//! In-process broker
//!
//! Implements the routing rules of the three exchange kinds, durable queues,
//! ack/nack with requeue, and broker outages. Used by the test suites and by
//! `eb-node --memory-broker`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use eb_common::{ExchangeKind, ExchangeSpec, QueueBinding};
use eb_config::BrokerConfig;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use crate::transport::{Acker, Broker, BrokerConnection, DeliveryStream, InboundDelivery};
use crate::BusError;

/// Topic pattern match: `*` is exactly one word, `#` is zero or more words
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}

// ============================================================================
// Broker State
// ============================================================================

struct StoredMessage {
    body: Vec<u8>,
    routing_key: String,
    redelivered: bool,
}

struct MemoryQueue {
    durable: bool,
    messages: Mutex<VecDeque<StoredMessage>>,
    notify: Notify,
    acked: AtomicU64,
    requeued: AtomicU64,
    rejected: AtomicU64,
}

impl MemoryQueue {
    fn new(durable: bool) -> Self {
        Self {
            durable,
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            acked: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    fn push_back(&self, message: StoredMessage) {
        self.messages.lock().push_back(message);
        self.notify.notify_one();
    }

    fn push_front(&self, message: StoredMessage) {
        self.messages.lock().push_front(message);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<StoredMessage> {
        let mut messages = self.messages.lock();
        let message = messages.pop_front();
        if !messages.is_empty() {
            // Another consumer on the same queue may be waiting
            self.notify.notify_one();
        }
        message
    }

    fn wake_all(&self) {
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

struct ExchangeEntry {
    spec: ExchangeSpec,
    /// (queue, binding key)
    bindings: Vec<(String, String)>,
}

#[derive(Default)]
struct BrokerState {
    unavailable: AtomicBool,
    /// Push deliveries to consumers ahead of processing, like a channel prefetch
    prefetch: AtomicBool,
    generation: AtomicU64,
    connect_attempts: AtomicU32,
    exchange_declarations: AtomicU32,
    exchanges: Mutex<HashMap<String, ExchangeEntry>>,
    queues: DashMap<String, Arc<MemoryQueue>>,
}

impl BrokerState {
    fn queue(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        self.queues.get(name).map(|q| Arc::clone(q.value()))
    }

    fn wake_all_queues(&self) {
        for queue in self.queues.iter() {
            queue.value().wake_all();
        }
    }

    fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BusError> {
        self.exchange_declarations.fetch_add(1, Ordering::Relaxed);
        let mut exchanges = self.exchanges.lock();
        match exchanges.get(&spec.name) {
            Some(existing) if existing.spec != *spec => Err(BusError::declaration(format!(
                "exchange '{}' exists as {} (durable={}), requested {} (durable={})",
                spec.name,
                existing.spec.kind.as_str(),
                existing.spec.durable,
                spec.kind.as_str(),
                spec.durable
            ))),
            Some(_) => Ok(()),
            None => {
                exchanges.insert(
                    spec.name.clone(),
                    ExchangeEntry {
                        spec: spec.clone(),
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, BusError> {
        let exchanges = self.exchanges.lock();
        let entry = exchanges
            .get(exchange)
            .ok_or_else(|| BusError::publish(format!("no exchange '{}'", exchange)))?;

        let mut targets: Vec<String> = Vec::new();
        for (queue, key) in &entry.bindings {
            let matched = match entry.spec.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Direct => key == routing_key,
                ExchangeKind::Topic => topic_matches(key, routing_key),
            };
            if matched && !targets.contains(queue) {
                targets.push(queue.clone());
            }
        }
        Ok(targets)
    }
}

// ============================================================================
// Broker
// ============================================================================

/// In-memory broker. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage. Going down kills every open connection.
    pub fn set_available(&self, available: bool) {
        let was_available = !self.state.unavailable.swap(!available, Ordering::SeqCst);
        if was_available && !available {
            self.state.generation.fetch_add(1, Ordering::SeqCst);
            self.state.wake_all_queues();
            debug!("Memory broker went down");
        }
    }

    /// With prefetch on, consumers receive every ready message up front and
    /// hold them unsettled until processed or handed back.
    pub fn set_prefetch(&self, enabled: bool) {
        self.state.prefetch.store(enabled, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.connect_attempts.load(Ordering::Relaxed)
    }

    pub fn exchange_declarations(&self) -> u32 {
        self.state.exchange_declarations.load(Ordering::Relaxed)
    }

    /// Declare an exchange out of band, as another process would
    pub fn seed_exchange(&self, spec: ExchangeSpec) -> Result<(), BusError> {
        self.state.declare_exchange(&spec)
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        self.state.exchanges.lock().get(name).map(|e| e.spec.clone())
    }

    /// Queues bound to `exchange`, with their binding keys
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.state
            .exchanges
            .lock()
            .get(exchange)
            .map(|e| e.bindings.clone())
            .unwrap_or_default()
    }

    /// Put raw bytes straight into a queue, bypassing exchanges
    pub fn inject(&self, queue: &str, routing_key: &str, body: impl Into<Vec<u8>>) -> bool {
        match self.state.queue(queue) {
            Some(q) => {
                q.push_back(StoredMessage {
                    body: body.into(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                });
                true
            }
            None => false,
        }
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state.queue(queue).map(|q| q.messages.lock().len()).unwrap_or(0)
    }

    pub fn acked(&self, queue: &str) -> u64 {
        self.state.queue(queue).map(|q| q.acked.load(Ordering::Relaxed)).unwrap_or(0)
    }

    pub fn requeued(&self, queue: &str) -> u64 {
        self.state.queue(queue).map(|q| q.requeued.load(Ordering::Relaxed)).unwrap_or(0)
    }

    pub fn rejected(&self, queue: &str) -> u64 {
        self.state.queue(queue).map(|q| q.rejected.load(Ordering::Relaxed)).unwrap_or(0)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, _config: &BrokerConfig) -> Result<Arc<dyn BrokerConnection>, BusError> {
        self.state.connect_attempts.fetch_add(1, Ordering::Relaxed);
        if self.state.unavailable.load(Ordering::SeqCst) {
            return Err(BusError::connection("connection refused"));
        }

        Ok(Arc::new(MemoryConnection {
            shared: Arc::new(ConnectionShared {
                state: Arc::clone(&self.state),
                generation: self.state.generation.load(Ordering::SeqCst),
                open: AtomicBool::new(true),
                cancelled: Mutex::new(HashSet::new()),
            }),
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ============================================================================
// Connection
// ============================================================================

struct ConnectionShared {
    state: Arc<BrokerState>,
    generation: u64,
    open: AtomicBool,
    cancelled: Mutex<HashSet<String>>,
}

impl ConnectionShared {
    fn is_alive(&self) -> bool {
        self.open.load(Ordering::SeqCst)
            && !self.state.unavailable.load(Ordering::SeqCst)
            && self.state.generation.load(Ordering::SeqCst) == self.generation
    }

    fn check_alive(&self) -> Result<(), BusError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(BusError::connection("connection closed"))
        }
    }
}

pub struct MemoryConnection {
    shared: Arc<ConnectionShared>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_healthy(&self) -> bool {
        self.shared.is_alive()
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BusError> {
        self.shared.check_alive()?;
        self.shared.state.declare_exchange(spec)
    }

    async fn declare_queue(&self, binding: &QueueBinding) -> Result<(), BusError> {
        self.shared.check_alive()?;
        let state = &self.shared.state;

        let queue = state
            .queues
            .entry(binding.queue_name.clone())
            .or_insert_with(|| Arc::new(MemoryQueue::new(binding.durable)))
            .clone();
        if queue.durable != binding.durable {
            return Err(BusError::declaration(format!(
                "queue '{}' exists with durable={}",
                binding.queue_name, queue.durable
            )));
        }

        let mut exchanges = state.exchanges.lock();
        let entry = exchanges
            .get_mut(&binding.exchange)
            .ok_or_else(|| BusError::declaration(format!("no exchange '{}'", binding.exchange)))?;
        let pair = (binding.queue_name.clone(), binding.routing_key.clone());
        if !entry.bindings.contains(&pair) {
            entry.bindings.push(pair);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        _persistent: bool,
    ) -> Result<(), BusError> {
        self.shared.check_alive()?;
        for queue_name in self.shared.state.route(exchange, routing_key)? {
            if let Some(queue) = self.shared.state.queue(&queue_name) {
                queue.push_back(StoredMessage {
                    body: body.to_vec(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                });
            }
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BusError> {
        self.shared.check_alive()?;
        let target = self
            .shared
            .state
            .queue(queue)
            .ok_or_else(|| BusError::consume(format!("no queue '{}'", queue)))?;

        let ctx = ConsumeContext {
            conn: Arc::clone(&self.shared),
            queue: target,
            tag: consumer_tag.to_string(),
        };

        if !self.shared.state.prefetch.load(Ordering::SeqCst) {
            let stream = futures::stream::unfold(ctx, |ctx| async move {
                ctx.next().await.map(|delivery| (Ok(delivery), ctx))
            });
            return Ok(stream.boxed());
        }

        let (tx, rx) = mpsc::unbounded_channel::<Result<InboundDelivery, BusError>>();
        tokio::spawn(async move {
            loop {
                let delivery = tokio::select! {
                    _ = tx.closed() => break,
                    delivery = ctx.next() => delivery,
                };
                match delivery {
                    Some(delivery) => {
                        if tx.send(Ok(delivery)).is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        });
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BusError> {
        self.shared.cancelled.lock().insert(consumer_tag.to_string());
        self.shared.state.wake_all_queues();
        Ok(())
    }

    async fn unbind(&self, binding: &QueueBinding) -> Result<(), BusError> {
        self.shared.check_alive()?;
        if let Some(entry) = self.shared.state.exchanges.lock().get_mut(&binding.exchange) {
            entry
                .bindings
                .retain(|(q, k)| !(q == &binding.queue_name && k == &binding.routing_key));
        }
        Ok(())
    }

    async fn close(&self) {
        self.shared.open.store(false, Ordering::SeqCst);
        self.shared.state.wake_all_queues();
    }
}

struct ConsumeContext {
    conn: Arc<ConnectionShared>,
    queue: Arc<MemoryQueue>,
    tag: String,
}

impl ConsumeContext {
    /// Wait for the next message. `None` once the connection dies or the
    /// consumer is cancelled.
    async fn next(&self) -> Option<InboundDelivery> {
        loop {
            if !self.conn.is_alive() || self.conn.cancelled.lock().contains(&self.tag) {
                return None;
            }
            if let Some(message) = self.queue.pop() {
                let acker = MemoryAcker {
                    conn: Arc::clone(&self.conn),
                    queue: Arc::clone(&self.queue),
                    message: Mutex::new(Some(StoredMessage {
                        body: message.body.clone(),
                        routing_key: message.routing_key.clone(),
                        redelivered: true,
                    })),
                };
                return Some(InboundDelivery::new(
                    message.body,
                    message.routing_key,
                    message.redelivered,
                    Box::new(acker),
                ));
            }
            self.queue.notify.notified().await;
        }
    }
}

/// Holds a copy of the delivery until it is settled.
/// Settling on a dead connection puts the message back, as a real broker would.
struct MemoryAcker {
    conn: Arc<ConnectionShared>,
    queue: Arc<MemoryQueue>,
    message: Mutex<Option<StoredMessage>>,
}

impl MemoryAcker {
    fn take(&self) -> Result<StoredMessage, BusError> {
        let message = self
            .message
            .lock()
            .take()
            .ok_or_else(|| BusError::consume("delivery already settled"))?;
        if !self.conn.is_alive() {
            self.queue.push_front(message);
            return Err(BusError::connection("connection closed before settle"));
        }
        Ok(message)
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), BusError> {
        self.take()?;
        self.queue.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), BusError> {
        let message = self.take()?;
        if requeue {
            self.queue.requeued.fetch_add(1, Ordering::Relaxed);
            self.queue.push_front(message);
        } else {
            self.queue.rejected.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}
