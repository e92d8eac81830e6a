//! Consumer - queue subscriptions with one receive loop each
//!
//! Each subscription declares a durable queue, binds it, and spawns a task that
//! processes one delivery at a time. The handler outcome is mapped to an ack
//! decision; settling the delivery is always the last step.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use eb_common::{AckDecision, Envelope, ExchangeName, QueueBinding};
use futures::{FutureExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::connection::ConnectionManager;
use crate::transport::{DeliveryStream, InboundDelivery};
use crate::{BusError, HandlerError};

// ============================================================================
// Handler
// ============================================================================

/// Processes one envelope.
///
/// `Ok(true)` acknowledges, `Ok(false)` requeues for another attempt,
/// `Err` drops the message.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: Envelope) -> Result<bool, HandlerError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, HandlerError>> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope) -> Result<bool, HandlerError> {
        (self)(envelope).await
    }
}

/// What happened when a delivery went through the handler path
#[derive(Debug)]
pub enum HandlerOutcome {
    Completed(bool),
    Failed(HandlerError),
    Panicked,
    /// Body was not a valid envelope
    Undecodable,
}

impl HandlerOutcome {
    pub fn decision(&self) -> AckDecision {
        match self {
            HandlerOutcome::Completed(true) => AckDecision::Ack,
            HandlerOutcome::Completed(false) => AckDecision::Requeue,
            HandlerOutcome::Failed(_) | HandlerOutcome::Panicked | HandlerOutcome::Undecodable => {
                AckDecision::Reject
            }
        }
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Idle,
    Subscribed,
    Receiving,
}

struct Subscription {
    binding: QueueBinding,
    consumer_tag: String,
    state: Arc<RwLock<SubscriptionState>>,
    /// Set before the broker-side cancel so a closing stream is not resumed
    stopping: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl Subscription {
    fn is_live(&self) -> bool {
        !self.handle.is_finished()
    }
}

pub struct Consumer {
    connection: Arc<ConnectionManager>,
    subscriptions: DashMap<String, Subscription>,
}

impl Consumer {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            subscriptions: DashMap::new(),
        }
    }

    /// Bind `queue_name` to `exchange` under `routing_key` and start receiving.
    ///
    /// Returns `false` if the queue is already subscribed or the broker
    /// could not be reached. An entry whose receive loop has ended is replaced.
    pub async fn subscribe<H>(
        &self,
        queue_name: &str,
        exchange: ExchangeName,
        routing_key: &str,
        handler: H,
    ) -> bool
    where
        H: MessageHandler,
    {
        if self.is_subscribed(queue_name) {
            warn!(queue = queue_name, "Queue already subscribed");
            return false;
        }
        if exchange.kind().requires_routing_key() && routing_key.is_empty() {
            warn!(queue = queue_name, exchange = %exchange, "Binding requires a routing key");
            return false;
        }

        let binding = QueueBinding::durable(queue_name, exchange, routing_key);
        let consumer_tag = format!("{}-{}", queue_name, uuid::Uuid::new_v4().simple());

        let stream = match open_stream(&self.connection, &binding, &consumer_tag).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(queue = queue_name, exchange = %exchange, error = %e, "Subscribe failed");
                return false;
            }
        };

        let state = Arc::new(RwLock::new(SubscriptionState::Subscribed));
        let stopping = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let receive_loop = ReceiveLoop {
            connection: Arc::clone(&self.connection),
            binding: binding.clone(),
            consumer_tag: consumer_tag.clone(),
            handler: Arc::new(handler),
            state: Arc::clone(&state),
            stopping: Arc::clone(&stopping),
        };

        let inserted = match self.subscriptions.entry(queue_name.to_string()) {
            Entry::Occupied(slot) if slot.get().is_live() => false,
            entry => {
                let handle = tokio::spawn(receive_loop.run(stream, shutdown_rx));
                entry.insert(Subscription {
                    binding,
                    consumer_tag: consumer_tag.clone(),
                    state,
                    stopping,
                    shutdown_tx,
                    handle,
                });
                true
            }
        };

        if !inserted {
            // Lost a race with a concurrent subscribe for the same queue
            if let Some(conn) = self.connection.current().await {
                if let Err(e) = conn.cancel(&consumer_tag).await {
                    warn!(queue = queue_name, error = %e, "Failed to cancel duplicate consumer");
                }
            }
            return false;
        }

        info!(queue = queue_name, exchange = %exchange, routing_key, "Subscribed");
        true
    }

    /// Keep calling `subscribe` until it succeeds or `shutdown_rx` fires,
    /// waiting the broker retry delay between passes.
    ///
    /// Returns `false` on shutdown, on an invalid binding, or when the queue
    /// is already subscribed.
    pub async fn subscribe_with_retry<H>(
        &self,
        queue_name: &str,
        exchange: ExchangeName,
        routing_key: &str,
        handler: H,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> bool
    where
        H: MessageHandler + Clone,
    {
        if exchange.kind().requires_routing_key() && routing_key.is_empty() {
            warn!(queue = queue_name, exchange = %exchange, "Binding requires a routing key");
            return false;
        }

        let delay = self.connection.config().retry_delay;
        let mut pass: u32 = 1;
        loop {
            if self.is_subscribed(queue_name) {
                warn!(queue = queue_name, "Queue already subscribed");
                return false;
            }

            let subscribed = tokio::select! {
                _ = shutdown_rx.recv() => return false,
                subscribed = self.subscribe(queue_name, exchange, routing_key, handler.clone()) => subscribed,
            };
            if subscribed {
                return true;
            }

            warn!(queue = queue_name, pass, "Subscription not established, retrying");
            tokio::select! {
                _ = shutdown_rx.recv() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
            pass += 1;
        }
    }

    /// Stop the receive loop and release the queue binding.
    /// No-op for a queue that was never subscribed.
    pub async fn unsubscribe(&self, queue_name: &str) {
        let Some((_, subscription)) = self.subscriptions.remove(queue_name) else {
            debug!(queue = queue_name, "Unsubscribe for unknown queue");
            return;
        };

        // Cancel on the broker first so nothing new is pushed to us; the loop
        // then hands back whatever was already buffered.
        subscription.stopping.store(true, Ordering::SeqCst);
        let conn = self.connection.current().await;
        if let Some(conn) = &conn {
            if let Err(e) = conn.cancel(&subscription.consumer_tag).await {
                warn!(queue = queue_name, error = %e, "Failed to cancel consumer");
            }
        }

        let _ = subscription.shutdown_tx.send(());
        if let Err(e) = subscription.handle.await {
            error!(queue = queue_name, error = %e, "Receive loop ended abnormally");
        }

        if let Some(conn) = &conn {
            if let Err(e) = conn.unbind(&subscription.binding).await {
                warn!(queue = queue_name, error = %e, "Failed to unbind queue");
            }
        }

        info!(queue = queue_name, "Unsubscribed");
    }

    /// Stop every subscription and wait for the loops to exit
    pub async fn shutdown(&self) {
        let queues: Vec<String> = self.subscriptions.iter().map(|s| s.key().clone()).collect();
        for queue in queues {
            self.unsubscribe(&queue).await;
        }
    }

    pub fn state(&self, queue_name: &str) -> SubscriptionState {
        self.subscriptions
            .get(queue_name)
            .map(|s| *s.state.read())
            .unwrap_or(SubscriptionState::Idle)
    }

    /// `true` while the queue has a running receive loop
    pub fn is_subscribed(&self, queue_name: &str) -> bool {
        self.subscriptions
            .get(queue_name)
            .is_some_and(|s| s.is_live())
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.iter().map(|s| s.key().clone()).collect()
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        for subscription in self.subscriptions.iter() {
            let _ = subscription.shutdown_tx.send(());
        }
    }
}

async fn open_stream(
    connection: &ConnectionManager,
    binding: &QueueBinding,
    consumer_tag: &str,
) -> Result<DeliveryStream, BusError> {
    let conn = connection.ensure_connected().await?;
    conn.declare_queue(binding).await?;
    conn.consume(&binding.queue_name, consumer_tag).await
}

// ============================================================================
// Receive Loop
// ============================================================================

struct ReceiveLoop {
    connection: Arc<ConnectionManager>,
    binding: QueueBinding,
    consumer_tag: String,
    handler: Arc<dyn MessageHandler>,
    state: Arc<RwLock<SubscriptionState>>,
    stopping: Arc<AtomicBool>,
}

impl ReceiveLoop {
    async fn run(self, mut stream: DeliveryStream, mut shutdown_rx: broadcast::Receiver<()>) {
        *self.state.write() = SubscriptionState::Receiving;
        debug!(queue = %self.binding.queue_name, "Receive loop started");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    self.requeue_buffered(&mut stream).await;
                    break;
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.process(delivery).await,
                _ if self.stopping.load(Ordering::SeqCst) => break,
                Some(Err(e)) => {
                    warn!(queue = %self.binding.queue_name, error = %e, "Delivery stream failed");
                    match self.resume(&mut shutdown_rx).await {
                        Some(resumed) => stream = resumed,
                        None => break,
                    }
                }
                None => {
                    warn!(queue = %self.binding.queue_name, "Delivery stream closed");
                    match self.resume(&mut shutdown_rx).await {
                        Some(resumed) => stream = resumed,
                        None => break,
                    }
                }
            }
        }

        *self.state.write() = SubscriptionState::Idle;
        info!(queue = %self.binding.queue_name, "Receive loop stopped");
    }

    async fn process(&self, delivery: InboundDelivery) {
        let outcome = match Envelope::from_bytes(&delivery.body) {
            Ok(envelope) => {
                match AssertUnwindSafe(self.handler.handle(envelope)).catch_unwind().await {
                    Ok(Ok(done)) => HandlerOutcome::Completed(done),
                    Ok(Err(e)) => HandlerOutcome::Failed(e),
                    Err(_) => HandlerOutcome::Panicked,
                }
            }
            Err(e) => {
                error!(
                    queue = %self.binding.queue_name,
                    routing_key = %delivery.routing_key,
                    error = %e,
                    "Dropping undecodable message"
                );
                HandlerOutcome::Undecodable
            }
        };

        let decision = outcome.decision();
        match &outcome {
            HandlerOutcome::Failed(e) => {
                error!(queue = %self.binding.queue_name, error = %e, "Handler failed, dropping message")
            }
            HandlerOutcome::Panicked => {
                error!(queue = %self.binding.queue_name, "Handler panicked, dropping message")
            }
            HandlerOutcome::Completed(false) => {
                debug!(queue = %self.binding.queue_name, "Handler asked for redelivery")
            }
            _ => {}
        }

        metrics::counter!(
            "eb_consume_total",
            "queue" => self.binding.queue_name.clone(),
            "decision" => decision.as_str()
        )
        .increment(1);

        if let Err(e) = delivery.settle(decision).await {
            warn!(
                queue = %self.binding.queue_name,
                decision = decision.as_str(),
                error = %e,
                "Failed to settle delivery"
            );
        }
    }

    /// Deliveries the broker pushed before the cancel took effect go back to
    /// the queue instead of being dropped unsettled.
    async fn requeue_buffered(&self, stream: &mut DeliveryStream) {
        let mut requeued = 0u32;
        while let Some(Some(Ok(delivery))) = stream.next().now_or_never() {
            if let Err(e) = delivery.settle(AckDecision::Requeue).await {
                warn!(queue = %self.binding.queue_name, error = %e, "Failed to requeue buffered delivery");
            }
            requeued += 1;
        }
        if requeued > 0 {
            debug!(queue = %self.binding.queue_name, requeued, "Returned buffered deliveries");
        }
    }

    /// Reopen the stream after a connection loss, one connection-manager pass
    /// at a time with the retry delay in between. `None` on shutdown or on a
    /// topology mismatch, which no amount of retrying fixes.
    async fn resume(&self, shutdown_rx: &mut broadcast::Receiver<()>) -> Option<DeliveryStream> {
        *self.state.write() = SubscriptionState::Subscribed;
        let delay = self.connection.config().retry_delay;
        let mut pass: u32 = 1;

        loop {
            let attempt = tokio::select! {
                _ = shutdown_rx.recv() => return None,
                attempt = open_stream(&self.connection, &self.binding, &self.consumer_tag) => attempt,
            };

            match attempt {
                Ok(stream) => {
                    info!(queue = %self.binding.queue_name, pass, "Receive loop resumed");
                    *self.state.write() = SubscriptionState::Receiving;
                    return Some(stream);
                }
                Err(e) if e.is_declaration() => {
                    error!(queue = %self.binding.queue_name, error = %e, "Cannot resume subscription");
                    return None;
                }
                Err(e) => {
                    warn!(queue = %self.binding.queue_name, pass, error = %e, "Resume failed, will retry");
                }
            }

            tokio::select! {
                _ = shutdown_rx.recv() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            pass += 1;
        }
    }
}
