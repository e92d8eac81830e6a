//! Broker transport abstraction
//!
//! The connection manager, publisher and consumer only talk to these traits.
//! `amqp` provides the RabbitMQ implementation, `memory` an in-process broker
//! used by tests and by single-node development runs.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use eb_common::{AckDecision, ExchangeSpec, QueueBinding};
use eb_config::BrokerConfig;
use futures::stream::BoxStream;

use crate::BusError;

/// Settles a single delivery with the broker
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), BusError>;
    async fn nack(&self, requeue: bool) -> Result<(), BusError>;
}

/// A raw delivery as received from the broker
pub struct InboundDelivery {
    pub body: Vec<u8>,
    pub routing_key: String,
    pub redelivered: bool,
    acker: Box<dyn Acker>,
}

impl InboundDelivery {
    pub fn new(body: Vec<u8>, routing_key: impl Into<String>, redelivered: bool, acker: Box<dyn Acker>) -> Self {
        Self {
            body,
            routing_key: routing_key.into(),
            redelivered,
            acker,
        }
    }

    /// Apply the handler outcome. Consumes the delivery so it cannot be settled twice.
    pub async fn settle(self, decision: AckDecision) -> Result<(), BusError> {
        match decision {
            AckDecision::Ack => self.acker.ack().await,
            AckDecision::Requeue => self.acker.nack(true).await,
            AckDecision::Reject => self.acker.nack(false).await,
        }
    }
}

impl fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundDelivery")
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}

pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, BusError>>;

/// An open broker connection with a single channel.
///
/// Implementations need not be safe for concurrent emits; the publisher
/// serializes its calls.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Cheap liveness check, no I/O
    fn is_healthy(&self) -> bool;

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BusError>;

    /// Declare the queue and bind it to its exchange
    async fn declare_queue(&self, binding: &QueueBinding) -> Result<(), BusError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        persistent: bool,
    ) -> Result<(), BusError>;

    /// Start consuming one message at a time from `queue`
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BusError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BusError>;

    async fn unbind(&self, binding: &QueueBinding) -> Result<(), BusError>;

    async fn close(&self);
}

/// Opens broker connections
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self, config: &BrokerConfig) -> Result<Arc<dyn BrokerConnection>, BusError>;

    fn name(&self) -> &'static str;
}
