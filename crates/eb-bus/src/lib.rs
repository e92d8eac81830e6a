//! EmotiBot message bus
//!
//! Asynchronous event publication and consumption over a shared broker:
//! - `ConnectionManager` owns the broker connection and its retry policy
//! - `ExchangeTopology` declares the fixed `events`/`notifications`/`analytics` exchanges
//! - `Publisher` wraps payloads in envelopes and emits them as persistent messages
//! - `Consumer` runs one receive loop per queue subscription
//!
//! Transports plug in through `transport::Broker`: `AmqpBroker` for RabbitMQ
//! (feature `amqp`), `MemoryBroker` for tests and single-node runs.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod publisher;
pub mod topology;
pub mod transport;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use connection::ConnectionManager;
pub use consumer::{Consumer, HandlerOutcome, MessageHandler, SubscriptionState};
pub use error::{BusError, HandlerError};
pub use memory::MemoryBroker;
pub use publisher::Publisher;
pub use topology::ExchangeTopology;
pub use transport::{Broker, BrokerConnection};

use std::sync::Arc;

use eb_config::BrokerConfig;

/// The bus handles one service needs, sharing a single connection
pub struct MessageBus {
    pub connection: Arc<ConnectionManager>,
    pub publisher: Arc<Publisher>,
    pub consumer: Arc<Consumer>,
}

impl MessageBus {
    pub fn new(broker: Arc<dyn Broker>, config: BrokerConfig, service_name: impl Into<String>) -> Self {
        let connection = Arc::new(ConnectionManager::new(broker, config));
        Self {
            publisher: Arc::new(Publisher::new(Arc::clone(&connection), service_name)),
            consumer: Arc::new(Consumer::new(Arc::clone(&connection))),
            connection,
        }
    }

    /// Stop all subscriptions, then close the connection
    pub async fn shutdown(&self) {
        self.consumer.shutdown().await;
        self.connection.close().await;
    }
}
