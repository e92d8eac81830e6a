//! RabbitMQ transport built on lapin

use std::sync::Arc;

use async_trait::async_trait;
use eb_common::{ExchangeKind, ExchangeSpec, QueueBinding};
use eb_config::BrokerConfig;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, info, warn};

use crate::transport::{Acker, Broker, BrokerConnection, DeliveryStream, InboundDelivery};
use crate::BusError;

const PERSISTENT: u8 = 2;
const TRANSIENT: u8 = 1;

/// Connects to RabbitMQ over AMQP 0-9-1
#[derive(Debug, Default, Clone)]
pub struct AmqpBroker;

impl AmqpBroker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self, config: &BrokerConfig) -> Result<Arc<dyn BrokerConnection>, BusError> {
        debug!(uri = %config.display_uri(), "Opening AMQP connection");

        let connection = Connection::connect(&config.amqp_uri(), ConnectionProperties::default())
            .await
            .map_err(|e| BusError::connection(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::connection(e.to_string()))?;

        // One unacknowledged delivery per consumer
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::connection(e.to_string()))?;

        info!(uri = %config.display_uri(), "AMQP connection established");
        Ok(Arc::new(AmqpConnection { connection, channel }))
    }

    fn name(&self) -> &'static str {
        "amqp"
    }
}

pub struct AmqpConnection {
    connection: Connection,
    channel: Channel,
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
    }
}

/// PRECONDITION_FAILED means the broker already has the object with other parameters
fn declaration_error(err: lapin::Error, what: &str) -> BusError {
    if let lapin::Error::ProtocolError(ref amqp) = err {
        if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)) {
            return BusError::declaration(format!("{}: {}", what, amqp));
        }
    }
    BusError::connection(format!("{}: {}", what, err))
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_healthy(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BusError> {
        self.channel
            .exchange_declare(
                &spec.name,
                exchange_kind(spec.kind),
                ExchangeDeclareOptions {
                    durable: spec.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| declaration_error(e, &format!("exchange '{}'", spec.name)))
    }

    async fn declare_queue(&self, binding: &QueueBinding) -> Result<(), BusError> {
        self.channel
            .queue_declare(
                &binding.queue_name,
                QueueDeclareOptions {
                    durable: binding.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| declaration_error(e, &format!("queue '{}'", binding.queue_name)))?;

        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| declaration_error(e, &format!("binding '{}'", binding.queue_name)))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        persistent: bool,
    ) -> Result<(), BusError> {
        let properties = BasicProperties::default()
            .with_delivery_mode(if persistent { PERSISTENT } else { TRANSIENT })
            .with_content_type("application/json".into());

        self.channel
            .basic_publish(exchange, routing_key, BasicPublishOptions::default(), body, properties)
            .await
            .map_err(|e| BusError::publish(e.to_string()))?
            .await
            .map_err(|e| BusError::publish(e.to_string()))?;

        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BusError> {
        let consumer = self
            .channel
            .basic_consume(queue, consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(|e| BusError::consume(e.to_string()))?;

        let stream = consumer.map(|result| {
            result
                .map(|delivery| {
                    InboundDelivery::new(
                        delivery.data,
                        delivery.routing_key.as_str(),
                        delivery.redelivered,
                        Box::new(AmqpAcker(delivery.acker)),
                    )
                })
                .map_err(|e| BusError::consume(e.to_string()))
        });

        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BusError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| BusError::consume(e.to_string()))
    }

    async fn unbind(&self, binding: &QueueBinding) -> Result<(), BusError> {
        self.channel
            .queue_unbind(
                &binding.queue_name,
                &binding.exchange,
                &binding.routing_key,
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::consume(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.channel.close(200, "OK").await {
            debug!(error = %e, "Channel already closed");
        }
        if let Err(e) = self.connection.close(200, "OK").await {
            warn!(error = %e, "Error closing AMQP connection");
        }
    }
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<(), BusError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BusError::consume(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<(), BusError> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::consume(e.to_string()))
    }
}
