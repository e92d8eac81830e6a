use std::sync::Arc;

use eb_common::{routing_keys, timestamp, Clock, Envelope, ExchangeName, SystemClock};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::connection::ConnectionManager;

/// Best-effort publisher. Every failure is logged and reported as `false`;
/// nothing is buffered for later.
pub struct Publisher {
    connection: Arc<ConnectionManager>,
    service_name: String,
    clock: Arc<dyn Clock>,
    /// The channel is not safe for concurrent emits
    emit_lock: Mutex<()>,
}

impl Publisher {
    pub fn new(connection: Arc<ConnectionManager>, service_name: impl Into<String>) -> Self {
        Self::with_clock(connection, service_name, Arc::new(SystemClock))
    }

    pub fn with_clock(
        connection: Arc<ConnectionManager>,
        service_name: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            connection,
            service_name: service_name.into(),
            clock,
            emit_lock: Mutex::new(()),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Wrap `payload` in an envelope and emit it as a persistent message.
    ///
    /// Returns `true` only if the broker accepted the emit.
    pub async fn publish<T>(&self, routing_key: &str, payload: &T, exchange: ExchangeName) -> bool
    where
        T: Serialize + ?Sized,
    {
        let published = self.try_publish(routing_key, payload, exchange).await;
        let outcome = if published { "ok" } else { "failed" };
        metrics::counter!("eb_publish_total", "exchange" => exchange.as_str(), "outcome" => outcome)
            .increment(1);
        published
    }

    async fn try_publish<T>(&self, routing_key: &str, payload: &T, exchange: ExchangeName) -> bool
    where
        T: Serialize + ?Sized,
    {
        if exchange.kind().requires_routing_key() && routing_key.is_empty() {
            warn!(exchange = %exchange, "Refusing to publish without a routing key");
            return false;
        }

        let data = match serde_json::to_value(payload) {
            Ok(data) => data,
            Err(e) => {
                error!(routing_key, error = %e, "Failed to serialize payload");
                return false;
            }
        };

        let conn = match self.connection.ensure_connected().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(exchange = %exchange, routing_key, error = %e, "Publish failed, broker unavailable");
                return false;
            }
        };

        let envelope = Envelope::new(data, self.service_name.as_str(), routing_key, self.clock.now());
        let body = match envelope.to_bytes() {
            Ok(body) => body,
            Err(e) => {
                error!(routing_key, error = %e, "Failed to encode envelope");
                return false;
            }
        };

        let _guard = self.emit_lock.lock().await;
        match conn.publish(exchange.as_str(), routing_key, &body, true).await {
            Ok(()) => {
                debug!(exchange = %exchange, routing_key, bytes = body.len(), "Published message");
                true
            }
            Err(e) => {
                error!(exchange = %exchange, routing_key, error = %e, "Publish failed");
                false
            }
        }
    }

    /// Domain event on the topic exchange
    pub async fn publish_event<T>(&self, routing_key: &str, payload: &T) -> bool
    where
        T: Serialize + ?Sized,
    {
        self.publish(routing_key, payload, ExchangeName::Events).await
    }

    /// Broadcast to every notification subscriber
    pub async fn publish_notification<T>(&self, payload: &T) -> bool
    where
        T: Serialize + ?Sized,
    {
        self.publish("", payload, ExchangeName::Notifications).await
    }

    /// Analytics record, wrapped as `{event_type, data, timestamp}`
    pub async fn publish_analytics<T>(&self, event_type: &str, data: &T) -> bool
    where
        T: Serialize + ?Sized,
    {
        let data = match serde_json::to_value(data) {
            Ok(data) => data,
            Err(e) => {
                error!(event_type, error = %e, "Failed to serialize analytics data");
                return false;
            }
        };

        let record = AnalyticsRecord {
            event_type,
            data,
            timestamp: self.clock.now(),
        };
        self.publish(routing_keys::ANALYTICS_EVENT, &record, ExchangeName::Analytics)
            .await
    }
}

#[derive(Serialize)]
struct AnalyticsRecord<'a> {
    event_type: &'a str,
    data: serde_json::Value,
    #[serde(with = "timestamp")]
    timestamp: chrono::DateTime<chrono::Utc>,
}
