//! Connection Manager - owns the single broker connection of a process
//!
//! Handles:
//! - Lazy connect on first use
//! - Health check fast path (no I/O while connected)
//! - Bounded retry with a fixed delay between attempts
//! - Topology declaration on every fresh connection

use std::sync::Arc;

use eb_common::ConnectionState;
use eb_config::BrokerConfig;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::topology::ExchangeTopology;
use crate::transport::{Broker, BrokerConnection};
use crate::BusError;

pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    config: BrokerConfig,
    topology: ExchangeTopology,
    state: RwLock<ConnectionState>,
    /// Held across the whole (re)connect so concurrent callers wait for one attempt
    current: Mutex<Option<Arc<dyn BrokerConnection>>>,
}

impl ConnectionManager {
    pub fn new(broker: Arc<dyn Broker>, config: BrokerConfig) -> Self {
        Self::with_topology(broker, config, ExchangeTopology::default())
    }

    pub fn with_topology(broker: Arc<dyn Broker>, config: BrokerConfig, topology: ExchangeTopology) -> Self {
        Self {
            broker,
            config,
            topology,
            state: RwLock::new(ConnectionState::Disconnected),
            current: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    /// Return a healthy connection, reconnecting if needed.
    ///
    /// Makes up to `max_retries` attempts, sleeping `retry_delay` between them.
    /// A declaration mismatch fails immediately.
    pub async fn ensure_connected(&self) -> Result<Arc<dyn BrokerConnection>, BusError> {
        let mut current = self.current.lock().await;

        if self.state() == ConnectionState::Connected {
            if let Some(conn) = current.as_ref() {
                if conn.is_healthy() {
                    return Ok(Arc::clone(conn));
                }
            }
            warn!(broker = self.broker.name(), "Broker connection lost, reconnecting");
        }

        // Never repair a broken connection, replace it
        if let Some(stale) = current.take() {
            stale.close().await;
        }

        self.set_state(ConnectionState::Connecting);
        let max_attempts = self.config.max_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let result = self.connect_once().await;
            let outcome = if result.is_ok() { "ok" } else { "failed" };
            metrics::counter!("eb_connection_attempts_total", "outcome" => outcome).increment(1);

            match result {
                Ok(conn) => {
                    info!(
                        broker = self.broker.name(),
                        uri = %self.config.display_uri(),
                        attempt,
                        "Connected to message broker"
                    );
                    *current = Some(Arc::clone(&conn));
                    self.set_state(ConnectionState::Connected);
                    return Ok(conn);
                }
                Err(e) if e.is_declaration() => {
                    error!(error = %e, "Exchange topology mismatch");
                    self.set_state(ConnectionState::Failed);
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max_attempts,
                        error = %e,
                        "Broker connection attempt failed"
                    );
                    last_error = Some(e);
                    if attempt < max_attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        self.set_state(ConnectionState::Failed);
        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        error!(
            attempts = max_attempts,
            uri = %self.config.display_uri(),
            "Giving up on broker connection"
        );
        Err(BusError::connection(format!(
            "broker unreachable after {} attempts: {}",
            max_attempts, reason
        )))
    }

    async fn connect_once(&self) -> Result<Arc<dyn BrokerConnection>, BusError> {
        let conn = self.broker.connect(&self.config).await?;
        if let Err(e) = self.topology.declare(conn.as_ref()).await {
            conn.close().await;
            return Err(e);
        }
        Ok(conn)
    }

    /// The live connection, if any. Never reconnects.
    pub async fn current(&self) -> Option<Arc<dyn BrokerConnection>> {
        let current = self.current.lock().await;
        current.as_ref().filter(|conn| conn.is_healthy()).cloned()
    }

    /// Close the connection. Safe to call when never connected.
    pub async fn close(&self) {
        let mut current = self.current.lock().await;
        if let Some(conn) = current.take() {
            conn.close().await;
            info!(broker = self.broker.name(), "Broker connection closed");
        }
        self.set_state(ConnectionState::Disconnected);
    }
}
