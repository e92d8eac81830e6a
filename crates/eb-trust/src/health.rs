//! Peer health aggregation
//!
//! Probes every peer's `/health` concurrently and waits for all of them, so a
//! slow peer only costs its own timeout. `HealthMonitor` repeats this on a
//! fixed interval and keeps the latest report.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use eb_common::timestamp;
use futures::future::join_all;
use parking_lot::RwLock;
use reqwest::StatusCode;
use serde::{Serialize, Serializer};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::gateway::ServiceGateway;

fn as_millis<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerHealth {
    pub reachable: bool,
    #[serde(rename = "latency_ms", serialize_with = "as_millis")]
    pub latency: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub peers: BTreeMap<String, PeerHealth>,
    #[serde(with = "timestamp")]
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Peer name to healthy flag
    pub fn statuses(&self) -> BTreeMap<String, bool> {
        self.peers
            .iter()
            .map(|(name, health)| (name.clone(), health.reachable))
            .collect()
    }

    pub fn all_healthy(&self) -> bool {
        self.peers.values().all(|p| p.reachable)
    }
}

pub struct HealthAggregator {
    gateway: Arc<ServiceGateway>,
    timeout: Duration,
}

impl HealthAggregator {
    pub fn new(gateway: Arc<ServiceGateway>, timeout: Duration) -> Self {
        Self { gateway, timeout }
    }

    /// `true` for every peer that answered 200 within the timeout
    pub async fn check_all(&self, peers: &BTreeMap<String, String>) -> BTreeMap<String, bool> {
        self.report(peers).await.statuses()
    }

    pub async fn report(&self, peers: &BTreeMap<String, String>) -> HealthReport {
        let probes = peers.iter().map(|(name, url)| self.probe_peer(name, url));
        let peers: BTreeMap<String, PeerHealth> = join_all(probes).await.into_iter().collect();

        let healthy = peers.values().filter(|p| p.reachable).count();
        debug!(healthy, total = peers.len(), "Peer health checked");

        HealthReport {
            peers,
            checked_at: Utc::now(),
        }
    }

    async fn probe_peer(&self, name: &str, base_url: &str) -> (String, PeerHealth) {
        let url = format!("{}/health", base_url.trim_end_matches('/'));
        let started = Instant::now();

        let health = match tokio::time::timeout(self.timeout, self.gateway.probe(&url)).await {
            Ok(Ok(response)) => PeerHealth {
                reachable: response.status() == StatusCode::OK,
                latency: started.elapsed(),
                status: Some(response.status().as_u16()),
                error: None,
            },
            Ok(Err(e)) => PeerHealth {
                reachable: false,
                latency: started.elapsed(),
                status: None,
                error: Some(e.kind.to_string()),
            },
            Err(_) => PeerHealth {
                reachable: false,
                latency: started.elapsed(),
                status: None,
                error: Some("timeout".to_string()),
            },
        };

        let outcome = if health.reachable { "healthy" } else { "unhealthy" };
        metrics::counter!("eb_health_probe_total", "peer" => name.to_string(), "outcome" => outcome).increment(1);
        if !health.reachable {
            warn!(peer = name, url = %url, status = ?health.status, error = ?health.error, "Peer unhealthy");
        }

        (name.to_string(), health)
    }
}

// ============================================================================
// Periodic monitor
// ============================================================================

/// Shared view of the most recent report
#[derive(Clone, Default)]
pub struct HealthReportCache {
    inner: Arc<RwLock<Option<HealthReport>>>,
}

impl HealthReportCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<HealthReport> {
        self.inner.read().clone()
    }

    pub fn store(&self, report: HealthReport) {
        *self.inner.write() = Some(report);
    }
}

/// Re-probes peers on an interval and caches the latest report
pub struct HealthMonitor {
    cache: HealthReportCache,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl HealthMonitor {
    pub fn start(aggregator: Arc<HealthAggregator>, peers: BTreeMap<String, String>, interval: Duration) -> Self {
        let cache = HealthReportCache::new();
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let sink = cache.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        sink.store(aggregator.report(&peers).await);
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Health monitor shutting down");
                        break;
                    }
                }
            }
        });

        Self {
            cache,
            shutdown_tx,
            handle,
        }
    }

    pub fn cache(&self) -> HealthReportCache {
        self.cache.clone()
    }

    pub fn latest(&self) -> Option<HealthReport> {
        self.cache.get()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}
