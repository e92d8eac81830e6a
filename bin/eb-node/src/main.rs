//! EmotiBot Service Node
//!
//! Runs the messaging and trust layer for one service:
//! - Broker connection, exchange topology and an event subscription
//! - Service identity (token minting and verification)
//! - Peer health monitor over every other service
//! - HTTP surface (`/health`, `/health/peers`, `/verify`, `/whoami`, `/metrics`)

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use clap::Parser;
use eb_api::{create_router, AppState};
use eb_bus::{Broker, Consumer, HandlerError, MemoryBroker, MessageBus, Publisher};
use eb_common::{Envelope, ExchangeName, ServiceKind};
use eb_config::AppConfig;
use eb_trust::{HealthAggregator, HealthMonitor, ServiceGateway, ServiceIdentity};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{net::TcpListener, signal, sync::broadcast};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "eb-node")]
#[command(about = "EmotiBot service node")]
struct Args {
    /// Service to run as (auth-service, emotion-service, ...)
    #[arg(long, env = "SERVICE_NAME")]
    service: Option<String>,

    /// HTTP port (defaults to the service's registered port)
    #[arg(long, env = "API_PORT")]
    port: Option<u16>,

    /// TOML configuration file; environment variables override its values
    #[arg(long, env = "EB_CONFIG")]
    config: Option<PathBuf>,

    /// Use the in-process broker instead of RabbitMQ
    #[arg(long, default_value_t = false)]
    memory_broker: bool,

    /// Seconds between peer health checks
    #[arg(long, default_value_t = 30)]
    probe_interval_secs: u64,

    /// Emit logs as JSON
    #[arg(long, default_value_t = false)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    if args.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    // 1. Load configuration
    let config = load_config(&args)?;
    let service = config.service;
    info!(
        service = service.service_name(),
        broker = %config.broker.display_uri(),
        "Starting EmotiBot node"
    );

    // 2. Metrics recorder
    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")?;

    // 3. Message bus
    let broker: Arc<dyn Broker> = if args.memory_broker {
        info!("Using in-process broker");
        Arc::new(MemoryBroker::new())
    } else {
        Arc::new(eb_bus::AmqpBroker::new())
    };
    let bus = MessageBus::new(broker, config.broker.clone(), service.service_name());

    // 4. Identity, gateway and peer health
    let identity = Arc::new(ServiceIdentity::new(&config.identity));
    let gateway = Arc::new(
        ServiceGateway::new(Arc::clone(&identity), service.service_name(), config.gateway.clone())
            .context("failed to build HTTP client")?,
    );
    let aggregator = Arc::new(HealthAggregator::new(gateway, config.gateway.probe_timeout));
    let monitor = HealthMonitor::start(
        aggregator,
        config.peers.peers_of(service),
        Duration::from_secs(args.probe_interval_secs.max(1)),
    );

    // 5. HTTP API server
    let state = AppState {
        service,
        identity,
        connection: Some(Arc::clone(&bus.connection)),
        peer_health: monitor.cache(),
    };
    let app = create_router(state)
        .merge(Router::new().route("/metrics", get(move || async move { metrics_handle.render() })))
        .layer(TraceLayer::new_for_http());

    let port = args.port.unwrap_or_else(|| service.default_port());
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(port, "Starting HTTP API server");

    // 6. Event subscription, retried in the background so a broker outage
    // never holds up the HTTP surface
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let messaging = tokio::spawn(run_messaging(
        service,
        Arc::clone(&bus.consumer),
        Arc::clone(&bus.publisher),
        shutdown_tx.subscribe(),
    ));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 7. Graceful shutdown
    info!("Shutdown signal received...");
    let _ = shutdown_tx.send(());
    if let Err(e) = messaging.await {
        warn!(error = %e, "Messaging task ended abnormally");
    }
    monitor.shutdown().await;
    bus.shutdown().await;

    info!("EmotiBot node shutdown complete");
    Ok(())
}

/// Config file (if any) plus environment, with `--service` taking precedence
fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => AppConfig::load_with_env(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => {
            let service = args.service.clone();
            AppConfig::from_lookup(|key| match key {
                "SERVICE_NAME" => service.clone(),
                _ => std::env::var(key).ok(),
            })?
        }
    };

    if let Some(name) = &args.service {
        config.service = ServiceKind::from_str(name)?;
    }
    debug!(?config, "Configuration resolved");
    Ok(config)
}

/// Subscribe to events from other services, then announce the start
async fn run_messaging(
    service: ServiceKind,
    consumer: Arc<Consumer>,
    publisher: Arc<Publisher>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let queue = format!("{}-events", service.short_name());
    let own_name = service.service_name();
    let handler = move |envelope: Envelope| futures::future::ready(log_event(own_name, envelope));

    if !consumer
        .subscribe_with_retry(&queue, ExchangeName::Events, "#", handler, &mut shutdown_rx)
        .await
    {
        debug!(queue = %queue, "Event subscription abandoned");
        return;
    }

    let started = serde_json::json!({ "service": own_name });
    tokio::select! {
        _ = shutdown_rx.recv() => {}
        _ = publisher.publish_analytics("service_started", &started) => {}
    }
}

fn log_event(own: &str, envelope: Envelope) -> Result<bool, HandlerError> {
    let metadata = envelope.metadata();
    if metadata.origin_service() == own {
        return Ok(true);
    }
    info!(
        routing_key = envelope.routing_key(),
        origin = metadata.origin_service(),
        issued_at = %metadata.issued_at(),
        "Event received"
    );
    Ok(true)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
