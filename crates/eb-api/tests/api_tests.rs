//! API Endpoint Tests
//!
//! Tests for:
//! - Health endpoints (service, peers)
//! - Token verification endpoint
//! - Service caller authentication

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use eb_api::{create_router, AppState};
use eb_bus::{ConnectionManager, MemoryBroker};
use eb_common::ServiceKind;
use eb_config::{BrokerConfig, IdentityConfig};
use eb_trust::{HealthReport, HealthReportCache, PeerHealth, ServiceIdentity};

const SECRET: &str = "api-test-secret";

fn state(connection: Option<Arc<ConnectionManager>>) -> AppState {
    AppState {
        service: ServiceKind::Auth,
        identity: Arc::new(ServiceIdentity::new(&IdentityConfig::new(SECRET))),
        connection,
        peer_health: HealthReportCache::new(),
    }
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn test_health_without_broker() {
    let app = create_router(state(None));
    let (status, body) = send(app, Request::get("/health").body(Body::empty()).unwrap()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "auth-service");
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["queue_connection"], false);
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_health_reports_broker_connection() {
    let connection = Arc::new(ConnectionManager::new(
        Arc::new(MemoryBroker::new()),
        BrokerConfig::default(),
    ));
    connection.ensure_connected().await.unwrap();

    let app = create_router(state(Some(connection)));
    let (status, body) = send(app, Request::get("/health").body(Body::empty()).unwrap()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queue_connection"], true);
    assert_eq!(body["broker_state"], "CONNECTED");
}

#[tokio::test]
async fn test_peer_health_before_first_check() {
    let app = create_router(state(None));
    let (status, body) = send(app, Request::get("/health/peers").body(Body::empty()).unwrap()).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "NO_REPORT");
}

#[tokio::test]
async fn test_peer_health_returns_cached_report() {
    let app_state = state(None);
    let mut peers = BTreeMap::new();
    peers.insert(
        "emotion".to_string(),
        PeerHealth {
            reachable: true,
            latency: Duration::from_millis(12),
            status: Some(200),
            error: None,
        },
    );
    app_state.peer_health.store(HealthReport {
        peers,
        checked_at: chrono::Utc::now(),
    });

    let app = create_router(app_state);
    let (status, body) = send(app, Request::get("/health/peers").body(Body::empty()).unwrap()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["peers"]["emotion"]["reachable"], true);
    assert_eq!(body["peers"]["emotion"]["latency_ms"], 12);
}

// ============================================================================
// Verify
// ============================================================================

#[tokio::test]
async fn test_verify_valid_token() {
    let app_state = state(None);
    let token = app_state.identity.mint("emotion-service").unwrap();
    let app = create_router(app_state);

    let (status, body) = send(
        app,
        post_json("/verify", json!({"token": token.as_str(), "service": "emotion-service"})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);
    assert_eq!(body["claims"]["service"], "emotion-service");
}

#[tokio::test]
async fn test_verify_without_expected_service_checks_signature_only() {
    let app_state = state(None);
    let token = app_state.identity.mint("ai-service").unwrap();
    let app = create_router(app_state);

    let (status, body) = send(app, post_json("/verify", json!({"token": token.as_str()}))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["claims"]["service"], "ai-service");
}

#[tokio::test]
async fn test_verify_mismatch_uses_header_fallback() {
    let app_state = state(None);
    let token = app_state.identity.mint("ai-service").unwrap();
    let app = create_router(app_state);

    let request = Request::builder()
        .method(Method::POST)
        .uri("/verify")
        .header("content-type", "application/json")
        .header("X-Service-Name", "websocket-service")
        .body(Body::from(json!({"token": token.as_str()}).to_string()))
        .unwrap();
    let (status, body) = send(app, request).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["valid"], false);
    assert_eq!(body["error"], "SERVICE_MISMATCH");
}

#[tokio::test]
async fn test_verify_rejects_foreign_signature() {
    let foreign = ServiceIdentity::new(&IdentityConfig::new("someone-else"));
    let token = foreign.mint("auth-service").unwrap();
    let app = create_router(state(None));

    let (status, body) = send(app, post_json("/verify", json!({"token": token.as_str()}))).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "INVALID_SIGNATURE");
}

#[tokio::test]
async fn test_verify_without_token_is_unauthorized() {
    let app = create_router(state(None));
    let (status, body) = send(app, post_json("/verify", json!({}))).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["valid"], false);
    assert_eq!(body["error"], "MISSING_TOKEN");
    assert!(body.get("claims").map_or(true, Value::is_null));
}

#[tokio::test]
async fn test_verify_unparseable_body_is_unauthorized() {
    let app = create_router(state(None));
    let request = Request::builder()
        .method(Method::POST)
        .uri("/verify")
        .header("content-type", "application/json")
        .body(Body::from("not json"))
        .unwrap();
    let (status, body) = send(app, request).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["valid"], false);
    assert_eq!(body["error"], "INVALID_REQUEST");
}

// ============================================================================
// Service caller
// ============================================================================

#[tokio::test]
async fn test_whoami_requires_credentials() {
    let app = create_router(state(None));
    let (status, body) = send(app, Request::get("/whoami").body(Body::empty()).unwrap()).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "MISSING_TOKEN");
}

#[tokio::test]
async fn test_whoami_requires_service_name() {
    let app_state = state(None);
    let token = app_state.identity.mint("conversation-service").unwrap();
    let app = create_router(app_state);

    let request = Request::get("/whoami")
        .header("Authorization", format!("Bearer {}", token.as_str()))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(app, request).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "MISSING_SERVICE_NAME");
}

#[tokio::test]
async fn test_whoami_accepts_matching_caller() {
    let app_state = state(None);
    let token = app_state.identity.mint("conversation-service").unwrap();
    let app = create_router(app_state);

    let request = Request::get("/whoami")
        .header("Authorization", format!("Bearer {}", token.as_str()))
        .header("X-Service-Name", "conversation-service")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(app, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "conversation-service");
}

#[tokio::test]
async fn test_whoami_rejects_impersonation() {
    let app_state = state(None);
    let token = app_state.identity.mint("conversation-service").unwrap();
    let app = create_router(app_state);

    let request = Request::get("/whoami")
        .header("Authorization", format!("Bearer {}", token.as_str()))
        .header("X-Service-Name", "auth-service")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(app, request).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "SERVICE_MISMATCH");
}
