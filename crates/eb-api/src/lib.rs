//! HTTP surface shared by every service
//!
//! - `GET /health` - liveness plus broker connection state
//! - `GET /health/peers` - latest peer health report
//! - `POST /verify` - check a service token for peers without their own verifier
//! - `GET /whoami` - echo the verified caller, guarded by `ServiceCaller`

pub mod auth;

pub use auth::{auth_rejection, extract_bearer_token, ServiceCaller};

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use eb_bus::ConnectionManager;
use eb_common::{timestamp, ServiceKind};
use eb_trust::{HealthReport, HealthReportCache, ServiceClaims, ServiceIdentity, SERVICE_NAME_HEADER};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub service: ServiceKind,
    pub identity: Arc<ServiceIdentity>,
    /// Absent for nodes that run without a broker
    pub connection: Option<Arc<ConnectionManager>>,
    pub peer_health: HealthReportCache,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub service: String,
    pub status: String,
    pub queue_connection: bool,
    pub broker_state: String,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub token: String,
    #[serde(default)]
    pub service: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claims: Option<ServiceClaims>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CallerInfo {
    pub service: String,
    #[serde(with = "timestamp")]
    pub issued_at: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub expires_at: DateTime<Utc>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/peers", get(peer_health_handler))
        .route("/verify", post(verify_handler))
        .route("/whoami", get(whoami_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let broker_state = state.connection.as_ref().map(|c| c.state());

    Json(HealthResponse {
        service: state.service.service_name().to_string(),
        status: "healthy".to_string(),
        queue_connection: state.connection.as_ref().is_some_and(|c| c.is_connected()),
        broker_state: broker_state
            .map(|s| s.to_string())
            .unwrap_or_else(|| "NONE".to_string()),
        timestamp: Utc::now(),
    })
}

async fn peer_health_handler(State(state): State<AppState>) -> Response {
    match state.peer_health.get() {
        Some(report) => Json::<HealthReport>(report).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError {
                error: "NO_REPORT".to_string(),
                message: "Peer health has not been checked yet".to_string(),
            }),
        )
            .into_response(),
    }
}

/// Expected service comes from the body, then `X-Service-Name`; with neither,
/// only signature and expiry are checked. A body without a token answers in
/// the same shape as a bad token.
async fn verify_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<VerifyRequest>, JsonRejection>,
) -> (StatusCode, Json<VerifyResponse>) {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            debug!(error = %rejection, "Malformed verify request");
            return (
                StatusCode::UNAUTHORIZED,
                Json(VerifyResponse {
                    valid: false,
                    claims: None,
                    error: Some(rejection_code(&rejection).to_string()),
                }),
            );
        }
    };

    let expected = request.service.or_else(|| {
        headers
            .get(SERVICE_NAME_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    });

    let result = match expected.as_deref() {
        Some(service) => state.identity.verify(&request.token, service),
        None => state.identity.inspect(&request.token),
    };

    match result {
        Ok(claims) => (
            StatusCode::OK,
            Json(VerifyResponse {
                valid: true,
                claims: Some(claims),
                error: None,
            }),
        ),
        Err(e) => {
            debug!(error = %e, "Token verification failed");
            (
                StatusCode::UNAUTHORIZED,
                Json(VerifyResponse {
                    valid: false,
                    claims: None,
                    error: Some(e.code().to_string()),
                }),
            )
        }
    }
}

fn rejection_code(rejection: &JsonRejection) -> &'static str {
    match rejection {
        // Well-formed JSON that lacks a string `token`
        JsonRejection::JsonDataError(_) => "MISSING_TOKEN",
        _ => "INVALID_REQUEST",
    }
}

async fn whoami_handler(caller: ServiceCaller) -> Json<CallerInfo> {
    Json(CallerInfo {
        service: caller.service().to_string(),
        issued_at: caller.claims.issued_at(),
        expires_at: caller.claims.expires_at(),
    })
}
