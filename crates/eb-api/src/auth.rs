//! Service authentication for inbound requests
//!
//! `ServiceCaller` rejects any request that does not carry a valid
//! `Authorization: Bearer` token issued to the service named in `X-Service-Name`.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use eb_trust::{AuthError, ServiceClaims, SERVICE_NAME_HEADER};
use tracing::debug;

use crate::{ApiError, AppState};

/// Extract the token from a `Bearer <token>` header value
pub fn extract_bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn unauthorized(error: &str, message: impl Into<String>) -> Response {
    let body = ApiError {
        error: error.to_string(),
        message: message.into(),
    };
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}

pub fn auth_rejection(err: &AuthError) -> Response {
    unauthorized(err.code(), err.to_string())
}

/// A verified peer service
#[derive(Debug, Clone)]
pub struct ServiceCaller {
    pub claims: ServiceClaims,
}

impl ServiceCaller {
    pub fn service(&self) -> &str {
        &self.claims.service
    }
}

#[axum::async_trait]
impl FromRequestParts<AppState> for ServiceCaller {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| unauthorized("MISSING_TOKEN", "Missing Authorization header"))?;

        let token = extract_bearer_token(auth_header)
            .ok_or_else(|| unauthorized("MISSING_TOKEN", "Invalid Authorization header format"))?;

        let service = parts
            .headers
            .get(SERVICE_NAME_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| unauthorized("MISSING_SERVICE_NAME", "Missing X-Service-Name header"))?;

        let claims = state.identity.verify(token, service).map_err(|e| {
            debug!(service, error = %e, "Rejected service call");
            auth_rejection(&e)
        })?;

        Ok(ServiceCaller { claims })
    }
}
