//! Service Gateway - authenticated HTTP calls to peer services
//!
//! Every call carries a freshly minted token (`Authorization: Bearer`) and the
//! caller's name (`X-Service-Name`). Transport failures get exactly one retry
//! after a fixed delay. Non-2xx responses are returned untouched.

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use eb_config::GatewayConfig;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::identity::ServiceIdentity;
use crate::{GatewayError, GatewayErrorKind};

pub const SERVICE_NAME_HEADER: &str = "X-Service-Name";

/// Timeout class of an outbound call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallClass {
    Default,
    /// Token and identity checks
    Verification,
    /// Response generation, the slow path
    Generation,
    /// Health probes, never retried
    Probe,
}

impl CallClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallClass::Default => "default",
            CallClass::Verification => "verification",
            CallClass::Generation => "generation",
            CallClass::Probe => "probe",
        }
    }
}

/// A completed HTTP exchange, whatever the status code
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    status: StatusCode,
    body: Bytes,
}

impl GatewayResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

struct Attempt {
    kind: GatewayErrorKind,
    message: String,
}

pub struct ServiceGateway {
    client: reqwest::Client,
    identity: Arc<ServiceIdentity>,
    service_name: String,
    config: GatewayConfig,
}

impl ServiceGateway {
    pub fn new(
        identity: Arc<ServiceIdentity>,
        service_name: impl Into<String>,
        config: GatewayConfig,
    ) -> Result<Self, reqwest::Error> {
        // Per-request timeouts come from the call class
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self {
            client,
            identity,
            service_name: service_name.into(),
            config,
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn timeout_for(&self, class: CallClass) -> Duration {
        match class {
            CallClass::Default => self.config.default_timeout,
            CallClass::Verification => self.config.verification_timeout,
            CallClass::Generation => self.config.generation_timeout,
            CallClass::Probe => self.config.probe_timeout,
        }
    }

    /// Call with the default timeout
    pub async fn call<B>(&self, method: Method, url: &str, body: Option<&B>) -> Result<GatewayResponse, GatewayError>
    where
        B: Serialize + ?Sized,
    {
        self.call_with(CallClass::Default, method, url, body).await
    }

    pub async fn get(&self, url: &str) -> Result<GatewayResponse, GatewayError> {
        self.call::<()>(Method::GET, url, None).await
    }

    pub async fn post<B>(&self, url: &str, body: &B) -> Result<GatewayResponse, GatewayError>
    where
        B: Serialize + ?Sized,
    {
        self.call(Method::POST, url, Some(body)).await
    }

    /// Call with an explicit timeout class. Timeouts, refused and unreachable
    /// connections are retried once; probes are not retried.
    pub async fn call_with<B>(
        &self,
        class: CallClass,
        method: Method,
        url: &str,
        body: Option<&B>,
    ) -> Result<GatewayResponse, GatewayError>
    where
        B: Serialize + ?Sized,
    {
        let max_attempts: u32 = if class == CallClass::Probe { 1 } else { 2 };
        let mut attempt = 1;

        loop {
            match self.send_once(class, method.clone(), url, body).await {
                Ok(response) => {
                    metrics::counter!("eb_gateway_requests_total", "class" => class.as_str(), "outcome" => "ok")
                        .increment(1);
                    debug!(
                        method = %method,
                        url,
                        status = response.status().as_u16(),
                        attempt,
                        "Peer call completed"
                    );
                    return Ok(response);
                }
                Err(failure) if failure.kind.is_retryable() && attempt < max_attempts => {
                    warn!(
                        method = %method,
                        url,
                        kind = %failure.kind,
                        error = %failure.message,
                        "Peer call failed, retrying once"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                    attempt += 1;
                }
                Err(failure) => {
                    metrics::counter!(
                        "eb_gateway_requests_total",
                        "class" => class.as_str(),
                        "outcome" => failure.kind.as_str()
                    )
                    .increment(1);
                    warn!(
                        method = %method,
                        url,
                        kind = %failure.kind,
                        attempts = attempt,
                        error = %failure.message,
                        "Peer call failed"
                    );
                    return Err(GatewayError::new(failure.kind, url, attempt, failure.message));
                }
            }
        }
    }

    /// Single `GET`, probe timeout, no retry
    pub async fn probe(&self, url: &str) -> Result<GatewayResponse, GatewayError> {
        self.call_with::<()>(CallClass::Probe, Method::GET, url, None).await
    }

    /// Ask a peer's `/verify` endpoint to check a token
    pub async fn verify_remote(
        &self,
        base_url: &str,
        token: &str,
        expected_service: Option<&str>,
    ) -> Result<GatewayResponse, GatewayError> {
        let url = format!("{}/verify", base_url.trim_end_matches('/'));
        let body = serde_json::json!({ "token": token, "service": expected_service });
        self.call_with(CallClass::Verification, Method::POST, &url, Some(&body))
            .await
    }

    async fn send_once<B>(
        &self,
        class: CallClass,
        method: Method,
        url: &str,
        body: Option<&B>,
    ) -> Result<GatewayResponse, Attempt>
    where
        B: Serialize + ?Sized,
    {
        let token = self.identity.mint(&self.service_name).map_err(|e| Attempt {
            kind: GatewayErrorKind::Identity,
            message: e.to_string(),
        })?;

        let mut request = self
            .client
            .request(method, url)
            .timeout(self.timeout_for(class))
            .bearer_auth(token.as_str())
            .header(SERVICE_NAME_HEADER, &self.service_name);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(transport_failure)?;
        let status = response.status();
        let body = response.bytes().await.map_err(transport_failure)?;

        Ok(GatewayResponse { status, body })
    }
}

fn transport_failure(err: reqwest::Error) -> Attempt {
    Attempt {
        kind: classify(&err),
        message: err.to_string(),
    }
}

fn classify(err: &reqwest::Error) -> GatewayErrorKind {
    if err.is_timeout() {
        GatewayErrorKind::Timeout
    } else if err.is_connect() {
        if is_connection_refused(err) {
            GatewayErrorKind::ConnectionRefused
        } else {
            GatewayErrorKind::Unreachable
        }
    } else {
        GatewayErrorKind::Request
    }
}

fn is_connection_refused(err: &reqwest::Error) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        source = cause.source();
    }
    false
}
