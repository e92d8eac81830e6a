use std::fmt;

use thiserror::Error;

/// Token verification failures. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid token signature")]
    InvalidSignature,

    #[error("Token expired")]
    ExpiredToken,

    #[error("Token issued to '{actual}', expected '{expected}'")]
    ServiceMismatch { expected: String, actual: String },

    #[error("Failed to sign token: {0}")]
    Signing(String),
}

impl AuthError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidSignature => "INVALID_SIGNATURE",
            AuthError::ExpiredToken => "EXPIRED_TOKEN",
            AuthError::ServiceMismatch { .. } => "SERVICE_MISMATCH",
            AuthError::Signing(_) => "SIGNING_FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorKind {
    Timeout,
    ConnectionRefused,
    Unreachable,
    /// Malformed request or a failure after the peer was reached
    Request,
    /// Could not mint our own token
    Identity,
}

impl GatewayErrorKind {
    /// Transport failures that get one more attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayErrorKind::Timeout | GatewayErrorKind::ConnectionRefused | GatewayErrorKind::Unreachable
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayErrorKind::Timeout => "timeout",
            GatewayErrorKind::ConnectionRefused => "connection_refused",
            GatewayErrorKind::Unreachable => "unreachable",
            GatewayErrorKind::Request => "request",
            GatewayErrorKind::Identity => "identity",
        }
    }
}

impl fmt::Display for GatewayErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final failure of an inter-service call. The peer may or may not have been reached.
#[derive(Error, Debug, Clone)]
#[error("{kind} calling {url} after {attempts} attempt(s): {message}")]
pub struct GatewayError {
    pub kind: GatewayErrorKind,
    pub url: String,
    pub attempts: u32,
    pub message: String,
}

impl GatewayError {
    pub fn new(kind: GatewayErrorKind, url: impl Into<String>, attempts: u32, message: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            attempts,
            message: message.into(),
        }
    }
}
