//! Service identity tokens
//!
//! HS256-signed claims `{service, iat, exp}` under a secret shared by every
//! service in the deployment. Tokens are stateless: validity depends only on
//! the signature and the clock.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use eb_common::{Clock, SystemClock};
use eb_config::IdentityConfig;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::AuthError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceClaims {
    pub service: String,
    /// Issued at, unix seconds
    pub iat: i64,
    /// Expiry, unix seconds
    pub exp: i64,
}

impl ServiceClaims {
    pub fn issued_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.iat, 0).single().unwrap_or_default()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0).single().unwrap_or_default()
    }

    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp_millis() > self.exp.saturating_mul(1000)
    }
}

/// A signed token together with the claims it carries
#[derive(Clone)]
pub struct ServiceToken {
    token: String,
    claims: ServiceClaims,
}

impl ServiceToken {
    pub fn as_str(&self) -> &str {
        &self.token
    }

    pub fn into_string(self) -> String {
        self.token
    }

    pub fn claims(&self) -> &ServiceClaims {
        &self.claims
    }

    pub fn service(&self) -> &str {
        &self.claims.service
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.claims.expires_at()
    }
}

impl fmt::Debug for ServiceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceToken")
            .field("token", &"<redacted>")
            .field("claims", &self.claims)
            .finish()
    }
}

pub struct ServiceIdentity {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl ServiceIdentity {
    pub fn new(config: &IdentityConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &IdentityConfig, clock: Arc<dyn Clock>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against our own clock after the signature
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.leeway = 0;

        let ttl = chrono::Duration::from_std(config.token_ttl).unwrap_or_else(|_| chrono::Duration::hours(1));

        Self {
            encoding: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            ttl,
            clock,
        }
    }

    /// Issue a token asserting "I am `service`"
    pub fn mint(&self, service: &str) -> Result<ServiceToken, AuthError> {
        let now = self.clock.now();
        let claims = ServiceClaims {
            service: service.to_string(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::Signing(e.to_string()))?;

        debug!(service, exp = claims.exp, "Minted service token");
        Ok(ServiceToken { token, claims })
    }

    /// Check signature, then expiry, then that the token names `expected_service`
    pub fn verify(&self, token: &str, expected_service: &str) -> Result<ServiceClaims, AuthError> {
        let claims = self.inspect(token)?;
        if claims.service != expected_service {
            return Err(AuthError::ServiceMismatch {
                expected: expected_service.to_string(),
                actual: claims.service,
            });
        }
        Ok(claims)
    }

    /// Signature and expiry only, for callers that learn the service from the token
    pub fn inspect(&self, token: &str) -> Result<ServiceClaims, AuthError> {
        let claims = decode::<ServiceClaims>(token, &self.decoding, &self.validation)
            .map_err(|_| AuthError::InvalidSignature)?
            .claims;

        if claims.is_expired_at(self.clock.now()) {
            return Err(AuthError::ExpiredToken);
        }
        Ok(claims)
    }
}

impl fmt::Debug for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceIdentity")
            .field("secret", &"<redacted>")
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eb_common::ManualClock;
    use std::time::Duration;

    fn identity_at(secret: &str, clock: Arc<ManualClock>) -> ServiceIdentity {
        ServiceIdentity::with_clock(&IdentityConfig::new(secret), clock)
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_mint_then_verify() {
        let clock = Arc::new(ManualClock::new(start()));
        let identity = identity_at("shared", clock);

        let token = identity.mint("auth-service").unwrap();
        assert_eq!(token.claims().exp - token.claims().iat, 3600);

        let claims = identity.verify(token.as_str(), "auth-service").unwrap();
        assert_eq!(claims.service, "auth-service");
        assert_eq!(claims.issued_at(), start());
    }

    #[test]
    fn test_expiry_flips_with_clock() {
        let clock = Arc::new(ManualClock::new(start()));
        let identity = identity_at("shared", Arc::clone(&clock));
        let token = identity.mint("ai-service").unwrap();

        clock.set(start() + chrono::Duration::seconds(3600));
        assert!(identity.verify(token.as_str(), "ai-service").is_ok());

        clock.advance(chrono::Duration::milliseconds(1));
        assert_eq!(
            identity.verify(token.as_str(), "ai-service").unwrap_err(),
            AuthError::ExpiredToken
        );

        clock.set(start());
        assert!(identity.verify(token.as_str(), "ai-service").is_ok());
    }

    #[test]
    fn test_service_mismatch() {
        let identity = identity_at("shared", Arc::new(ManualClock::new(start())));
        let token = identity.mint("emotion-service").unwrap();

        let err = identity.verify(token.as_str(), "conversation-service").unwrap_err();
        assert_eq!(
            err,
            AuthError::ServiceMismatch {
                expected: "conversation-service".to_string(),
                actual: "emotion-service".to_string(),
            }
        );
    }

    #[test]
    fn test_signature_checked_before_expiry() {
        let clock = Arc::new(ManualClock::new(start()));
        let minter = identity_at("one-secret", Arc::clone(&clock));
        let verifier = identity_at("other-secret", Arc::clone(&clock));
        let token = minter.mint("auth-service").unwrap();

        assert_eq!(
            verifier.verify(token.as_str(), "auth-service").unwrap_err(),
            AuthError::InvalidSignature
        );

        clock.advance(chrono::Duration::hours(2));
        assert_eq!(
            verifier.verify(token.as_str(), "auth-service").unwrap_err(),
            AuthError::InvalidSignature
        );
    }

    #[test]
    fn test_tampered_and_garbage_tokens() {
        let identity = identity_at("shared", Arc::new(ManualClock::new(start())));
        let token = identity.mint("auth-service").unwrap().into_string();

        let mut parts: Vec<&str> = token.split('.').collect();
        let forged_claims = identity_at("attacker", Arc::new(ManualClock::new(start())))
            .mint("websocket-service")
            .unwrap()
            .into_string();
        parts[1] = forged_claims.split('.').nth(1).unwrap();
        let tampered = parts.join(".");

        assert_eq!(identity.inspect(&tampered).unwrap_err(), AuthError::InvalidSignature);
        assert_eq!(identity.inspect("not-a-token").unwrap_err(), AuthError::InvalidSignature);
        assert_eq!(identity.inspect("").unwrap_err(), AuthError::InvalidSignature);
    }

    #[test]
    fn test_custom_ttl() {
        let config = IdentityConfig {
            secret: "shared".to_string(),
            token_ttl: Duration::from_secs(60),
        };
        let identity = ServiceIdentity::with_clock(&config, Arc::new(ManualClock::new(start())));
        let token = identity.mint("auth-service").unwrap();
        assert_eq!(token.expires_at(), start() + chrono::Duration::seconds(60));
    }

    #[test]
    fn test_debug_hides_token() {
        let identity = identity_at("shared", Arc::new(ManualClock::new(start())));
        let token = identity.mint("auth-service").unwrap();
        assert!(!format!("{:?}", token).contains(token.as_str()));
    }
}
