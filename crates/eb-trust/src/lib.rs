//! EmotiBot service trust layer
//!
//! - `ServiceIdentity` mints and verifies short-lived HS256 service tokens
//! - `ServiceGateway` makes authenticated calls to peer services
//! - `HealthAggregator` probes every peer's `/health` concurrently

pub mod error;
pub mod gateway;
pub mod health;
pub mod identity;

pub use error::{AuthError, GatewayError, GatewayErrorKind};
pub use gateway::{CallClass, GatewayResponse, ServiceGateway, SERVICE_NAME_HEADER};
pub use health::{HealthAggregator, HealthMonitor, HealthReport, HealthReportCache, PeerHealth};
pub use identity::{ServiceClaims, ServiceIdentity, ServiceToken};
