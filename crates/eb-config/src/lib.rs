//! EmotiBot configuration
//!
//! Settings are layered, later layers winning:
//! 1. Built-in defaults
//! 2. An optional TOML file (`[service]`, `[broker]`, `[identity]`, `[gateway]`, `[peers]`)
//! 3. Environment variables (`RABBITMQ_*`, `SERVICE_*`, `GATEWAY_*`, `<PEER>_SERVICE_URL`)
//!
//! The signing secret and the service name have no default and must be supplied.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use eb_common::{ServiceKind, UnknownServiceError};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(String),

    #[error("Invalid value for {key}: {value}")]
    Invalid { key: String, value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    UnknownService(#[from] UnknownServiceError),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

// ============================================================================
// Broker
// ============================================================================

/// Message broker connection settings
#[derive(Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    /// Heartbeat interval negotiated with the broker
    pub heartbeat: Duration,
    /// Connection attempts before giving up
    pub max_retries: u32,
    /// Sleep between connection attempts
    pub retry_delay: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "rabbitmq".to_string(),
            port: 5672,
            username: "emotibot".to_string(),
            password: "emotibot_pass".to_string(),
            vhost: "/".to_string(),
            heartbeat: Duration::from_secs(60),
            max_retries: 5,
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl BrokerConfig {
    /// AMQP URI with credentials, vhost and heartbeat
    pub fn amqp_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}?heartbeat={}",
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password),
            self.host,
            self.port,
            urlencoding::encode(&self.vhost),
            self.heartbeat.as_secs(),
        )
    }

    /// Same as `amqp_uri` without the password, for logs
    pub fn display_uri(&self) -> String {
        format!(
            "amqp://{}@{}:{}/{}",
            urlencoding::encode(&self.username),
            self.host,
            self.port,
            urlencoding::encode(&self.vhost),
        )
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("vhost", &self.vhost)
            .field("heartbeat", &self.heartbeat)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .finish()
    }
}

// ============================================================================
// Identity
// ============================================================================

/// Service token settings. The secret is shared by every service in a deployment.
#[derive(Clone)]
pub struct IdentityConfig {
    pub secret: String,
    pub token_ttl: Duration,
}

impl IdentityConfig {
    pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            token_ttl: Self::DEFAULT_TOKEN_TTL,
        }
    }
}

impl fmt::Debug for IdentityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityConfig")
            .field("secret", &"<redacted>")
            .field("token_ttl", &self.token_ttl)
            .finish()
    }
}

// ============================================================================
// Gateway
// ============================================================================

/// Outbound inter-service HTTP settings
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Timeout for calls without a more specific class
    pub default_timeout: Duration,
    /// Token/identity verification calls
    pub verification_timeout: Duration,
    /// Response generation calls
    pub generation_timeout: Duration,
    /// Health probes
    pub probe_timeout: Duration,
    pub connect_timeout: Duration,
    /// Fixed delay before the single retry
    pub retry_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(10),
            verification_timeout: Duration::from_secs(5),
            generation_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_millis(500),
        }
    }
}

// ============================================================================
// Peers
// ============================================================================

/// Base URLs of every service in the deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDirectory {
    urls: BTreeMap<ServiceKind, String>,
}

impl Default for PeerDirectory {
    fn default() -> Self {
        let urls = ServiceKind::ALL
            .into_iter()
            .map(|kind| (kind, kind.default_url()))
            .collect();
        Self { urls }
    }
}

impl PeerDirectory {
    pub fn empty() -> Self {
        Self {
            urls: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, kind: ServiceKind, url: impl Into<String>) {
        let url: String = url.into();
        self.urls.insert(kind, url.trim_end_matches('/').to_string());
    }

    pub fn url(&self, kind: ServiceKind) -> Option<&str> {
        self.urls.get(&kind).map(String::as_str)
    }

    /// All peers keyed by short name (`auth`, `emotion`, ...)
    pub fn as_map(&self) -> BTreeMap<String, String> {
        self.urls
            .iter()
            .map(|(kind, url)| (kind.short_name().to_string(), url.clone()))
            .collect()
    }

    /// Every peer except `own`, keyed by short name
    pub fn peers_of(&self, own: ServiceKind) -> BTreeMap<String, String> {
        self.urls
            .iter()
            .filter(|(kind, _)| **kind != own)
            .map(|(kind, url)| (kind.short_name().to_string(), url.clone()))
            .collect()
    }
}

// ============================================================================
// Application Config
// ============================================================================

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub service: ServiceKind,
    pub broker: BrokerConfig,
    pub identity: IdentityConfig,
    pub gateway: GatewayConfig,
    pub peers: PeerDirectory,
}

impl AppConfig {
    /// Load from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (environment-style names)
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        RawConfig::from_lookup(&lookup)?.resolve()
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(content)?;
        raw.resolve()
    }

    /// Load a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "Loaded configuration file");
        Self::from_toml_str(&content)
    }

    /// Load a TOML file, then let environment variables override it
    pub fn load_with_env(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let file: RawConfig = toml::from_str(&content)?;
        let env = RawConfig::from_lookup(&|key: &str| std::env::var(key).ok())?;
        file.overlay(env).resolve()
    }
}

// ============================================================================
// Raw (unresolved) layer
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    service: RawService,
    broker: RawBroker,
    identity: RawIdentity,
    gateway: RawGateway,
    peers: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawService {
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawBroker {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    vhost: Option<String>,
    heartbeat_secs: Option<u64>,
    max_retries: Option<u32>,
    retry_delay_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawIdentity {
    secret: Option<String>,
    token_ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawGateway {
    timeout_secs: Option<u64>,
    verify_timeout_secs: Option<u64>,
    generate_timeout_secs: Option<u64>,
    probe_timeout_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    retry_delay_ms: Option<u64>,
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: raw,
            }),
        _ => Ok(None),
    }
}

fn string_var<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).filter(|v| !v.trim().is_empty())
}

impl RawConfig {
    fn from_lookup<F>(lookup: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut peers = BTreeMap::new();
        for kind in ServiceKind::ALL {
            if let Some(url) = string_var(lookup, kind.url_env_var()) {
                peers.insert(kind.short_name().to_string(), url);
            }
        }

        Ok(Self {
            service: RawService {
                name: string_var(lookup, "SERVICE_NAME"),
            },
            broker: RawBroker {
                host: string_var(lookup, "RABBITMQ_HOST"),
                port: parse_var(lookup, "RABBITMQ_PORT")?,
                username: string_var(lookup, "RABBITMQ_USER"),
                password: string_var(lookup, "RABBITMQ_PASS"),
                vhost: string_var(lookup, "RABBITMQ_VHOST"),
                heartbeat_secs: parse_var(lookup, "RABBITMQ_HEARTBEAT_SECS")?,
                max_retries: parse_var(lookup, "RABBITMQ_MAX_RETRIES")?,
                retry_delay_secs: parse_var(lookup, "RABBITMQ_RETRY_DELAY_SECS")?,
            },
            identity: RawIdentity {
                secret: string_var(lookup, "SERVICE_SECRET"),
                token_ttl_secs: parse_var(lookup, "SERVICE_TOKEN_TTL_SECS")?,
            },
            gateway: RawGateway {
                timeout_secs: parse_var(lookup, "GATEWAY_TIMEOUT_SECS")?,
                verify_timeout_secs: parse_var(lookup, "GATEWAY_VERIFY_TIMEOUT_SECS")?,
                generate_timeout_secs: parse_var(lookup, "GATEWAY_GENERATE_TIMEOUT_SECS")?,
                probe_timeout_secs: parse_var(lookup, "GATEWAY_PROBE_TIMEOUT_SECS")?,
                connect_timeout_secs: parse_var(lookup, "GATEWAY_CONNECT_TIMEOUT_SECS")?,
                retry_delay_ms: parse_var(lookup, "GATEWAY_RETRY_DELAY_MS")?,
            },
            peers,
        })
    }

    /// Fields set in `top` replace the ones in `self`
    fn overlay(self, top: RawConfig) -> RawConfig {
        let mut peers = self.peers;
        peers.extend(top.peers);

        RawConfig {
            service: RawService {
                name: top.service.name.or(self.service.name),
            },
            broker: RawBroker {
                host: top.broker.host.or(self.broker.host),
                port: top.broker.port.or(self.broker.port),
                username: top.broker.username.or(self.broker.username),
                password: top.broker.password.or(self.broker.password),
                vhost: top.broker.vhost.or(self.broker.vhost),
                heartbeat_secs: top.broker.heartbeat_secs.or(self.broker.heartbeat_secs),
                max_retries: top.broker.max_retries.or(self.broker.max_retries),
                retry_delay_secs: top.broker.retry_delay_secs.or(self.broker.retry_delay_secs),
            },
            identity: RawIdentity {
                secret: top.identity.secret.or(self.identity.secret),
                token_ttl_secs: top.identity.token_ttl_secs.or(self.identity.token_ttl_secs),
            },
            gateway: RawGateway {
                timeout_secs: top.gateway.timeout_secs.or(self.gateway.timeout_secs),
                verify_timeout_secs: top.gateway.verify_timeout_secs.or(self.gateway.verify_timeout_secs),
                generate_timeout_secs: top.gateway.generate_timeout_secs.or(self.gateway.generate_timeout_secs),
                probe_timeout_secs: top.gateway.probe_timeout_secs.or(self.gateway.probe_timeout_secs),
                connect_timeout_secs: top.gateway.connect_timeout_secs.or(self.gateway.connect_timeout_secs),
                retry_delay_ms: top.gateway.retry_delay_ms.or(self.gateway.retry_delay_ms),
            },
            peers,
        }
    }

    fn resolve(self) -> Result<AppConfig> {
        let service_name = self
            .service
            .name
            .ok_or_else(|| ConfigError::Missing("SERVICE_NAME".to_string()))?;
        let service: ServiceKind = service_name.parse()?;

        let defaults = BrokerConfig::default();
        let max_retries = self.broker.max_retries.unwrap_or(defaults.max_retries);
        if max_retries == 0 {
            return Err(ConfigError::Invalid {
                key: "RABBITMQ_MAX_RETRIES".to_string(),
                value: "0".to_string(),
            });
        }

        let broker = BrokerConfig {
            host: self.broker.host.unwrap_or(defaults.host),
            port: self.broker.port.unwrap_or(defaults.port),
            username: self.broker.username.unwrap_or(defaults.username),
            password: self.broker.password.unwrap_or(defaults.password),
            vhost: self.broker.vhost.unwrap_or(defaults.vhost),
            heartbeat: self
                .broker
                .heartbeat_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat),
            max_retries,
            retry_delay: self
                .broker
                .retry_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.retry_delay),
        };

        let secret = self
            .identity
            .secret
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::Missing("SERVICE_SECRET".to_string()))?;
        let identity = IdentityConfig {
            secret,
            token_ttl: self
                .identity
                .token_ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(IdentityConfig::DEFAULT_TOKEN_TTL),
        };

        let gw = GatewayConfig::default();
        let gateway = GatewayConfig {
            default_timeout: self.gateway.timeout_secs.map(Duration::from_secs).unwrap_or(gw.default_timeout),
            verification_timeout: self
                .gateway
                .verify_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(gw.verification_timeout),
            generation_timeout: self
                .gateway
                .generate_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(gw.generation_timeout),
            probe_timeout: self
                .gateway
                .probe_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(gw.probe_timeout),
            connect_timeout: self
                .gateway
                .connect_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(gw.connect_timeout),
            retry_delay: self.gateway.retry_delay_ms.map(Duration::from_millis).unwrap_or(gw.retry_delay),
        };

        let mut peers = PeerDirectory::default();
        for (name, url) in self.peers {
            let kind: ServiceKind = name.parse()?;
            peers.set(kind, url);
        }

        Ok(AppConfig {
            service,
            broker,
            identity,
            gateway,
            peers,
        })
    }
}
