use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub mod timestamp;

// ============================================================================
// Envelope
// ============================================================================

/// Wire wrapper around a published payload.
///
/// The payload type belongs to the caller; the envelope only adds provenance.
/// Fields are private so an envelope cannot be mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    data: serde_json::Value,
    metadata: EnvelopeMetadata,
}

/// Provenance attached to every envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    #[serde(rename = "service")]
    origin_service: String,
    #[serde(rename = "timestamp", with = "timestamp")]
    issued_at: DateTime<Utc>,
    routing_key: String,
}

impl Envelope {
    pub fn new(
        data: serde_json::Value,
        origin_service: impl Into<String>,
        routing_key: impl Into<String>,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            data,
            metadata: EnvelopeMetadata {
                origin_service: origin_service.into(),
                issued_at,
                routing_key: routing_key.into(),
            },
        }
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.data
    }

    pub fn into_payload(self) -> serde_json::Value {
        self.data
    }

    /// Decode the payload into the caller's own type
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }

    pub fn metadata(&self) -> &EnvelopeMetadata {
        &self.metadata
    }

    pub fn routing_key(&self) -> &str {
        &self.metadata.routing_key
    }

    /// Canonical UTF-8 JSON encoding used on the wire
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl EnvelopeMetadata {
    pub fn origin_service(&self) -> &str {
        &self.origin_service
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }
}

// ============================================================================
// Exchange Topology Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Topic,
    Fanout,
    Direct,
}

impl ExchangeKind {
    /// Fanout exchanges ignore the routing key; the others route on it.
    pub fn requires_routing_key(&self) -> bool {
        !matches!(self, ExchangeKind::Fanout)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Direct => "direct",
        }
    }
}

/// The fixed set of logical channels used across the platform
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeName {
    /// Domain events, `<noun>.<verb>` routing keys
    #[default]
    Events,
    /// Broadcast notifications
    Notifications,
    /// Analytics events, exact routing-key match
    Analytics,
}

impl ExchangeName {
    pub const ALL: [ExchangeName; 3] = [
        ExchangeName::Events,
        ExchangeName::Notifications,
        ExchangeName::Analytics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeName::Events => "events",
            ExchangeName::Notifications => "notifications",
            ExchangeName::Analytics => "analytics",
        }
    }

    pub fn kind(&self) -> ExchangeKind {
        match self {
            ExchangeName::Events => ExchangeKind::Topic,
            ExchangeName::Notifications => ExchangeKind::Fanout,
            ExchangeName::Analytics => ExchangeKind::Direct,
        }
    }

    pub fn spec(&self) -> ExchangeSpec {
        ExchangeSpec::new(self.as_str(), self.kind(), true)
    }
}

impl fmt::Display for ExchangeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    pub fn new(name: impl Into<String>, kind: ExchangeKind, durable: bool) -> Self {
        Self {
            name: name.into(),
            kind,
            durable,
        }
    }
}

/// A durable queue bound to an exchange under a routing-key pattern.
/// Lives as long as the subscription that created it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueBinding {
    pub queue_name: String,
    pub exchange: String,
    pub routing_key: String,
    pub durable: bool,
}

impl QueueBinding {
    pub fn durable(
        queue_name: impl Into<String>,
        exchange: ExchangeName,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            exchange: exchange.as_str().to_string(),
            routing_key: routing_key.into(),
            durable: true,
        }
    }
}

// ============================================================================
// Connection & Delivery State
// ============================================================================

/// Broker connection state, owned by the connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// What the receive loop does with a delivery once the handler has finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// Processed - remove from the queue
    Ack,
    /// Transient failure - negative ack with requeue
    Requeue,
    /// Poison or fatal failure - negative ack without requeue
    Reject,
}

impl AckDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckDecision::Ack => "ack",
            AckDecision::Requeue => "requeue",
            AckDecision::Reject => "reject",
        }
    }
}

// ============================================================================
// Service Registry
// ============================================================================

#[derive(Debug, thiserror::Error)]
#[error("Unknown service: {0}")]
pub struct UnknownServiceError(pub String);

/// The services that make up a deployment.
///
/// Parsed once at startup; unknown names are rejected there rather than
/// looked up on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ServiceKind {
    #[serde(rename = "auth-service")]
    Auth,
    #[serde(rename = "emotion-service")]
    Emotion,
    #[serde(rename = "conversation-service")]
    Conversation,
    #[serde(rename = "ai-service")]
    Ai,
    #[serde(rename = "websocket-service")]
    Websocket,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 5] = [
        ServiceKind::Auth,
        ServiceKind::Emotion,
        ServiceKind::Conversation,
        ServiceKind::Ai,
        ServiceKind::Websocket,
    ];

    /// Canonical service name, used as token subject and `X-Service-Name`
    pub fn service_name(&self) -> &'static str {
        match self {
            ServiceKind::Auth => "auth-service",
            ServiceKind::Emotion => "emotion-service",
            ServiceKind::Conversation => "conversation-service",
            ServiceKind::Ai => "ai-service",
            ServiceKind::Websocket => "websocket-service",
        }
    }

    /// Short key used in peer maps and health reports
    pub fn short_name(&self) -> &'static str {
        match self {
            ServiceKind::Auth => "auth",
            ServiceKind::Emotion => "emotion",
            ServiceKind::Conversation => "conversation",
            ServiceKind::Ai => "ai",
            ServiceKind::Websocket => "websocket",
        }
    }

    pub fn url_env_var(&self) -> &'static str {
        match self {
            ServiceKind::Auth => "AUTH_SERVICE_URL",
            ServiceKind::Emotion => "EMOTION_SERVICE_URL",
            ServiceKind::Conversation => "CONVERSATION_SERVICE_URL",
            ServiceKind::Ai => "AI_SERVICE_URL",
            ServiceKind::Websocket => "WEBSOCKET_SERVICE_URL",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            ServiceKind::Auth => 8002,
            ServiceKind::Emotion => 8003,
            ServiceKind::Conversation => 8004,
            ServiceKind::Ai => 8005,
            ServiceKind::Websocket => 8006,
        }
    }

    pub fn default_url(&self) -> String {
        format!("http://{}:{}", self.service_name(), self.default_port())
    }

    /// Routing keys this service emits on the events exchange
    pub fn published_routing_keys(&self) -> &'static [&'static str] {
        use routing_keys::*;
        match self {
            ServiceKind::Auth => &[USER_REGISTERED, USER_LOGIN, USER_LOGOUT],
            ServiceKind::Emotion => &[EMOTION_ANALYZED, EMOTION_STATS_UPDATED],
            ServiceKind::Conversation => &[
                CONVERSATION_CREATED,
                CONVERSATION_UPDATED,
                CONVERSATION_DELETED,
                MESSAGE_SENT,
            ],
            ServiceKind::Ai => &[AI_RESPONSE_GENERATED, AI_MODEL_UPDATED],
            ServiceKind::Websocket => &[WEBSOCKET_CONNECTION],
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.service_name())
    }
}

impl FromStr for ServiceKind {
    type Err = UnknownServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        ServiceKind::ALL
            .into_iter()
            .find(|kind| kind.service_name() == needle || kind.short_name() == needle)
            .ok_or_else(|| UnknownServiceError(s.to_string()))
    }
}

/// Routing keys on the events exchange (`<noun>.<verb>`)
pub mod routing_keys {
    pub const USER_REGISTERED: &str = "user.registered";
    pub const USER_LOGIN: &str = "user.login";
    pub const USER_LOGOUT: &str = "user.logout";
    pub const EMOTION_ANALYZED: &str = "emotion.analyzed";
    pub const EMOTION_STATS_UPDATED: &str = "emotion.stats.updated";
    pub const CONVERSATION_CREATED: &str = "conversation.created";
    pub const CONVERSATION_UPDATED: &str = "conversation.updated";
    pub const CONVERSATION_DELETED: &str = "conversation.deleted";
    pub const MESSAGE_SENT: &str = "message.sent";
    pub const AI_RESPONSE_GENERATED: &str = "ai.response.generated";
    pub const AI_MODEL_UPDATED: &str = "ai.model.updated";
    pub const WEBSOCKET_CONNECTION: &str = "websocket.connection";
    /// Single routing key used on the analytics exchange
    pub const ANALYTICS_EVENT: &str = "analytics.event";
}

// ============================================================================
// Clock
// ============================================================================

/// Source of "now" for token expiry and envelope timestamps
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
