use thiserror::Error;

/// Errors raised by the message bus
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Broker unreachable after the whole retry budget
    #[error("Connection error: {0}")]
    Connection(String),

    /// Exchange or queue declared with parameters that conflict with the existing one
    #[error("Declaration error: {0}")]
    Declaration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Consume error: {0}")]
    Consume(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl BusError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn declaration(msg: impl Into<String>) -> Self {
        Self::Declaration(msg.into())
    }

    pub fn publish(msg: impl Into<String>) -> Self {
        Self::Publish(msg.into())
    }

    pub fn consume(msg: impl Into<String>) -> Self {
        Self::Consume(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Retrying the same declaration can never succeed
    pub fn is_declaration(&self) -> bool {
        matches!(self, Self::Declaration(_))
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Failure reported by a message handler. The delivery is dropped.
#[derive(Error, Debug)]
#[error("Handler error: {message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}
