//! Error types for the subscriber.

use reqwest::StatusCode;
use thiserror::Error;

/// Main error type for subscriber operations.
#[derive(Debug, Error)]
pub enum SubscriberError {
    /// The hub answered a (un)subscribe request with an unexpected status.
    #[error("error {action} {topic} on {hub}:\n{body}")]
    Protocol {
        action: &'static str,
        topic: String,
        hub: String,
        body: String,
    },

    /// The hub could not be reached or did not answer in time.
    #[error("Transport error: {0}")]
    Transport(String),

    /// No record matches a verification request. Carries no detail on purpose.
    #[error("Subscription not found")]
    NotFound,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    /// A newer (un)subscribe for the same record replaced the token this
    /// request carried before the hub's answer could be recorded.
    #[error("request for {topic} on {hub} was superseded by a newer one")]
    Superseded { topic: String, hub: String },
}

impl SubscriberError {
    pub(crate) fn subscribing(topic: &str, hub: &str, body: String) -> Self {
        SubscriberError::Protocol {
            action: "subscribing to",
            topic: topic.to_string(),
            hub: hub.to_string(),
            body,
        }
    }

    pub(crate) fn unsubscribing(topic: &str, hub: &str, body: String) -> Self {
        SubscriberError::Protocol {
            action: "unsubscribing from",
            topic: topic.to_string(),
            hub: hub.to_string(),
            body,
        }
    }

    /// HTTP status used when this error ends an inbound callback.
    pub fn status_code(&self) -> StatusCode {
        match self {
            SubscriberError::NotFound => StatusCode::NOT_FOUND,
            SubscriberError::BadRequest(_) => StatusCode::BAD_REQUEST,
            SubscriberError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            SubscriberError::Protocol { .. } | SubscriberError::Transport(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<reqwest::Error> for SubscriberError {
    fn from(e: reqwest::Error) -> Self {
        SubscriberError::Transport(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SubscriberError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SubscriberError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SubscriberError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SubscriberError::Deserialization(e.to_string())
    }
}

/// Result type for subscriber operations.
pub type Result<T> = std::result::Result<T, SubscriberError>;
