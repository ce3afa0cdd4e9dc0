//! Error types for the connect agent
//!
//! This module defines all error types used throughout the crate.
//! Variants follow the failure taxonomy of the agent: relay-side failures
//! carry the numeric disconnect code so the backoff policy can key on it.

use thiserror::Error;

use crate::config::RemoteAccessType;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the connect agent
#[derive(Error, Debug)]
pub enum Error {
    /// Connection dropped or could not be opened (retryable)
    #[error("Network error: {0}")]
    Network(String),

    /// Relay rejected the credential (code 401)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Relay rejected this software version (code 426)
    #[error("Version rejected by relay: {0}")]
    VersionRejected(String),

    /// Relay asked us to slow down (code 429)
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Relay-side failure with an explicit code
    #[error("Relay error ({code}): {message}")]
    Relay {
        /// Disconnect code reported by the relay or transport
        code: u16,
        /// Human readable message
        message: String,
    },

    /// UPnP mapping creation, renewal, or removal failed
    #[error("Router error: {0}")]
    Router(String),

    /// Configuration errors (rejected at the mutation boundary)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed or misattributed inbound event
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A backend was asked to begin while a different type is configured
    #[error("Remote access type mismatch: backend is {expected}, configured type is {actual}")]
    TypeMismatch {
        /// The backend's own type
        expected: RemoteAccessType,
        /// The configured type at the time of the call
        actual: RemoteAccessType,
    },

    /// Reverse proxy reload failed
    #[error("Reverse proxy error: {0}")]
    Proxy(String),

    /// Config persistence errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create an authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create a relay error with a disconnect code
    pub fn relay(code: u16, message: impl Into<String>) -> Self {
        Self::Relay {
            code,
            message: message.into(),
        }
    }

    /// Create a router error
    pub fn router(msg: impl Into<String>) -> Self {
        Self::Router(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a reverse proxy error
    pub fn proxy(msg: impl Into<String>) -> Self {
        Self::Proxy(msg.into())
    }

    /// Create a persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Disconnect code carried by this error, if it came from the relay side.
    ///
    /// Transports return these from a failed handshake so the connection
    /// manager can feed them to the backoff policy like a regular disconnect.
    pub fn disconnect_code(&self) -> Option<u16> {
        match self {
            Self::Authentication(_) => Some(401),
            Self::VersionRejected(_) => Some(426),
            Self::RateLimited(_) => Some(429),
            Self::Relay { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
