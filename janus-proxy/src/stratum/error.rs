//! Error types for the Stratum v1 protocol.

use thiserror::Error;

/// Stratum protocol errors.
#[derive(Error, Debug)]
pub enum StratumError {
    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing or serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid message format received from the peer
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Line exceeded the 64 KiB framing limit
    #[error("line exceeds framing limit")]
    LineTooLong,

    /// Connection establishment failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// `mining.subscribe` was refused
    #[error("subscription failed: {0}")]
    SubscriptionFailed(String),

    /// `mining.authorize` was refused
    #[error("authorization failed: {0}")]
    AuthorizationFailed(String),

    /// Response did not match the expectation for its request
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Connection lost
    #[error("connection lost")]
    Disconnected,

    /// Timeout waiting for a response
    #[error("timeout waiting for response")]
    Timeout,
}

/// Convenient Result type for Stratum operations.
pub type StratumResult<T> = Result<T, StratumError>;
