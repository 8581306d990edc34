//! Common error types for the SMTP health check components.

use std::fmt;

/// A specialized Result type for health check operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for health check operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Peer link error: {0}")]
    Peer(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }

    /// Create a new peer link error.
    pub fn peer(msg: impl fmt::Display) -> Self {
        Error::Peer(msg.to_string())
    }

    /// Create a new other error.
    pub fn other(msg: impl fmt::Display) -> Self {
        Error::Other(msg.to_string())
    }
}
