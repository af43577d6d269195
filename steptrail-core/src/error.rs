//! Error types for the steptrail library

use thiserror::Error;

/// Result type alias using steptrail's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the steptrail library
#[derive(Debug, Error)]
pub enum Error {
    // ============ Configuration Errors ============
    /// Invalid pipeline or transport configuration
    #[error("Configuration error: {0}")]
    Config(String),

    // ============ Transport Errors ============
    /// A transport operation was rejected by the ingestion endpoint
    #[error("Transport error: {0}")]
    Transport(String),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // ============ Serialization Errors ============
    /// Metadata serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // ============ System Errors ============
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // ============ Generic Errors ============
    /// Any error raised by a user step function
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// The error's identity, recorded on failed steps
    pub fn name(&self) -> &'static str {
        match self {
            Self::Config(_) => "ValidationError",
            Self::Transport(_) | Self::Http(_) => "TransportError",
            Self::Serialization(_) => "SerializationError",
            Self::Internal(_) | Self::Other(_) => "Error",
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Http(_))
    }
}
