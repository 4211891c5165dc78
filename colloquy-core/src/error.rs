//! Error types for Colloquy operations

use std::time::Duration;

/// Result type for Colloquy operations
pub type Result<T> = std::result::Result<T, ColloquyError>;

/// Error types for the orchestration layer
#[derive(Debug, thiserror::Error)]
pub enum ColloquyError {
    /// A dependency call exceeded its call timeout
    #[error("Dependency '{name}' timed out after {timeout:?}")]
    DependencyTimeout {
        /// Dependency name
        name: String,
        /// The timeout that elapsed
        timeout: Duration,
    },

    /// A dependency answered with a non-success response or could not be reached
    #[error("Dependency '{name}' failed: {message}")]
    DependencyError {
        /// Dependency name
        name: String,
        /// Failure detail
        message: String,
    },

    /// The circuit is open and no fallback is registered
    #[error("Dependency '{0}' is unavailable (circuit open)")]
    DependencyUnavailable(String),

    /// The persistence backend is unreachable or rejected the operation
    #[error("Session store error: {0}")]
    SessionStore(String),

    /// The caller supplied an invalid request
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl ColloquyError {
    /// Build a [`ColloquyError::DependencyError`]
    pub fn dependency(name: impl Into<String>, message: impl Into<String>) -> Self {
        ColloquyError::DependencyError {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl From<String> for ColloquyError {
    fn from(s: String) -> Self {
        ColloquyError::Other(s)
    }
}

impl From<&str> for ColloquyError {
    fn from(s: &str) -> Self {
        ColloquyError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for ColloquyError {
    fn from(err: anyhow::Error) -> Self {
        ColloquyError::Other(err.to_string())
    }
}

impl From<figment::Error> for ColloquyError {
    fn from(err: figment::Error) -> Self {
        ColloquyError::Configuration(err.to_string())
    }
}
