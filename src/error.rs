//! Error handling for the stratum pool client
//!
//! Error types covering configuration, transport and protocol failures, with
//! enough classification for the reconnect loop to decide what to do next.

use thiserror::Error;

/// Result type alias for pool client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the stratum pool client
#[derive(Error, Debug)]
pub enum Error {
    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Pool URL does not have the `scheme://host:port` shape
    #[error("Invalid pool URL {url:?}: {reason}")]
    InvalidPoolUrl { url: String, reason: String },

    /// Stratum protocol errors
    #[error("Stratum error: {message}")]
    Stratum { message: String },

    /// Network errors
    #[error("Network error: {message}")]
    Network { message: String },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Cancellation errors for async operations
    #[error("Operation was cancelled: {operation}")]
    Cancelled { operation: String },

    /// Invalid state errors
    #[error("Invalid state: {message}")]
    InvalidState { message: String },
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an invalid pool URL error
    pub fn invalid_pool_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPoolUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Create a stratum error
    pub fn stratum(message: impl Into<String>) -> Self {
        Self::Stratum {
            message: message.into(),
        }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Check if error is transient and worth a reconnect
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Network { .. } | Error::Timeout { .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Io(_) => "io",
            Error::Config { .. } => "config",
            Error::InvalidPoolUrl { .. } => "invalid_pool_url",
            Error::Stratum { .. } => "stratum",
            Error::Network { .. } => "network",
            Error::Timeout { .. } => "timeout",
            Error::Cancelled { .. } => "cancelled",
            Error::InvalidState { .. } => "invalid_state",
        }
    }
}
