//! Error types for provider connection management

use thiserror::Error;

/// Result type for connection management operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by a provider backend
///
/// These are produced by `Provider` and `Connection` implementations and are
/// passed through this crate unchanged.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ProviderError {
    /// Provider or resource not found
    #[error("Provider not found: {0}")]
    NotFound(String),

    /// Authentication failed (never includes key details)
    #[error("Authentication failed")]
    AuthError,

    /// Network error occurred
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Backend reachable but not serving requests
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    /// Operation exceeded its deadline
    #[error("Provider operation timed out after {0}ms")]
    Timeout(u64),

    /// Generic provider error
    #[error("Provider error: {0}")]
    ProviderError(String),
}

/// Errors that can occur while managing provider connections
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    /// Pool acquire waited longer than the configured acquire timeout
    #[error("Timed out after {timeout_ms}ms waiting for a connection to '{provider}'")]
    ConnectionTimeout { provider: String, timeout_ms: u64 },

    /// No active provider set, or no provider registered for a key
    #[error("Provider not found")]
    ProviderNotFound,

    /// Error surfaced verbatim from a provider or connection
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Model already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// The pool was cleared or disposed
    #[error("Connection pool disposed: {0}")]
    PoolDisposed(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Handler was disposed while a retry was pending
    #[error("Connection retry cancelled")]
    RetryCancelled,

    #[error("Validation failed: {}", .0.join("; "))]
    ValidationFailed(Vec<String>),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl Error {
    /// Creates a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            Error::ConnectionTimeout { provider, timeout_ms } => format!(
                "No connection to '{}' became available within {}ms. Try again or raise the pool size.",
                provider, timeout_ms
            ),
            Error::ProviderNotFound => {
                "No provider is selected. Select a provider before connecting.".to_string()
            }
            Error::Provider(e) => format!("The provider reported an error: {}", e),
            Error::AlreadyRegistered(name) => {
                format!("A model named '{}' is already registered.", name)
            }
            Error::ModelNotFound(name) => format!("Model '{}' is not registered.", name),
            Error::PoolDisposed(key) => {
                format!("Connections to '{}' were shut down. Please try again.", key)
            }
            Error::InvalidState(msg) => format!("Operation not allowed: {}", msg),
            Error::RetryCancelled => "Connection attempt was cancelled.".to_string(),
            Error::ValidationFailed(errors) => format!(
                "Model configuration is invalid: {}. Please fix your configuration.",
                errors.join("; ")
            ),
            Error::ConfigError(msg) => format!(
                "Configuration error: {}. Please check your configuration files.",
                msg
            ),
            Error::StorageError(msg) => format!(
                "Storage error: {}. Please check your storage configuration.",
                msg
            ),
            Error::SerializationError(msg) => {
                format!("Serialization error: {}. Please check the data format.", msg)
            }
        }
    }

    /// Gets the error type for logging
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::ConnectionTimeout { .. } => "ConnectionTimeout",
            Error::ProviderNotFound => "ProviderNotFound",
            Error::Provider(_) => "Provider",
            Error::AlreadyRegistered(_) => "AlreadyRegistered",
            Error::ModelNotFound(_) => "ModelNotFound",
            Error::PoolDisposed(_) => "PoolDisposed",
            Error::InvalidState(_) => "InvalidState",
            Error::RetryCancelled => "RetryCancelled",
            Error::ValidationFailed(_) => "ValidationFailed",
            Error::ConfigError(_) => "ConfigError",
            Error::StorageError(_) => "StorageError",
            Error::SerializationError(_) => "SerializationError",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::StorageError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_is_transparent() {
        let err: Error = ProviderError::NetworkError("refused".to_string()).into();
        assert_eq!(err.to_string(), "Network error: refused");
        assert_eq!(err.error_type(), "Provider");
    }

    #[test]
    fn test_timeout_message() {
        let err = Error::ConnectionTimeout {
            provider: "ollama".to_string(),
            timeout_ms: 250,
        };
        assert!(err.to_string().contains("250ms"));
        assert!(err.user_message().contains("ollama"));
    }

    #[test]
    fn test_validation_errors_joined() {
        let err = Error::ValidationFailed(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(err.to_string(), "Validation failed: a; b");
    }
}
