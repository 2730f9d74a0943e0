//! Error Module
//!
//! Defines error types and result types used throughout the MCC proxy.

use thiserror::Error;

/// Main error type for the MCC proxy
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Cache store error: {0}")]
    CacheStoreError(String),

    #[error("Predictor error: {0}")]
    PredictorError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("System error: {0}")]
    SystemError(String),
}

impl ProxyError {
    /// True for failures of the database or cache store rather than of the proxy itself.
    pub fn is_collaborator_failure(&self) -> bool {
        matches!(
            self,
            ProxyError::ConnectionError(_)
                | ProxyError::DatabaseError(_)
                | ProxyError::CacheStoreError(_)
                | ProxyError::TimeoutError(_)
        )
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::IoError(err.to_string())
    }
}

impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        ProxyError::HttpError(err.to_string())
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        ProxyError::SerializationError(err.to_string())
    }
}

/// Result type alias for the MCC proxy
pub type Result<T> = std::result::Result<T, ProxyError>;
