//! Error Module
//!
//! Defines error types and result types used throughout the quota engine.

use thiserror::Error;

/// Main error type for the quota engine
#[derive(Error, Debug, Clone)]
pub enum QuotaError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Record store error: {0}")]
    StoreError(String),

    #[error("Blob store error: {0}")]
    BlobError(String),

    #[error("Principal not found: {0}")]
    PrincipalNotFound(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Upload error: {0}")]
    UploadError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("System error: {0}")]
    SystemError(String),
}

impl From<std::io::Error> for QuotaError {
    fn from(err: std::io::Error) -> Self {
        QuotaError::IoError(err.to_string())
    }
}

impl From<hyper::Error> for QuotaError {
    fn from(err: hyper::Error) -> Self {
        QuotaError::HttpError(err.to_string())
    }
}

impl From<serde_json::Error> for QuotaError {
    fn from(err: serde_json::Error) -> Self {
        QuotaError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for QuotaError {
    fn from(err: serde_yaml::Error) -> Self {
        QuotaError::SerializationError(err.to_string())
    }
}

/// Result type alias for the quota engine
pub type Result<T> = std::result::Result<T, QuotaError>;
