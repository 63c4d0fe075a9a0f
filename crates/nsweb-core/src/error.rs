//! Error types for nsweb.

use thiserror::Error;

/// Result type alias using nsweb's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for nsweb operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found (unknown UUID, missing artifact, result not ready)
    #[error("Not found: {0}")]
    NotFound(String),

    /// User input rejected before any work was done
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Remote image host or NeuroVault lookup failed
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// A worker job failed or did not answer in time
    #[error("Computation failed: {0}")]
    Computation(String),

    /// Authenticated but not authorized
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors that map to a "not found / not ready" response.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}
