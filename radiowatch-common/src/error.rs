//! Common error types for Radiowatch

use thiserror::Error;

/// Common result type for Radiowatch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across Radiowatch services
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stream fetch error (network failure or timeout)
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// Audio decode error (corrupt or empty sample)
    #[error("Decode error: {0}")]
    Decode(String),

    /// Recognition provider error (soft-fails the cascade step)
    #[error("Provider error: {0}")]
    Provider(String),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify a storage-layer `anyhow::Error`, unwrapping sqlx errors so
    /// the retry policy still sees transient lock states.
    pub fn from_store(e: anyhow::Error) -> Self {
        match e.downcast::<sqlx::Error>() {
            Ok(db_err) => Error::Database(db_err),
            Err(other) => Error::Internal(other.to_string()),
        }
    }

    /// Whether this error is worth retrying (transient network/database states)
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Fetch(_) => true,
            Error::Database(db_err) => db_err.to_string().contains("database is locked"),
            _ => false,
        }
    }
}
