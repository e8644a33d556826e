//! Error types for the portmeter system
//!
//! This module defines all error types used throughout the crate.

use thiserror::Error;

/// Result type alias for portmeter operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the portmeter system
#[derive(Error, Debug)]
pub enum Error {
    /// Counter source errors (tool unavailable, unparsable output, ...)
    #[error("Counter source error: {0}")]
    CounterSource(String),

    /// Record store errors
    #[error("Record store error: {0}")]
    RecordStore(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// An operation did not finish within its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a counter source error
    pub fn counter_source(msg: impl Into<String>) -> Self {
        Self::CounterSource(msg.into())
    }

    /// Create a record store error
    pub fn record_store(msg: impl Into<String>) -> Self {
        Self::RecordStore(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
