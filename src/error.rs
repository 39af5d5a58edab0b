//! Error types for llm-batch
//!
//! This module provides the error taxonomy used across the engine:
//! - [`Error`], the crate-wide error returned by store, ingestion and control operations
//! - [`DatabaseError`] for persistence failures with human-readable context
//! - [`UpstreamError`] for the outcome classes of a chat-completion call

use crate::types::ErrorKind;
use thiserror::Error;

/// Result type alias for llm-batch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for llm-batch
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "cache.batch_size")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Upstream chat-completion call failed
    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Job, request or endpoint not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Input rejected by validation (job file, job options, endpoint fields)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Operation not allowed in the current state (e.g. resetting a running job)
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Shutdown in progress
    #[error("shutdown in progress")]
    ShuttingDown,

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),

    /// Constraint violation (e.g., duplicate key, endpoint still referenced)
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
}

/// Failure of a single upstream chat-completion call
///
/// Every variant except [`UpstreamError::InvalidResponse`] is transient and is
/// retried by the request executor until the job's attempt budget runs out.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The call did not finish within the endpoint timeout
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The endpoint answered 429 Too Many Requests
    #[error("rate limited: {message}")]
    RateLimited {
        /// Message extracted from the error body
        message: String,
        /// Raw error body, if any
        body: Option<serde_json::Value>,
    },

    /// The endpoint answered with a non-success status
    #[error("API error (HTTP {status}): {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Message extracted from the error body
        message: String,
        /// Raw error body, if any
        body: Option<serde_json::Value>,
    },

    /// Connection-level failure before a response was received
    #[error("transport error: {0}")]
    Transport(String),

    /// A success status with a body that is not a chat completion
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl UpstreamError {
    /// Error kind recorded in the error log for this failure
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpstreamError::Timeout(_) => ErrorKind::Timeout,
            UpstreamError::RateLimited { .. } => ErrorKind::RateLimit,
            UpstreamError::Api { .. } => ErrorKind::ApiError,
            UpstreamError::Transport(_) => ErrorKind::Transport,
            UpstreamError::InvalidResponse(_) => ErrorKind::InvalidResponse,
        }
    }

    /// Structured details stored alongside the error log entry
    pub fn details(&self) -> Option<String> {
        match self {
            UpstreamError::RateLimited { body, .. } | UpstreamError::Api { body, .. } => {
                body.as_ref().map(|b| b.to_string())
            }
            _ => None,
        }
    }
}

impl Error {
    /// Build a configuration error for the given key
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }
}
