//! Error types for the table copy engine.

use thiserror::Error;

/// Main error type for copy operations.
#[derive(Error, Debug)]
pub enum CopyError {
    /// Configuration error (invalid YAML, contradictory settings, missing keys).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database error from the PostgreSQL driver.
    #[error("Database error: {0}")]
    Db(#[from] tokio_postgres::Error),

    /// Connection pool error with context about where it occurred.
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Copy failed for a specific table.
    #[error("Copy failed for {table}: {message}")]
    Transfer { table: String, message: String },

    /// The pipe for an item was aborted. Never retried.
    #[error("Pipe aborted: {0}")]
    PipeAborted(String),

    /// A pipe put/get did not complete within the configured timeout.
    /// Fatal; the message names the settings to raise.
    #[error("Pipe timeout: {0}")]
    PipeTimeout(String),

    /// IO error (config file operations).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The migration was cancelled by the operator.
    #[error("Migration cancelled")]
    Cancelled,
}

impl CopyError {
    /// Create a Pool error with context about where it occurred.
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        CopyError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a Transfer error for a table.
    pub fn transfer(table: impl Into<String>, message: impl Into<String>) -> Self {
        CopyError::Transfer {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create an abort-signal error.
    pub fn aborted(message: impl Into<String>) -> Self {
        CopyError::PipeAborted(message.into())
    }

    /// Whether this error is an abort signal that must never be retried.
    pub fn is_abort(&self) -> bool {
        matches!(self, CopyError::PipeAborted(_) | CopyError::Cancelled)
    }
}

impl From<deadpool_postgres::PoolError> for CopyError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        CopyError::pool(e.to_string(), "acquiring pooled connection")
    }
}

/// Result type alias for copy operations.
pub type Result<T> = std::result::Result<T, CopyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_errors_are_not_retriable() {
        assert!(CopyError::aborted("pipe aborted").is_abort());
        assert!(CopyError::Cancelled.is_abort());
        assert!(!CopyError::Config("bad".into()).is_abort());
        assert!(!CopyError::transfer("t", "boom").is_abort());
    }

    #[test]
    fn timeout_message_is_actionable() {
        let e = CopyError::PipeTimeout(
            "cannot get new item in time; raise migration.pipe_timeout_secs or migration.pipe_capacity".into(),
        );
        assert!(e.to_string().contains("pipe_timeout_secs"));
    }
}
