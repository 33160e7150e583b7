//! Error types for ContentMigrator.
//!
//! Library crates use [`MigratorError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all ContentMigrator operations.
#[derive(Debug, thiserror::Error)]
pub enum MigratorError {
    /// Configuration loading error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Bad configuration values or CLI input; aborts before a run starts.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Network failure, timeout, or 5xx-class response from a collaborator.
    #[error("transient error: {0}")]
    Transient(String),

    /// Quota exhaustion reported by a collaborator.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        /// Provider-suggested wait before the next attempt.
        retry_after_ms: Option<u64>,
    },

    /// Ledger revision mismatch; the caller must reload and retry.
    #[error("conflict: entry {entry_id} was modified concurrently")]
    Conflict { entry_id: String },

    /// A source item or destination object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unrecoverable content or schema problem for a single entry.
    #[error("fatal: {message}")]
    Fatal { message: String },

    /// Entry status change that breaks the stage ordering.
    #[error("invalid transition for entry {entry_id}: {from} -> {to}")]
    InvalidTransition {
        entry_id: String,
        from: String,
        to: String,
    },

    /// Ledger or destination database failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The run was aborted by an external signal.
    #[error("operation cancelled")]
    Cancelled,
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, MigratorError>;

impl MigratorError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a fatal stage error from any displayable message.
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal {
            message: msg.into(),
        }
    }

    /// Create a rate-limit error with an optional retry hint.
    pub fn rate_limited(msg: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        Self::RateLimited {
            message: msg.into(),
            retry_after_ms,
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Map an HTTP status from a collaborator onto the error taxonomy.
    ///
    /// 429 is quota exhaustion, 404 is a missing object, 408 and 5xx are
    /// transient; every other failure status is fatal for the entry.
    pub fn from_http_status(status: u16, context: &str, retry_after_ms: Option<u64>) -> Self {
        match status {
            429 => Self::rate_limited(format!("{context}: HTTP 429"), retry_after_ms),
            404 => Self::NotFound(context.to_string()),
            408 | 500..=599 => Self::Transient(format!("{context}: HTTP {status}")),
            _ => Self::fatal(format!("{context}: HTTP {status}")),
        }
    }
}
