// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the sync queue.
//!
//! Errors are categorized by their source and carry enough context to be
//! logged without further lookup.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `InvalidOperation` | No | Operation rejected at build/enqueue time |
//! | `Codec` | No | Persisted record could not be encoded/decoded |
//! | `UnsupportedSchema` | No | Persisted record written by a newer schema |
//! | `Persistence` | Busy only | Local SQLite errors |
//! | `Remote` | Transient only | Remote store rejected or failed a batch |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Manager lifecycle violation |
//! | `Shutdown` | No | Manager has been shut down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Propagation
//!
//! Remote failures never surface through [`QueueManager::enqueue`](crate::QueueManager::enqueue).
//! They are absorbed by the retry policy and reported through listeners.
//! Only local problems (a malformed operation, a stopped manager) are
//! returned to the caller.

use thiserror::Error;

/// Result type alias for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors that can occur inside the queue.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Malformed operation.
    ///
    /// Raised by [`OperationBuilder::build`](crate::OperationBuilder::build)
    /// and re-checked by `enqueue`. The operation never enters the queue.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// JSON encoding/decoding of a persisted record failed.
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A persisted record carries a schema version this build cannot read.
    #[error("Unsupported schema version {found} (max supported {supported})")]
    UnsupportedSchema { found: u32, supported: u32 },

    /// SQLite error while saving or loading pending operations.
    #[error("Persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    /// The remote store failed to commit a batch.
    #[error("Remote store error: {0}")]
    Remote(#[from] RemoteError),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lifecycle violation (e.g. `start()` on a running manager).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// The manager has been shut down.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Remote(e) => e.is_transient(),
            Self::Persistence(e) => is_busy(e),
            Self::InvalidOperation(_) => false,
            Self::Codec(_) => false,
            Self::UnsupportedSchema { .. } => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Shorthand for [`QueueError::InvalidOperation`].
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidOperation(message.into())
    }
}

/// Check if an sqlx error is SQLITE_BUSY / SQLITE_LOCKED.
pub(crate) fn is_busy(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Error reported by a [`RemoteStore`](crate::remote::RemoteStore).
///
/// The queue treats every commit failure the same way (retry accounting plus
/// backoff). `transient` only feeds logging and metrics.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RemoteError {
    /// Human-readable reason, forwarded to `on_operation_failed`.
    pub message: String,
    transient: bool,
}

impl RemoteError {
    /// A failure that may succeed on retry (network, timeout, unavailable).
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    /// A failure the remote considers final (permission denied, invalid data).
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }

    /// Whether the remote flagged the failure as transient.
    pub fn is_transient(&self) -> bool {
        self.transient
    }
}
