//! Configuration for the sync queue.
//!
//! Configuration is passed to [`QueueManager::new()`](crate::QueueManager::new)
//! and can be constructed programmatically or deserialized from JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use sync_queue::config::QueueConfig;
//!
//! let config = QueueConfig {
//!     batch_size_threshold: 20,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! QueueConfig
//! ├── batch_size_threshold: usize   # Pending count that triggers a flush
//! ├── flush_interval: String        # Timer period ("5s")
//! ├── max_batch_size: usize         # Local cap per batch (remote cap also applies)
//! ├── shutdown_timeout: String      # Bound on worker stop + final flush
//! ├── retry: RetryConfig            # Global flush backoff
//! └── persistence: PersistenceConfig # SQLite location
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "batch_size_threshold": 50,
//!   "flush_interval": "5s",
//!   "retry": { "base_delay": "1s", "max_delay": "30s" },
//!   "persistence": { "sqlite_path": "/data/app/sync_queue.db" }
//! }
//! ```

use crate::error::{QueueError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// QueueConfig: passed to QueueManager::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// Top-level queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Pending count at which `enqueue` triggers a flush.
    #[serde(default = "default_batch_size_threshold")]
    pub batch_size_threshold: usize,

    /// Timer period as a duration string (e.g., "5s").
    /// The timer flushes when the queue is non-empty and this much time has
    /// passed since the last successful flush.
    #[serde(default = "default_flush_interval")]
    pub flush_interval: String,

    /// Upper bound on operations per batch. The remote store's own cap is
    /// applied on top of this.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// How long `shutdown()` waits for the worker, and separately for the
    /// final flush.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: String,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,
}

fn default_batch_size_threshold() -> usize {
    50
}

fn default_flush_interval() -> String {
    "5s".to_string()
}

fn default_max_batch_size() -> usize {
    500
}

fn default_shutdown_timeout() -> String {
    "5s".to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size_threshold: 50,
            flush_interval: "5s".to_string(),
            max_batch_size: 500,
            shutdown_timeout: "5s".to_string(),
            retry: RetryConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl QueueConfig {
    /// Config with fast timings and in-memory persistence for tests.
    pub fn for_testing() -> Self {
        Self {
            batch_size_threshold: 50,
            flush_interval: "100ms".to_string(),
            max_batch_size: 500,
            shutdown_timeout: "1s".to_string(),
            retry: RetryConfig {
                base_delay: "10ms".to_string(),
                max_delay: "100ms".to_string(),
                backoff_factor: 2.0,
            },
            persistence: PersistenceConfig::in_memory(),
        }
    }

    /// Parse the flush interval, falling back to 5s.
    pub fn flush_interval_duration(&self) -> Duration {
        parse_or(&self.flush_interval, Duration::from_secs(5))
    }

    /// Parse the shutdown timeout, falling back to 5s.
    pub fn shutdown_timeout_duration(&self) -> Duration {
        parse_or(&self.shutdown_timeout, Duration::from_secs(5))
    }

    /// Reject configurations the queue cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size_threshold == 0 {
            return Err(QueueError::Config(
                "batch_size_threshold must be > 0".to_string(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(QueueError::Config("max_batch_size must be > 0".to_string()));
        }
        if self.flush_interval_duration().is_zero() {
            return Err(QueueError::Config("flush_interval must be > 0".to_string()));
        }
        self.retry.validate()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RetryConfig: global flush backoff
// ═══════════════════════════════════════════════════════════════════════════════

/// Backoff applied to the next automatic flush after a failed batch.
///
/// Delay after `n` consecutive failures is
/// `min(base_delay * backoff_factor^(n-1), max_delay)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay")]
    pub base_delay: String,

    #[serde(default = "default_max_delay")]
    pub max_delay: String,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_base_delay() -> String {
    "1s".to_string()
}

fn default_max_delay() -> String {
    "30s".to_string()
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: "1s".to_string(),
            max_delay: "30s".to_string(),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn base_delay_duration(&self) -> Duration {
        parse_or(&self.base_delay, Duration::from_secs(1))
    }

    pub fn max_delay_duration(&self) -> Duration {
        parse_or(&self.max_delay, Duration::from_secs(30))
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.backoff_factor.is_finite() && self.backoff_factor >= 1.0) {
            return Err(QueueError::Config(format!(
                "backoff_factor must be >= 1.0, got {}",
                self.backoff_factor
            )));
        }
        if self.base_delay_duration() > self.max_delay_duration() {
            return Err(QueueError::Config(format!(
                "base_delay ({}) exceeds max_delay ({})",
                self.base_delay, self.max_delay
            )));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PersistenceConfig: local durable storage
// ═══════════════════════════════════════════════════════════════════════════════

/// SQLite persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Path to the SQLite database holding pending operations.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_sqlite_path() -> String {
    "sync_queue.db".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "sync_queue.db".to_string(),
            wal_mode: true,
        }
    }
}

impl PersistenceConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }
}

fn parse_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}
