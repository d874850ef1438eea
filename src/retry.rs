//! Retry policy: per-operation attempt accounting and global flush backoff.
//!
//! Two independent mechanisms:
//!
//! - **Attempt accounting.** Every operation in a failed batch is charged
//!   one attempt. Once `retry_count >= max_retries` the operation is
//!   discarded for good and reported through `on_operation_failed`.
//! - **Global backoff.** The *next automatic flush* is delayed by an
//!   exponential backoff driven by the number of consecutive failed flush
//!   cycles. A successful flush resets it.
//!
//! # Backoff Schedule (defaults)
//!
//! ```text
//! Failures  Delay
//! --------  -----
//! 1         1s
//! 2         2s
//! 3         4s
//! 4         8s
//! 5         16s
//! 6+        30s (cap)
//! ```

use crate::config::RetryConfig;
use crate::operation::Operation;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// What happened to an operation after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptVerdict {
    /// Stays pending.
    Retry { remaining: u32 },
    /// Retry budget spent; remove and report.
    Discard,
}

/// Backoff parameters resolved from [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_delay: config.base_delay_duration(),
            max_delay: config.max_delay_duration(),
            backoff_factor: config.backoff_factor,
        }
    }

    /// Charge one failed attempt to `op`.
    pub fn charge_attempt(&self, op: &mut Operation, now: DateTime<Utc>) -> AttemptVerdict {
        op.record_attempt(now);
        if op.is_exhausted() {
            AttemptVerdict::Discard
        } else {
            AttemptVerdict::Retry {
                remaining: op.max_retries() - op.retry_count(),
            }
        }
    }

    /// Delay before the next automatic flush after `consecutive_failures`
    /// failed cycles (1-indexed).
    pub fn delay_for_failures(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(consecutive_failures - 1).unwrap_or(i32::MAX);
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.base_delay.as_secs_f64() * multiplier;

        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}
