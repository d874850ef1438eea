// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Flush scheduling: the single-flight guard and the timing state that
//! decides when an automatic flush is due.
//!
//! # Triggers
//!
//! | Trigger | Fires when |
//! |---------|------------|
//! | `Threshold` | `enqueue` pushes the pending count to the batch threshold |
//! | `Timer` | interval tick, queue non-empty, interval elapsed since last success |
//! | `Retry` | backoff deadline after a failed batch |
//! | `FollowUp` | one interval after a successful batch that left work behind |
//! | `Manual` / `Forced` | `flush()` / `force_flush()` |
//! | `Shutdown` | final best-effort flush |
//!
//! Every trigger goes through [`FlushGuard::try_acquire`]; at most one
//! flush is ever in flight.

use crate::retry::RetryPolicy;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Why a flush was attempted (for logs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Threshold,
    Timer,
    Retry,
    FollowUp,
    Manual,
    Forced,
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Threshold => "threshold",
            Self::Timer => "timer",
            Self::Retry => "retry",
            Self::FollowUp => "follow_up",
            Self::Manual => "manual",
            Self::Forced => "forced",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compare-and-swap "flush in progress" flag.
#[derive(Debug, Clone, Default)]
pub struct FlushGuard {
    in_flight: Arc<AtomicBool>,
}

impl FlushGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the flush slot, or `None` if a flush is already running.
    pub fn try_acquire(&self) -> Option<FlushPermit> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlushPermit {
                flag: Arc::clone(&self.in_flight),
            })
    }

    pub fn is_flushing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Held for the duration of one flush. Releases the guard on drop, so a
/// panicking or cancelled flush never wedges the queue.
#[derive(Debug)]
pub struct FlushPermit {
    flag: Arc<AtomicBool>,
}

impl Drop for FlushPermit {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Timing state owned by the background worker.
#[derive(Debug, Clone)]
pub struct FlushSchedule {
    interval: Duration,
    last_success: Option<Instant>,
    consecutive_failures: u32,
    not_before: Option<Instant>,
}

impl FlushSchedule {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_success: None,
            consecutive_failures: 0,
            not_before: None,
        }
    }

    /// Whether a timer tick should flush.
    pub fn timer_due(&self, now: Instant, pending: usize) -> bool {
        if pending == 0 || self.in_backoff(now) {
            return false;
        }
        match self.last_success {
            Some(at) => now.saturating_duration_since(at) >= self.interval,
            None => true,
        }
    }

    /// Whether a failed batch's backoff is still running.
    pub fn in_backoff(&self, now: Instant) -> bool {
        self.not_before.is_some_and(|t| now < t)
    }

    pub fn record_success(&mut self, now: Instant) {
        self.last_success = Some(now);
        self.consecutive_failures = 0;
        self.not_before = None;
    }

    /// Count a failed cycle and return the backoff before the next attempt.
    pub fn record_failure(&mut self, now: Instant, policy: &RetryPolicy) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let delay = policy.delay_for_failures(self.consecutive_failures);
        self.not_before = Some(now + delay);
        delay
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_success(&self) -> Option<Instant> {
        self.last_success
    }
}
