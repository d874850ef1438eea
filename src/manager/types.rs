//! Manager state and reporting types.
//!
//! # State Transitions
//!
//! ```text
//!              start()
//! Created ─────────────────→ Running
//!    │                          │
//!    │ shutdown()               │ shutdown()
//!    ↓                          ↓
//! ShuttingDown ←────────────────┘
//!    │
//!    │ (worker joined, final flush, store closed)
//!    ↓
//! Stopped
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: after `QueueManager::new()`. Pending operations are
//!   restored and `enqueue`/`flush` work, but no timer runs.
//! - **Running**: background worker owns the flush timer and retries.
//! - **ShuttingDown**: new operations are rejected; one last flush is tried.
//! - **Stopped**: store closed. Operations that did not commit stay on disk.

use crate::error::RemoteError;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Lifecycle state of the queue manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

impl ManagerState {
    /// Whether the manager still accepts operations.
    pub fn accepts_operations(self) -> bool {
        matches!(self, ManagerState::Created | ManagerState::Running)
    }
}

impl std::fmt::Display for ManagerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManagerState::Created => write!(f, "Created"),
            ManagerState::Running => write!(f, "Running"),
            ManagerState::ShuttingDown => write!(f, "ShuttingDown"),
            ManagerState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// What a flush attempt did.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// Nothing was pending.
    Idle,
    /// Connectivity reported offline; nothing was sent.
    Offline,
    /// Another flush holds the slot.
    AlreadyFlushing,
    /// The manager is shutting down or stopped.
    Stopped,
    /// One batch committed and was drained.
    Committed { committed: usize, remaining: usize },
    /// One batch failed; survivors were charged an attempt.
    Failed {
        attempted: usize,
        discarded: usize,
        retry_in: Duration,
        error: RemoteError,
    },
}

impl FlushOutcome {
    /// Whether a batch actually reached the remote store.
    pub fn was_attempted(&self) -> bool {
        matches!(self, FlushOutcome::Committed { .. } | FlushOutcome::Failed { .. })
    }

    /// Label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushOutcome::Idle => "idle",
            FlushOutcome::Offline => "offline",
            FlushOutcome::AlreadyFlushing => "already_flushing",
            FlushOutcome::Stopped => "stopped",
            FlushOutcome::Committed { .. } => "committed",
            FlushOutcome::Failed { .. } => "failed",
        }
    }
}

/// Point-in-time counters for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub flushing: bool,
    pub total_enqueued: u64,
    pub total_committed: u64,
    pub total_discarded: u64,
    pub total_deduplicated: u64,
    pub consecutive_failures: u32,
    pub last_flush_at: Option<DateTime<Utc>>,
}
