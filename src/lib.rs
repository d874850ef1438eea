//! # Sync Queue
//!
//! A durable, deduplicating operation queue that batches writes to a remote
//! document store and commits each batch atomically.
//!
//! ## Architecture
//!
//! Callers enqueue small write operations (leaderboard entries, stats,
//! counter increments). The queue keeps them durable across restarts and
//! ships them in batches when a threshold is reached, a timer fires, or the
//! caller asks:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                               sync-queue                                  │
//! │                                                                           │
//! │  ┌──────────────┐    ┌────────────────┐    ┌───────────────────────────┐  │
//! │  │ QueueManager │───►│ OperationQueue │───►│ BatchExecutor             │  │
//! │  │ (enqueue)    │    │ (dedup, order) │    │ (atomic commit to remote) │  │
//! │  └──────────────┘    └────────────────┘    └───────────────────────────┘  │
//! │         │                    │                          │                 │
//! │         ▼                    ▼                          ▼                 │
//! │  ┌──────────────┐    ┌────────────────┐    ┌───────────────────────────┐  │
//! │  │ Flush worker │    │ SqliteStore    │    │ RetryPolicy + Notifier    │  │
//! │  │ (timer)      │    │ (write-through)│    │ (backoff, listeners)      │  │
//! │  └──────────────┘    └────────────────┘    └───────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! 1. **At most one pending write per document**: a newer write to the same
//!    `(type, collection, document)` replaces the older one.
//! 2. **At most one batch in flight**: every flush path goes through one guard.
//! 3. **Durable until committed**: pending operations are persisted on every
//!    change and only drained after the remote confirms the batch.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sync_queue::{builders, AlwaysOnline, NoAuth, NoOpRemoteStore, QueueConfig, QueueManager};
//!
//! #[tokio::main]
//! async fn main() -> sync_queue::Result<()> {
//!     let manager = QueueManager::open(
//!         QueueConfig::default(),
//!         Arc::new(NoOpRemoteStore),
//!         Arc::new(AlwaysOnline),
//!         Arc::new(NoAuth),
//!     )
//!     .await?;
//!     manager.start()?;
//!
//!     manager
//!         .enqueue(builders::leaderboard_update("u1", "Nova", 4200)?)
//!         .await?;
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod builders;
pub mod codec;
pub mod config;
pub mod error;
pub mod executor;
pub mod manager;
pub mod metrics;
pub mod notifier;
pub mod operation;
pub mod persistence;
pub mod queue;
pub mod remote;
pub mod retry;
pub mod scheduler;

// Re-exports for convenience
pub use config::{PersistenceConfig, QueueConfig, RetryConfig};
pub use error::{QueueError, RemoteError, Result};
pub use manager::{FlushOutcome, ManagerState, QueueManager, QueueStats};
pub use notifier::{QueueEvent, QueueListener};
pub use operation::{
    FieldValue, Operation, OperationBuilder, OperationId, OperationType, Payload, Priority, Target,
};
pub use persistence::{MemoryStore, PersistenceStore, SqliteStore};
pub use remote::{
    AlwaysOnline, AuthProvider, Connectivity, ConnectivityFlag, NoAuth, NoOpRemoteStore,
    RemoteStore, SessionAuth, WriteInstruction, WriteMode,
};
