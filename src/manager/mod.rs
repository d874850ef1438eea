// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Queue manager: the public facade over queue, persistence, scheduler,
//! executor and notifier.
//!
//! # Architecture
//!
//! ```text
//! enqueue(op) ──▶ validate ──▶ stamp owner/lastUpdate ──▶ OperationQueue
//!                                                          (dedup + persist)
//!                                       │
//!                     pending ≥ threshold? take batch now,
//!                     commit on a spawned task
//!
//! ┌─────────────── flush worker (after start) ───────────────┐
//! │ interval tick ─▶ timer_due? ─▶ flush                      │
//! │ retry / follow-up deadline ─▶ flush                       │
//! │ force_flush() command ─▶ flush                            │
//! └───────────────────────────────────────────────────────────┘
//!
//! flush: FlushGuard ─▶ online? ─▶ take_batch ─▶ BatchExecutor
//!          ├─ Ok:  drain batch, reset backoff
//!          └─ Err: charge attempts, discard exhausted, back off
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use sync_queue::{builders, QueueConfig, QueueManager};
//!
//! let manager = QueueManager::open(config, remote, connectivity, auth).await?;
//! manager.start()?;
//!
//! manager.enqueue(builders::leaderboard_update("u1", "Nova", 4200)?).await?;
//!
//! // On app exit
//! manager.shutdown().await;
//! ```

mod types;
mod worker;

pub use types::{FlushOutcome, ManagerState, QueueStats};

use crate::config::QueueConfig;
use crate::error::{QueueError, RemoteError, Result};
use crate::executor::BatchExecutor;
use crate::metrics;
use crate::notifier::{Notifier, QueueEvent, QueueListener};
use crate::operation::{FieldValue, Operation, OperationId};
use crate::persistence::{PersistenceStore, SqliteStore};
use crate::queue::{InsertOutcome, OperationQueue};
use crate::remote::{AuthProvider, Connectivity, RemoteStore};
use crate::retry::RetryPolicy;
use crate::scheduler::{FlushGuard, FlushPermit, FlushSchedule, FlushTrigger};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

/// Field stamped with the server time on every enqueued operation.
pub const LAST_UPDATE_FIELD: &str = "lastUpdate";

/// Poll step while shutdown waits for an in-flight batch.
const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    committed: AtomicU64,
    discarded: AtomicU64,
    deduplicated: AtomicU64,
}

/// A batch taken from the queue together with the flush slot it runs under.
struct PreparedFlush {
    permit: FlushPermit,
    batch: Vec<Operation>,
    trigger: FlushTrigger,
}

/// State shared between the facade, the worker and spawned threshold flushes.
pub(crate) struct Shared {
    config: QueueConfig,
    queue: tokio::sync::Mutex<OperationQueue>,
    executor: BatchExecutor,
    retry: RetryPolicy,
    guard: FlushGuard,
    schedule: Mutex<FlushSchedule>,
    notifier: Notifier,
    connectivity: Arc<dyn Connectivity>,
    store: Arc<dyn PersistenceStore>,
    pending: AtomicUsize,
    counters: Counters,
    last_flush_at: Mutex<Option<DateTime<Utc>>>,
}

impl Shared {
    fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn publish_pending(&self, count: usize) {
        self.pending.store(count, Ordering::Release);
        metrics::set_pending(count);
    }

    /// Claim the flush slot and take the next batch.
    fn prepare(
        &self,
        queue: &mut OperationQueue,
        trigger: FlushTrigger,
    ) -> std::result::Result<PreparedFlush, FlushOutcome> {
        let Some(permit) = self.guard.try_acquire() else {
            debug!(%trigger, "Flush already in progress");
            metrics::record_flush_skipped("already_flushing");
            return Err(FlushOutcome::AlreadyFlushing);
        };
        if queue.is_empty() {
            return Err(FlushOutcome::Idle);
        }
        if !self.connectivity.is_online() {
            debug!(%trigger, pending = queue.len(), "Offline, skipping flush");
            metrics::record_flush_skipped("offline");
            return Err(FlushOutcome::Offline);
        }

        let batch = queue.take_batch(self.executor.batch_limit());
        Ok(PreparedFlush {
            permit,
            batch,
            trigger,
        })
    }

    async fn flush(&self, trigger: FlushTrigger) -> FlushOutcome {
        let prepared = {
            let mut queue = self.queue.lock().await;
            self.prepare(&mut queue, trigger)
        };
        match prepared {
            Ok(prepared) => self.execute(prepared).await,
            Err(outcome) => outcome,
        }
    }

    #[instrument(skip_all, fields(trigger = %prepared.trigger, batch_size = prepared.batch.len()))]
    async fn execute(&self, prepared: PreparedFlush) -> FlushOutcome {
        let PreparedFlush { permit, batch, .. } = prepared;
        let attempted = batch.len();
        self.notifier.flush_started(attempted);

        let started = std::time::Instant::now();
        let result = self.executor.execute(&batch).await;
        let elapsed = started.elapsed();

        let outcome = match result {
            Ok(()) => self.apply_success(&batch).await,
            Err(error) => self.apply_failure(&batch, error).await,
        };
        metrics::record_flush(outcome.as_str(), attempted, elapsed);
        drop(permit);
        outcome
    }

    async fn apply_success(&self, batch: &[Operation]) -> FlushOutcome {
        let remaining = {
            let mut queue = self.queue.lock().await;
            queue.commit(batch).await;
            self.publish_pending(queue.len());
            queue.len()
        };
        let committed = batch.len();

        self.schedule.lock().record_success(Instant::now());
        *self.last_flush_at.lock() = Some(Utc::now());
        self.counters
            .committed
            .fetch_add(committed as u64, Ordering::Relaxed);
        metrics::set_consecutive_failures(0);
        metrics::record_committed(committed);

        info!(committed, remaining, "Batch committed");
        self.notifier.flush_completed(committed, 0);
        FlushOutcome::Committed {
            committed,
            remaining,
        }
    }

    async fn apply_failure(&self, batch: &[Operation], error: RemoteError) -> FlushOutcome {
        let discarded = {
            let mut queue = self.queue.lock().await;
            let discarded = queue.record_failure(batch, &self.retry, Utc::now()).await;
            self.publish_pending(queue.len());
            discarded
        };

        let (retry_in, failures) = {
            let mut schedule = self.schedule.lock();
            let delay = schedule.record_failure(Instant::now(), &self.retry);
            (delay, schedule.consecutive_failures())
        };
        metrics::set_consecutive_failures(failures);
        metrics::record_backoff_delay(retry_in);

        warn!(
            attempted = batch.len(),
            discarded = discarded.len(),
            consecutive_failures = failures,
            retry_in_ms = retry_in.as_millis() as u64,
            error = %error,
            "Batch failed"
        );

        for op in &discarded {
            error!(
                op_id = %op.id(),
                op_type = %op.op_type(),
                target = %op.target(),
                attempts = op.retry_count(),
                "Operation discarded after exhausting retries"
            );
            metrics::record_discarded(op.op_type().as_str());
            self.notifier.operation_failed(op, &error.message);
        }
        self.counters
            .discarded
            .fetch_add(discarded.len() as u64, Ordering::Relaxed);

        self.notifier.flush_completed(0, batch.len());
        FlushOutcome::Failed {
            attempted: batch.len(),
            discarded: discarded.len(),
            retry_in,
            error,
        }
    }
}

/// Durable, deduplicating operation queue with batched remote sync.
///
/// Create with [`new`](Self::new) or [`open`](Self::open), call
/// [`start`](Self::start) to run the background flush worker, and
/// [`shutdown`](Self::shutdown) before exit. All methods take `&self`, so
/// the manager can be shared behind an `Arc`.
pub struct QueueManager {
    shared: Arc<Shared>,
    auth: Arc<dyn AuthProvider>,
    commands: mpsc::UnboundedSender<worker::Command>,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<worker::Command>>>,
    state_tx: watch::Sender<ManagerState>,
    state_rx: watch::Receiver<ManagerState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl QueueManager {
    /// Build a manager over explicit collaborators and restore whatever
    /// `store` holds.
    ///
    /// The manager starts in [`ManagerState::Created`].
    pub async fn new(
        config: QueueConfig,
        remote: Arc<dyn RemoteStore>,
        store: Arc<dyn PersistenceStore>,
        connectivity: Arc<dyn Connectivity>,
        auth: Arc<dyn AuthProvider>,
    ) -> Result<Self> {
        config.validate()?;

        let queue = OperationQueue::restore(Arc::clone(&store)).await?;
        let restored = queue.len();
        if restored > 0 {
            info!(restored, "Restored pending operations");
        }

        let shared = Arc::new(Shared {
            executor: BatchExecutor::new(remote, config.max_batch_size),
            retry: RetryPolicy::from_config(&config.retry),
            guard: FlushGuard::new(),
            schedule: Mutex::new(FlushSchedule::new(config.flush_interval_duration())),
            notifier: Notifier::default(),
            connectivity,
            store,
            pending: AtomicUsize::new(restored),
            counters: Counters::default(),
            last_flush_at: Mutex::new(None),
            queue: tokio::sync::Mutex::new(queue),
            config,
        });
        metrics::set_pending(restored);

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ManagerState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        metrics::set_manager_state("Created");

        Ok(Self {
            shared,
            auth,
            commands,
            command_rx: Mutex::new(Some(command_rx)),
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            worker: Mutex::new(None),
        })
    }

    /// Build a manager persisting to the SQLite database named in
    /// `config.persistence`.
    pub async fn open(
        config: QueueConfig,
        remote: Arc<dyn RemoteStore>,
        connectivity: Arc<dyn Connectivity>,
        auth: Arc<dyn AuthProvider>,
    ) -> Result<Self> {
        let store = SqliteStore::open(&config.persistence).await?;
        info!(path = %store.path(), "Persistence store opened");
        Self::new(config, remote, Arc::new(store), connectivity, auth).await
    }

    /// Get current manager state.
    pub fn state(&self) -> ManagerState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ManagerState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), ManagerState::Running)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Spawn the background flush worker.
    ///
    /// Must be called from within a Tokio runtime. Fails unless the manager
    /// is in [`ManagerState::Created`].
    pub fn start(&self) -> Result<()> {
        let mut from = ManagerState::Created;
        let started = self.state_tx.send_if_modified(|state| {
            from = *state;
            if *state == ManagerState::Created {
                *state = ManagerState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(QueueError::InvalidState {
                expected: ManagerState::Created.to_string(),
                actual: from.to_string(),
            });
        }

        let Some(command_rx) = self.command_rx.lock().take() else {
            return Err(QueueError::Internal("worker already spawned".into()));
        };

        let shared = Arc::clone(&self.shared);
        let shutdown_rx = self.shutdown_rx.clone();
        let handle = tokio::spawn(
            worker::run(shared, command_rx, shutdown_rx).instrument(info_span!("queue_worker")),
        );
        *self.worker.lock() = Some(handle);

        metrics::set_manager_state("Running");
        info!(
            pending = self.pending_count(),
            threshold = self.shared.config.batch_size_threshold,
            "Queue manager started"
        );

        if self.pending_count() >= self.shared.config.batch_size_threshold {
            self.force_flush();
        }
        Ok(())
    }

    /// Queue `op` for remote sync.
    ///
    /// The operation is validated, stamped with the current user (unless it
    /// already names an owner) and a server-time `lastUpdate` field, then
    /// inserted and persisted. A pending write to the same target is
    /// replaced. Reaching the batch threshold starts a flush in the
    /// background; this call never waits on the network.
    ///
    /// Returns the id of the queued operation.
    pub async fn enqueue(&self, mut op: Operation) -> Result<OperationId> {
        if !self.state().accepts_operations() {
            metrics::record_rejected("shutdown");
            return Err(QueueError::Shutdown);
        }
        if let Err(e) = op.validate() {
            warn!(op_type = %op.op_type(), error = %e, "Rejected operation");
            metrics::record_rejected("invalid_operation");
            return Err(e);
        }

        if op.owner_id().is_none() {
            op.set_owner_if_absent(self.auth.current_user_id());
        }
        op.stamp_field(LAST_UPDATE_FIELD, FieldValue::ServerTimestamp);

        let id = op.id().clone();
        let threshold = self.shared.config.batch_size_threshold;

        let (outcome, queued, prepared) = {
            let mut queue = self.shared.queue.lock().await;
            let outcome = queue.insert(op).await;
            self.shared.publish_pending(queue.len());
            let queued = queue.get(&id).cloned();
            let prepared = if queue.len() >= threshold {
                self.shared
                    .prepare(&mut queue, FlushTrigger::Threshold)
                    .ok()
            } else {
                None
            };
            (outcome, queued, prepared)
        };

        self.shared.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        if let Some(queued) = &queued {
            metrics::record_enqueued(queued.op_type().as_str());
            if let InsertOutcome::Replaced { previous } = &outcome {
                self.shared
                    .counters
                    .deduplicated
                    .fetch_add(1, Ordering::Relaxed);
                metrics::record_dedup_replaced(queued.op_type().as_str());
                debug!(op_id = %id, replaced = %previous, "Deduplicated pending write");
            }
            debug!(
                op_id = %id,
                op_type = %queued.op_type(),
                target = %queued.target(),
                priority = ?queued.priority(),
                pending = self.pending_count(),
                "Operation queued"
            );
            self.shared.notifier.operation_queued(queued);
        }

        if let Some(prepared) = prepared {
            let shared = Arc::clone(&self.shared);
            let commands = self.commands.clone();
            let state_rx = self.state_rx.clone();
            tokio::spawn(
                async move {
                    let outcome = shared.execute(prepared).await;
                    report_to_worker(&commands, &state_rx, outcome);
                }
                .instrument(info_span!("threshold_flush")),
            );
        }

        Ok(id)
    }

    /// Try to submit one batch now.
    ///
    /// Never errors: being offline, another flush in progress, or an empty
    /// queue are reported through the returned [`FlushOutcome`], as is a
    /// failed commit.
    pub async fn flush(&self) -> FlushOutcome {
        if !self.state().accepts_operations() {
            return FlushOutcome::Stopped;
        }
        let outcome = self.shared.flush(FlushTrigger::Manual).await;
        report_to_worker(&self.commands, &self.state_rx, outcome.clone());
        outcome
    }

    /// Ask the worker for an immediate flush, regardless of timer state.
    ///
    /// Returns `false` when no worker is running.
    pub fn force_flush(&self) -> bool {
        if !self.is_running() {
            debug!(state = %self.state(), "force_flush ignored, worker not running");
            return false;
        }
        self.commands
            .send(worker::Command::Flush(FlushTrigger::Forced))
            .is_ok()
    }

    /// Register a listener. Returns `false` if it was already registered.
    pub fn add_listener(&self, listener: Arc<dyn QueueListener>) -> bool {
        self.shared.notifier.add(listener)
    }

    /// Unregister a listener. Returns `false` if it was not registered.
    pub fn remove_listener(&self, listener: &Arc<dyn QueueListener>) -> bool {
        self.shared.notifier.remove(listener)
    }

    /// Owned lifecycle events for async consumers.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.notifier.subscribe()
    }

    /// Operations waiting to commit, including a batch in flight.
    pub fn pending_count(&self) -> usize {
        self.shared.pending_count()
    }

    /// Nothing pending and no flush running.
    pub fn is_idle(&self) -> bool {
        self.pending_count() == 0 && !self.shared.guard.is_flushing()
    }

    /// Snapshot of pending operations in insertion order.
    pub async fn pending_operations(&self) -> Vec<Operation> {
        self.shared.queue.lock().await.iter().cloned().collect()
    }

    /// Drop every pending operation, in memory and on disk.
    ///
    /// A batch already submitted may still commit. Returns how many
    /// operations were dropped.
    pub async fn clear(&self) -> usize {
        let removed = {
            let mut queue = self.shared.queue.lock().await;
            let removed = queue.remove_all().await;
            self.shared.publish_pending(0);
            removed
        };
        info!(removed, "Queue cleared");
        self.shared.notifier.queue_cleared();
        removed
    }

    pub fn stats(&self) -> QueueStats {
        let counters = &self.shared.counters;
        QueueStats {
            pending: self.pending_count(),
            flushing: self.shared.guard.is_flushing(),
            total_enqueued: counters.enqueued.load(Ordering::Relaxed),
            total_committed: counters.committed.load(Ordering::Relaxed),
            total_discarded: counters.discarded.load(Ordering::Relaxed),
            total_deduplicated: counters.deduplicated.load(Ordering::Relaxed),
            consecutive_failures: self.shared.schedule.lock().consecutive_failures(),
            last_flush_at: *self.shared.last_flush_at.lock(),
        }
    }

    /// Shut down the manager.
    ///
    /// 1. Reject new operations
    /// 2. Stop the worker (waiting up to `shutdown_timeout`)
    /// 3. Let an in-flight batch finish, then try one last flush, all within
    ///    `shutdown_timeout`
    /// 4. Close the store
    ///
    /// Whatever did not commit stays persisted for the next session.
    /// Calling this more than once is a no-op.
    pub async fn shutdown(&self) {
        let began = self.state_tx.send_if_modified(|state| {
            if state.accepts_operations() {
                *state = ManagerState::ShuttingDown;
                true
            } else {
                false
            }
        });
        if !began {
            debug!(state = %self.state(), "Shutdown already in progress or complete");
            return;
        }

        info!(pending = self.pending_count(), "Shutting down queue manager");
        metrics::set_manager_state("ShuttingDown");
        let _ = self.shutdown_tx.send(true);

        let timeout = self.shared.config.shutdown_timeout_duration();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => debug!("Flush worker completed gracefully"),
                Ok(Err(e)) => warn!(error = %e, "Flush worker panicked during shutdown"),
                Err(_) => warn!("Flush worker timed out during shutdown"),
            }
        }

        let shared = Arc::clone(&self.shared);
        let final_flush = async move {
            while shared.guard.is_flushing() {
                tokio::time::sleep(SHUTDOWN_POLL).await;
            }
            shared.flush(FlushTrigger::Shutdown).await
        };
        match tokio::time::timeout(timeout, final_flush).await {
            Ok(outcome) => info!(
                outcome = outcome.as_str(),
                remaining = self.pending_count(),
                "Final flush finished"
            ),
            Err(_) => warn!(
                remaining = self.pending_count(),
                "Final flush timed out (operations stay persisted)"
            ),
        }

        if let Err(e) = self.shared.store.close().await {
            warn!(error = %e, "Failed to close persistence store");
        }

        let _ = self.state_tx.send(ManagerState::Stopped);
        metrics::set_manager_state("Stopped");
        info!("Queue manager stopped");
    }
}

/// Pass the outcome of a flush run outside the worker to the worker, which
/// owns retry and follow-up scheduling. Dropped unless the worker runs.
fn report_to_worker(
    commands: &mpsc::UnboundedSender<worker::Command>,
    state_rx: &watch::Receiver<ManagerState>,
    outcome: FlushOutcome,
) {
    if !outcome.was_attempted() || *state_rx.borrow() != ManagerState::Running {
        return;
    }
    let _ = commands.send(worker::Command::Settled(outcome));
}
