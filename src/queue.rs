//! Operation queue: the in-memory pending set.
//!
//! Deduplicates by target, orders batches by priority, and writes every
//! mutation through to the [`PersistenceStore`].
//!
//! # Design
//!
//! ```text
//! insert(op) ──▶ same (type, collection, document) pending?
//!                  ├─ yes: fold stale increments into op, replace in place
//!                  └─ no:  append
//!                         │
//!                         ▼
//!                  Vec<Operation>  (position = insertion order)
//!                         │
//!                         ├──▶ take_batch(n): stable sort by priority desc,
//!                         │    members marked in flight
//!                         └──▶ save(snapshot) after every mutation
//! ```
//!
//! # Replacing an in-flight operation
//!
//! A newer write may replace an operation whose batch is still being
//! committed. It does not absorb that operation's increments, since the
//! batch may yet commit them. If the batch fails instead, the increments are
//! folded into the successor by [`OperationQueue::record_failure`].
//!
//! The in-memory vector is the source of truth during a session. A failed
//! write-through is logged and counted but never rolls back memory; the next
//! successful save catches the store up.
use crate::operation::{Operation, OperationId};
use crate::persistence::PersistenceStore;
use crate::retry::{AttemptVerdict, RetryPolicy};
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Result of inserting an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New pending write.
    Added,
    /// Replaced a pending write to the same target.
    Replaced { previous: OperationId },
}

/// Ordered, deduplicating pending set with write-through persistence.
pub struct OperationQueue {
    ops: Vec<Operation>,
    /// Members of the batch currently being committed.
    in_flight: HashSet<OperationId>,
    store: Arc<dyn PersistenceStore>,
}

impl OperationQueue {
    /// Empty queue backed by `store`. Does not read the store.
    pub fn new(store: Arc<dyn PersistenceStore>) -> Self {
        Self {
            ops: Vec::new(),
            in_flight: HashSet::new(),
            store,
        }
    }

    /// Rebuild the queue from whatever `store` holds.
    ///
    /// Duplicate ids and duplicate targets left behind by an older build are
    /// collapsed the same way `insert` would have collapsed them.
    pub async fn restore(store: Arc<dyn PersistenceStore>) -> crate::error::Result<Self> {
        let loaded = store.load().await?;
        let loaded_count = loaded.len();

        let mut queue = Self::new(store);
        let mut seen = HashSet::new();
        for op in loaded {
            if !seen.insert(op.id().clone()) {
                warn!(op_id = %op.id(), "Dropping duplicate persisted operation id");
                continue;
            }
            queue.place(op);
        }

        if queue.ops.len() != loaded_count {
            queue.persist().await;
        }
        Ok(queue)
    }

    /// Insert `op`, replacing a pending write to the same target.
    pub async fn insert(&mut self, op: Operation) -> InsertOutcome {
        let outcome = self.place(op);
        self.persist().await;
        outcome
    }

    /// In-memory insert with dedup; no persistence.
    fn place(&mut self, mut op: Operation) -> InsertOutcome {
        match self.ops.iter().position(|existing| op.supersedes(existing)) {
            Some(index) => {
                let previous = &self.ops[index];
                if !self.in_flight.contains(previous.id()) {
                    op.absorb_increments(previous);
                }
                let previous_id = previous.id().clone();
                debug!(
                    op_id = %op.id(),
                    replaced = %previous_id,
                    target = %op.target(),
                    "Replaced pending operation"
                );
                self.ops[index] = op;
                InsertOutcome::Replaced {
                    previous: previous_id,
                }
            }
            None => {
                self.ops.push(op);
                InsertOutcome::Added
            }
        }
    }

    /// Up to `max` operations in flush order, without removing them.
    ///
    /// Priority descending, then queue position ascending. A replacement
    /// keeps the slot of the write it replaced, so it can precede operations
    /// created before it.
    pub fn select_batch(&self, max: usize) -> Vec<Operation> {
        let mut order: Vec<&Operation> = self.ops.iter().collect();
        order.sort_by_key(|op| Reverse(op.priority()));
        order.into_iter().take(max).cloned().collect()
    }

    /// Select the next batch and mark its members in flight.
    ///
    /// Only one batch is in flight at a time, so this replaces any previous
    /// marks.
    pub fn take_batch(&mut self, max: usize) -> Vec<Operation> {
        let batch = self.select_batch(max);
        self.in_flight = batch.iter().map(|op| op.id().clone()).collect();
        batch
    }

    /// Whether `id` belongs to the batch being committed.
    pub fn is_in_flight(&self, id: &OperationId) -> bool {
        self.in_flight.contains(id)
    }

    /// Drain a committed batch. Returns how many members were still pending
    /// (the rest were replaced or cleared mid-flight).
    pub async fn commit(&mut self, batch: &[Operation]) -> usize {
        self.in_flight.clear();
        let ids: Vec<OperationId> = batch.iter().map(|op| op.id().clone()).collect();
        self.remove(&ids).await
    }

    /// Remove the given operations. Returns how many were present.
    pub async fn remove(&mut self, ids: &[OperationId]) -> usize {
        let ids: HashSet<&OperationId> = ids.iter().collect();
        let before = self.ops.len();
        self.ops.retain(|op| !ids.contains(op.id()));
        let removed = before - self.ops.len();
        if removed > 0 {
            self.persist().await;
        }
        removed
    }

    /// Drop everything. Returns how many were pending.
    pub async fn remove_all(&mut self) -> usize {
        let removed = self.ops.len();
        self.ops.clear();
        self.persist().await;
        removed
    }

    /// Apply a failed batch.
    ///
    /// Each member still pending is charged one attempt; members whose budget
    /// is spent are removed and returned. Members replaced mid-flight hand
    /// their increments to the replacing operation. Members cleared
    /// mid-flight are ignored.
    pub async fn record_failure(
        &mut self,
        batch: &[Operation],
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Vec<Operation> {
        self.in_flight.clear();
        let pending: HashSet<OperationId> = self.ops.iter().map(|op| op.id().clone()).collect();

        for sent in batch.iter().filter(|op| !pending.contains(op.id())) {
            if let Some(successor) = self.ops.iter_mut().find(|op| op.supersedes(sent)) {
                debug!(op_id = %successor.id(), replaced = %sent.id(), "Folding failed increments into successor");
                successor.absorb_increments(sent);
            }
        }

        let ids: HashSet<&OperationId> = batch.iter().map(|op| op.id()).collect();
        let mut discarded = Vec::new();
        let mut kept = Vec::with_capacity(self.ops.len());

        for mut op in self.ops.drain(..) {
            if !ids.contains(op.id()) {
                kept.push(op);
                continue;
            }
            match policy.charge_attempt(&mut op, now) {
                AttemptVerdict::Retry { remaining } => {
                    debug!(op_id = %op.id(), attempt = op.retry_count(), remaining, "Operation will retry");
                    kept.push(op);
                }
                AttemptVerdict::Discard => discarded.push(op),
            }
        }
        self.ops = kept;
        self.persist().await;
        discarded
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn get(&self, id: &OperationId) -> Option<&Operation> {
        self.ops.iter().find(|op| op.id() == id)
    }

    /// Pending operations in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.ops.iter()
    }

    async fn persist(&self) -> bool {
        match self.store.save(&self.ops).await {
            Ok(()) => {
                crate::metrics::record_persist(true, self.ops.len());
                true
            }
            Err(e) => {
                error!(error = %e, pending = self.ops.len(), "Failed to persist pending operations");
                crate::metrics::record_persist(false, 0);
                false
            }
        }
    }
}
