//! Mock RemoteStore for testing.
//!
//! Records every commit attempt and applies successful batches to an
//! in-memory document map, resolving increments and server timestamps the
//! way a real document store would. Failures and a commit gate are
//! configurable.
//!
//! # Example
//! ```rust,ignore
//! let remote = Arc::new(MockRemoteStore::gated());
//!
//! // ... start a flush, it blocks inside commit_batch ...
//! remote.release(1);
//!
//! assert_eq!(remote.committed_batches().len(), 1);
//! ```

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use sync_queue::remote::BoxFuture;
use sync_queue::{
    FieldValue, Operation, QueueListener, RemoteError, RemoteStore, WriteInstruction, WriteMode,
};
use tokio::sync::Semaphore;

/// Value the mock writes for server timestamps.
pub const SERVER_TIME: &str = "<server_time>";

/// Error message of simulated failures.
pub const FAILURE_MESSAGE: &str = "remote unavailable";

pub struct MockRemoteStore {
    /// Every commit attempt, successful or not
    attempts: Mutex<Vec<Vec<WriteInstruction>>>,
    /// Attempts that committed
    committed: Mutex<Vec<Vec<WriteInstruction>>>,
    /// Document path -> fields
    documents: Mutex<BTreeMap<String, Map<String, Value>>>,
    fail_always: AtomicBool,
    /// Fail every odd-numbered attempt
    flapping: AtomicBool,
    fail_remaining: AtomicUsize,
    /// When set, each commit waits for one permit
    gate: Option<Semaphore>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    batch_cap: usize,
}

impl MockRemoteStore {
    /// A store that accepts every batch immediately.
    pub fn new() -> Self {
        Self {
            attempts: Mutex::new(Vec::new()),
            committed: Mutex::new(Vec::new()),
            documents: Mutex::new(BTreeMap::new()),
            fail_always: AtomicBool::new(false),
            flapping: AtomicBool::new(false),
            fail_remaining: AtomicUsize::new(0),
            gate: None,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            batch_cap: sync_queue::remote::DEFAULT_REMOTE_BATCH_LIMIT,
        }
    }

    /// A store that rejects every batch.
    pub fn failing() -> Self {
        let store = Self::new();
        store.fail_always.store(true, Ordering::SeqCst);
        store
    }

    /// A store whose commits block until [`release`](Self::release)d.
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new()
        }
    }

    pub fn with_batch_cap(cap: usize) -> Self {
        Self {
            batch_cap: cap,
            ..Self::new()
        }
    }

    /// Fail the next `n` commits, then succeed.
    pub fn fail_next(&self, n: usize) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Alternate failure and success, starting with a failure.
    pub fn set_flapping(&self, flapping: bool) {
        self.flapping.store(flapping, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_always.store(failing, Ordering::SeqCst);
    }

    /// Let `n` blocked commits proceed.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn attempts(&self) -> Vec<Vec<WriteInstruction>> {
        self.attempts.lock().clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().len()
    }

    pub fn committed_batches(&self) -> Vec<Vec<WriteInstruction>> {
        self.committed.lock().clone()
    }

    /// Commits currently inside `commit_batch`.
    pub fn active_commits(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_commits(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn document(&self, path: &str) -> Option<Map<String, Value>> {
        self.documents.lock().get(path).cloned()
    }

    pub fn document_paths(&self) -> Vec<String> {
        self.documents.lock().keys().cloned().collect()
    }

    /// `count` of every document in `collection` whose id starts with `prefix`.
    pub fn shard_counts(&self, collection: &str, prefix: &str) -> BTreeMap<String, i64> {
        let wanted = format!("{}/{}", collection, prefix);
        self.documents
            .lock()
            .iter()
            .filter(|(path, _)| path.starts_with(&wanted))
            .map(|(path, doc)| {
                let count = doc.get("count").and_then(Value::as_i64).unwrap_or(0);
                (path.clone(), count)
            })
            .collect()
    }

    fn apply(&self, writes: &[WriteInstruction]) {
        let mut documents = self.documents.lock();
        for write in writes {
            let doc = documents.entry(write.document_path()).or_default();
            if write.mode == WriteMode::Set {
                doc.clear();
            }
            for (name, value) in &write.fields {
                let resolved = match value {
                    FieldValue::Value(v) => v.clone(),
                    FieldValue::ServerTimestamp => Value::from(SERVER_TIME),
                    FieldValue::Increment(by) => {
                        let current = doc.get(name).and_then(Value::as_i64).unwrap_or(0);
                        Value::from(current + by)
                    }
                };
                doc.insert(name.clone(), resolved);
            }
        }
    }

    fn should_fail(&self, attempt: usize) -> bool {
        if self.fail_always.load(Ordering::SeqCst) {
            return true;
        }
        if self.flapping.load(Ordering::SeqCst) {
            return attempt % 2 == 1;
        }
        self.fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MockRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteStore for MockRemoteStore {
    fn max_batch_size(&self) -> usize {
        self.batch_cap
    }

    fn commit_batch(&self, writes: Vec<WriteInstruction>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            let attempt = {
                let mut attempts = self.attempts.lock();
                attempts.push(writes.clone());
                attempts.len()
            };

            if let Some(gate) = &self.gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }

            let result = if self.should_fail(attempt) {
                Err(RemoteError::transient(FAILURE_MESSAGE))
            } else {
                self.apply(&writes);
                self.committed.lock().push(writes);
                Ok(())
            };
            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        })
    }
}

/// A recorded listener callback.
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Queued(String),
    FlushStarted(usize),
    FlushCompleted(usize, usize),
    Failed(String, String),
    Cleared,
}

/// Listener that records every callback in order.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<Recorded>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().clone()
    }

    pub fn failures(&self) -> Vec<(String, String)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Recorded::Failed(id, reason) => Some((id.clone(), reason.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn completions(&self) -> Vec<(usize, usize)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Recorded::FlushCompleted(ok, failed) => Some((*ok, *failed)),
                _ => None,
            })
            .collect()
    }
}

impl QueueListener for RecordingListener {
    fn on_operation_queued(&self, op: &Operation) {
        self.events.lock().push(Recorded::Queued(op.id().to_string()));
    }

    fn on_flush_started(&self, count: usize) {
        self.events.lock().push(Recorded::FlushStarted(count));
    }

    fn on_flush_completed(&self, committed: usize, failed: usize) {
        self.events
            .lock()
            .push(Recorded::FlushCompleted(committed, failed));
    }

    fn on_operation_failed(&self, op: &Operation, reason: &str) {
        self.events
            .lock()
            .push(Recorded::Failed(op.id().to_string(), reason.to_string()));
    }

    fn on_queue_cleared(&self) {
        self.events.lock().push(Recorded::Cleared);
    }
}

/// Listener that panics on every callback.
pub struct PanickingListener;

impl QueueListener for PanickingListener {
    fn on_operation_queued(&self, _op: &Operation) {
        panic!("listener bug: queued");
    }

    fn on_flush_started(&self, _count: usize) {
        panic!("listener bug: started");
    }

    fn on_flush_completed(&self, _committed: usize, _failed: usize) {
        panic!("listener bug: completed");
    }
}
