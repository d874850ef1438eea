//! Batch executor: operation → write instruction translation and atomic
//! submission to the [`RemoteStore`].
//!
//! The executor is stateless apart from its collaborators. It never touches
//! the queue; the manager applies the outcome (drain on success, retry
//! accounting on failure).

use crate::error::RemoteError;
use crate::operation::Operation;
use crate::remote::{RemoteStore, WriteInstruction, WriteMode};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, warn};

/// Submits batches to the remote store.
pub struct BatchExecutor {
    remote: Arc<dyn RemoteStore>,
    local_cap: usize,
}

impl BatchExecutor {
    /// `local_cap` is the configured `max_batch_size`; the remote's own cap
    /// applies on top.
    pub fn new(remote: Arc<dyn RemoteStore>, local_cap: usize) -> Self {
        Self { remote, local_cap }
    }

    /// Largest batch this executor will submit.
    pub fn batch_limit(&self) -> usize {
        self.local_cap.min(self.remote.max_batch_size()).max(1)
    }

    /// Translate one operation into a write instruction.
    ///
    /// Auto-id creates get a fresh document id on every call, which is safe
    /// because a failed batch wrote nothing.
    pub fn translate(op: &Operation) -> WriteInstruction {
        let document_id = op
            .target()
            .document_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let mode = if op.merge_on_write() {
            WriteMode::Merge
        } else {
            WriteMode::Set
        };

        WriteInstruction {
            operation_id: op.id().clone(),
            collection_path: op.target().collection_path.clone(),
            document_id,
            mode,
            fields: op.payload().clone(),
        }
    }

    /// Submit `batch` as one atomic commit.
    #[instrument(skip(self, batch), fields(batch_size = batch.len()))]
    pub async fn execute(&self, batch: &[Operation]) -> Result<(), RemoteError> {
        if batch.is_empty() {
            return Ok(());
        }
        let limit = self.batch_limit();
        if batch.len() > limit {
            return Err(RemoteError::permanent(format!(
                "batch of {} exceeds limit {}",
                batch.len(),
                limit
            )));
        }

        let writes: Vec<WriteInstruction> = batch.iter().map(Self::translate).collect();
        let started = Instant::now();
        let result = self.remote.commit_batch(writes).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(()) => debug!(elapsed_ms, "Batch committed"),
            Err(e) => warn!(
                elapsed_ms,
                transient = e.is_transient(),
                error = %e,
                "Batch commit failed"
            ),
        }
        result
    }
}
