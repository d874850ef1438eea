//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Enqueue and deduplication rates
//! - Flush outcomes, batch sizes and latency
//! - Retry backoff and discarded operations
//! - Local persistence writes
//! - Listener health
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `sync_queue_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! The crate only emits through the `metrics` facade; installing a recorder
//! (exporter) is the application's job.
//!
//! # Usage
//!
//! ```rust,no_run
//! use sync_queue::metrics;
//! use std::time::Duration;
//!
//! metrics::record_enqueued("stats_update");
//! metrics::record_flush("committed", 50, Duration::from_millis(120));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Queue Metrics
// =============================================================================

/// Record an accepted operation.
pub fn record_enqueued(op_type: &str) {
    counter!("sync_queue_enqueued_total", "op_type" => op_type.to_string()).increment(1);
}

/// Record an operation rejected at enqueue time.
pub fn record_rejected(reason: &str) {
    counter!("sync_queue_rejected_total", "reason" => reason.to_string()).increment(1);
}

/// Record a pending operation replaced by a newer write to the same target.
pub fn record_dedup_replaced(op_type: &str) {
    counter!("sync_queue_dedup_replaced_total", "op_type" => op_type.to_string()).increment(1);
}

/// Gauge for pending operations.
pub fn set_pending(count: usize) {
    gauge!("sync_queue_pending").set(count as f64);
}

// =============================================================================
// Flush Metrics
// =============================================================================

/// Record a flush that reached the remote store.
///
/// `outcome` is `committed` or `failed`.
pub fn record_flush(outcome: &str, batch_size: usize, duration: Duration) {
    counter!("sync_queue_flushes_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("sync_queue_batch_size").record(batch_size as f64);
    histogram!("sync_queue_flush_duration_seconds", "outcome" => outcome.to_string())
        .record(duration.as_secs_f64());
}

/// Record a flush request that never reached the remote store.
///
/// `reason` is `offline`, `already_flushing`, `backoff` or `idle`.
pub fn record_flush_skipped(reason: &str) {
    counter!("sync_queue_flush_skipped_total", "reason" => reason.to_string()).increment(1);
}

/// Record committed operations.
pub fn record_committed(count: usize) {
    counter!("sync_queue_committed_total").increment(count as u64);
}

// =============================================================================
// Retry Metrics
// =============================================================================

/// Record an operation dropped after exhausting its retries.
pub fn record_discarded(op_type: &str) {
    counter!("sync_queue_discarded_total", "op_type" => op_type.to_string()).increment(1);
}

/// Gauge for consecutive failed flush cycles.
pub fn set_consecutive_failures(count: u32) {
    gauge!("sync_queue_consecutive_failures").set(count as f64);
}

/// Record the backoff delay scheduled after a failed flush.
pub fn record_backoff_delay(delay: Duration) {
    histogram!("sync_queue_backoff_delay_seconds").record(delay.as_secs_f64());
}

// =============================================================================
// Persistence Metrics
// =============================================================================

/// Record a snapshot write to the local store.
pub fn record_persist(success: bool, count: usize) {
    let status = if success { "success" } else { "failure" };
    counter!("sync_queue_persist_total", "status" => status).increment(1);
    if success {
        histogram!("sync_queue_persist_snapshot_size").record(count as f64);
    }
}

/// Record SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn persistence_retries_total(operation: &str) {
    counter!("sync_queue_persistence_retries_total", "operation" => operation.to_string())
        .increment(1);
}

/// Record a persisted record skipped during load.
pub fn record_decode_skipped(schema_version: u32) {
    counter!(
        "sync_queue_decode_skipped_total",
        "schema_version" => schema_version.to_string()
    )
    .increment(1);
}

// =============================================================================
// Lifecycle Metrics
// =============================================================================

/// Gauge for manager state.
pub fn set_manager_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("sync_queue_manager_state").set(value);
}

/// Record a listener that panicked during dispatch.
pub fn record_listener_panic(event: &str) {
    counter!("sync_queue_listener_panics_total", "event" => event.to_string()).increment(1);
}
