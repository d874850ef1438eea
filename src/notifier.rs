// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Lifecycle notifications.
//!
//! Two delivery paths carry the same five events:
//!
//! - **Listeners** ([`QueueListener`]): synchronous callbacks, invoked in
//!   registration order on the thread that produced the event. A panicking
//!   listener is caught and logged; the remaining listeners still run and
//!   the queue is unaffected.
//! - **Event stream** ([`QueueEvent`] over `tokio::sync::broadcast`): owned
//!   values for async consumers. Slow receivers lag and lose events rather
//!   than slowing the queue down.

use crate::operation::Operation;
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

/// Default capacity of the broadcast event stream.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Callback interface for queue lifecycle events. All methods default to
/// no-ops; implement the ones you care about.
pub trait QueueListener: Send + Sync {
    /// An operation entered the queue (after dedup).
    fn on_operation_queued(&self, _op: &Operation) {}

    /// A batch of `count` operations is about to be submitted.
    fn on_flush_started(&self, _count: usize) {}

    /// A submitted batch finished. On failure `committed` is zero.
    fn on_flush_completed(&self, _committed: usize, _failed: usize) {}

    /// An operation exhausted its retries and was discarded.
    fn on_operation_failed(&self, _op: &Operation, _reason: &str) {}

    /// All pending operations were dropped by `clear()`.
    fn on_queue_cleared(&self) {}
}

/// Owned form of a lifecycle event.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    OperationQueued { op: Operation },
    FlushStarted { count: usize },
    FlushCompleted { committed: usize, failed: usize },
    OperationFailed { op: Operation, reason: String },
    QueueCleared,
}

/// Listener registry plus event stream.
pub struct Notifier {
    listeners: RwLock<Vec<Arc<dyn QueueListener>>>,
    events: broadcast::Sender<QueueEvent>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

fn same_listener(a: &Arc<dyn QueueListener>, b: &Arc<dyn QueueListener>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl Notifier {
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            listeners: RwLock::new(Vec::new()),
            events,
        }
    }

    /// Register a listener. Returns `false` if it was already registered.
    pub fn add(&self, listener: Arc<dyn QueueListener>) -> bool {
        let mut listeners = self.listeners.write();
        if listeners.iter().any(|l| same_listener(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Unregister a listener. Returns `false` if it was not registered.
    pub fn remove(&self, listener: &Arc<dyn QueueListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !same_listener(l, listener));
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn operation_queued(&self, op: &Operation) {
        self.dispatch("on_operation_queued", |l| l.on_operation_queued(op));
        self.publish(|| QueueEvent::OperationQueued { op: op.clone() });
    }

    pub fn flush_started(&self, count: usize) {
        self.dispatch("on_flush_started", |l| l.on_flush_started(count));
        self.publish(|| QueueEvent::FlushStarted { count });
    }

    pub fn flush_completed(&self, committed: usize, failed: usize) {
        self.dispatch("on_flush_completed", |l| {
            l.on_flush_completed(committed, failed)
        });
        self.publish(|| QueueEvent::FlushCompleted { committed, failed });
    }

    pub fn operation_failed(&self, op: &Operation, reason: &str) {
        self.dispatch("on_operation_failed", |l| l.on_operation_failed(op, reason));
        self.publish(|| QueueEvent::OperationFailed {
            op: op.clone(),
            reason: reason.to_string(),
        });
    }

    pub fn queue_cleared(&self) {
        self.dispatch("on_queue_cleared", |l| l.on_queue_cleared());
        self.publish(|| QueueEvent::QueueCleared);
    }

    /// Call every listener, isolating panics.
    ///
    /// Works on a snapshot so listeners may (un)register from a callback.
    fn dispatch(&self, event: &'static str, call: impl Fn(&dyn QueueListener)) {
        let listeners: Vec<Arc<dyn QueueListener>> = self.listeners.read().clone();
        for (index, listener) in listeners.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| call(listener.as_ref()))).is_err() {
                warn!(event, listener = index, "Queue listener panicked");
                crate::metrics::record_listener_panic(event);
            }
        }
    }

    fn publish(&self, event: impl FnOnce() -> QueueEvent) {
        if self.events.receiver_count() > 0 {
            // Err only means every receiver dropped in the meantime.
            let _ = self.events.send(event());
        }
    }
}
