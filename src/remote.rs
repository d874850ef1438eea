// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! External collaborator traits.
//!
//! The queue talks to three things it does not own:
//!
//! - [`RemoteStore`]: accepts an atomic multi-write batch, all or nothing
//! - [`Connectivity`]: consulted before every flush attempt
//! - [`AuthProvider`]: supplies the acting user for operations without an owner
//!
//! All three are object-safe so the manager can hold them as `Arc<dyn _>`
//! and tests can swap in mocks.
//!
//! # Example
//!
//! ```rust,no_run
//! use sync_queue::remote::{BoxFuture, RemoteStore, WriteInstruction};
//!
//! struct MyBackend { /* ... */ }
//!
//! impl RemoteStore for MyBackend {
//!     fn max_batch_size(&self) -> usize {
//!         500
//!     }
//!
//!     fn commit_batch(&self, writes: Vec<WriteInstruction>) -> BoxFuture<'_, ()> {
//!         Box::pin(async move {
//!             // Submit `writes` as one transaction.
//!             Ok(())
//!         })
//!     }
//! }
//! ```

use crate::error::RemoteError;
use crate::operation::{OperationId, Payload};
use parking_lot::RwLock;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

/// Hard cap most document stores impose on one batch.
pub const DEFAULT_REMOTE_BATCH_LIMIT: usize = 500;

/// Result type for collaborator calls.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = RemoteResult<T>> + Send + 'a>>;

/// How a write is applied to the target document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Upsert the given fields, keep the rest of the document.
    Merge,
    /// Replace the whole document.
    Set,
}

/// One write inside a batch, as submitted to the remote store.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteInstruction {
    /// Operation this write came from (for logging on the remote side).
    pub operation_id: OperationId,
    pub collection_path: String,
    /// Always concrete: auto-id creates get a freshly allocated id.
    pub document_id: String,
    pub mode: WriteMode,
    pub fields: Payload,
}

impl WriteInstruction {
    /// `collection/document` path of the target.
    pub fn document_path(&self) -> String {
        format!("{}/{}", self.collection_path, self.document_id)
    }
}

/// Remote document store with atomic batch commit.
///
/// Implementations must apply either every write in `writes` or none of
/// them. The queue relies on that: it has no per-operation result tracking.
pub trait RemoteStore: Send + Sync + 'static {
    /// Largest batch the store accepts.
    fn max_batch_size(&self) -> usize {
        DEFAULT_REMOTE_BATCH_LIMIT
    }

    /// Commit all writes atomically.
    fn commit_batch(&self, writes: Vec<WriteInstruction>) -> BoxFuture<'_, ()>;
}

/// A no-op implementation for testing/standalone mode.
///
/// Logs batches but doesn't send anything.
#[derive(Clone, Default)]
pub struct NoOpRemoteStore;

impl RemoteStore for NoOpRemoteStore {
    fn commit_batch(&self, writes: Vec<WriteInstruction>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            tracing::debug!(writes = writes.len(), "NoOp: would commit batch");
            Ok(())
        })
    }
}

/// Network reachability.
pub trait Connectivity: Send + Sync + 'static {
    fn is_online(&self) -> bool;
}

/// Connectivity that never goes offline.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

impl Connectivity for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}

/// Connectivity driven by the application (e.g. from OS network callbacks).
#[derive(Debug)]
pub struct ConnectivityFlag {
    online: AtomicBool,
}

impl ConnectivityFlag {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }
}

impl Default for ConnectivityFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity for ConnectivityFlag {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }
}

/// Source of the acting user's identity.
pub trait AuthProvider: Send + Sync + 'static {
    /// Signed-in user id, if any.
    fn current_user_id(&self) -> Option<String>;
}

/// No signed-in user.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuth;

impl AuthProvider for NoAuth {
    fn current_user_id(&self) -> Option<String> {
        None
    }
}

/// Session identity updated on sign-in/sign-out.
#[derive(Debug, Default)]
pub struct SessionAuth {
    user_id: RwLock<Option<String>>,
}

impl SessionAuth {
    pub fn new(user_id: Option<String>) -> Self {
        Self {
            user_id: RwLock::new(user_id),
        }
    }

    pub fn sign_in(&self, user_id: impl Into<String>) {
        *self.user_id.write() = Some(user_id.into());
    }

    pub fn sign_out(&self) {
        *self.user_id.write() = None;
    }
}

impl AuthProvider for SessionAuth {
    fn current_user_id(&self) -> Option<String> {
        self.user_id.read().clone()
    }
}
