//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Mock RemoteStore that records batches and applies them to in-memory documents
//! - Recording and panicking listeners
//! - Operation and config helpers

#![allow(dead_code)]

pub mod mock_remote;

pub use mock_remote::*;

use std::sync::Arc;
use std::time::Duration;
use sync_queue::{
    AlwaysOnline, Connectivity, MemoryStore, NoAuth, Operation, OperationType, PersistenceStore,
    QueueConfig, QueueManager,
};

/// Fast config with the timer effectively disabled, so tests decide when
/// flushes happen.
pub fn manual_config() -> QueueConfig {
    QueueConfig {
        flush_interval: "1h".to_string(),
        ..QueueConfig::for_testing()
    }
}

/// Manager over an in-memory store, always online, no signed-in user.
pub async fn manager(config: QueueConfig, remote: Arc<MockRemoteStore>) -> QueueManager {
    manager_with(config, remote, Arc::new(AlwaysOnline), Arc::new(MemoryStore::new())).await
}

pub async fn manager_with(
    config: QueueConfig,
    remote: Arc<MockRemoteStore>,
    connectivity: Arc<dyn Connectivity>,
    store: Arc<dyn PersistenceStore>,
) -> QueueManager {
    QueueManager::new(config, remote, store, connectivity, Arc::new(NoAuth))
        .await
        .expect("manager should build")
}

/// Merge-upsert of a player's stats document.
pub fn stats_op(user: &str, score: i64) -> Operation {
    Operation::builder(OperationType::StatsUpdate, "player_stats")
        .document(user)
        .field("score", score)
        .build()
        .expect("valid operation")
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
