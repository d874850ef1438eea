// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration tests: the queue manager end to end against a mock remote.
//!
//! Run with: cargo test --test integration

mod common;

use common::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Duration;
use sync_queue::{
    builders, ConnectivityFlag, FlushOutcome, ManagerState, MemoryStore, Operation, OperationType,
    Priority, QueueConfig, QueueEvent, QueueListener, SqliteStore,
};
use tempfile::tempdir;

const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Batching
// =============================================================================

#[tokio::test]
async fn threshold_flush_takes_exactly_one_batch() {
    let remote = Arc::new(MockRemoteStore::new());
    let config = QueueConfig {
        batch_size_threshold: 50,
        ..manual_config()
    };
    let manager = manager(config, remote.clone()).await;

    for i in 0..51 {
        manager.enqueue(stats_op(&format!("u{}", i), i)).await.unwrap();
    }

    assert!(
        wait_for(WAIT, || {
            remote.committed_batches().len() == 1 && !manager.stats().flushing
        })
        .await,
        "threshold flush never completed"
    );

    let batches = remote.committed_batches();
    assert_eq!(batches[0].len(), 50);
    assert_eq!(manager.pending_count(), 1);

    let left = manager.pending_operations().await;
    assert_eq!(left[0].target().document_id.as_deref(), Some("u50"));
}

#[tokio::test]
async fn below_threshold_nothing_is_sent() {
    let remote = Arc::new(MockRemoteStore::new());
    let manager = manager(manual_config(), remote.clone()).await;

    for i in 0..49 {
        manager.enqueue(stats_op(&format!("u{}", i), i)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(remote.attempt_count(), 0);
    assert_eq!(manager.pending_count(), 49);
}

#[tokio::test]
async fn batches_respect_remote_cap() {
    let remote = Arc::new(MockRemoteStore::with_batch_cap(3));
    let manager = manager(manual_config(), remote.clone()).await;

    for i in 0..7 {
        manager.enqueue(stats_op(&format!("u{}", i), i)).await.unwrap();
    }

    let sizes: Vec<usize> = {
        let mut sizes = Vec::new();
        while let FlushOutcome::Committed { committed, .. } = manager.flush().await {
            sizes.push(committed);
        }
        sizes
    };
    assert_eq!(sizes, vec![3, 3, 1]);
    assert_eq!(manager.pending_count(), 0);
}

// =============================================================================
// Deduplication
// =============================================================================

#[tokio::test]
async fn repeated_writes_to_one_document_collapse() {
    let remote = Arc::new(MockRemoteStore::new());
    let manager = manager(manual_config(), remote.clone()).await;

    manager.enqueue(stats_op("u1", 1)).await.unwrap();
    manager.enqueue(stats_op("u1", 2)).await.unwrap();
    let last = manager.enqueue(stats_op("u1", 3)).await.unwrap();

    assert_eq!(manager.pending_count(), 1);
    assert_eq!(manager.stats().total_deduplicated, 2);

    manager.flush().await;
    let batches = remote.committed_batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 1);
    assert_eq!(batches[0][0].operation_id, last);

    let doc = remote.document("player_stats/u1").unwrap();
    assert_eq!(doc["score"], 3);
    assert_eq!(doc["lastUpdate"], SERVER_TIME);
}

#[tokio::test]
async fn different_types_to_one_document_do_not_collapse() {
    let manager = manager(manual_config(), Arc::new(MockRemoteStore::new())).await;

    manager.enqueue(stats_op("u1", 1)).await.unwrap();
    manager
        .enqueue(
            Operation::builder(OperationType::LeaderboardUpdate, "player_stats")
                .document("u1")
                .field("score", 1)
                .build()
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(manager.pending_count(), 2);
}

#[tokio::test]
async fn auto_id_creates_never_collapse() {
    let remote = Arc::new(MockRemoteStore::new());
    let manager = manager(manual_config(), remote.clone()).await;

    let record = builders::ShareRecord {
        user_id: "u1".into(),
        user_name: "Nova".into(),
        photo_url: None,
        title: "Nebula".into(),
    };
    manager.enqueue(builders::share_record(&record).unwrap()).await.unwrap();
    manager.enqueue(builders::share_record(&record).unwrap()).await.unwrap();
    assert_eq!(manager.pending_count(), 2);

    manager.flush().await;
    let created = remote
        .document_paths()
        .into_iter()
        .filter(|p| p.starts_with("shared_items/"))
        .count();
    assert_eq!(created, 2);
}

#[tokio::test]
async fn sharded_counter_totals_survive_dedup() {
    let remote = Arc::new(MockRemoteStore::new());
    let manager = manager(manual_config(), remote.clone()).await;
    let mut rng = StdRng::seed_from_u64(2024);

    for _ in 0..1000 {
        let op = builders::sharded_increment("likes_42", &mut rng).unwrap();
        manager.enqueue(op).await.unwrap();
    }
    assert!(manager.pending_count() <= builders::DEFAULT_SHARD_COUNT as usize);

    manager.flush().await;

    let counts = remote.shard_counts(builders::COUNTER_SHARDS_COLLECTION, "likes_42_shard_");
    assert_eq!(counts.len(), builders::DEFAULT_SHARD_COUNT as usize);
    assert_eq!(counts.values().sum::<i64>(), 1000);
    for (path, count) in counts {
        assert!((65..=135).contains(&count), "{} got {}", path, count);
    }
}

// =============================================================================
// Retries and failure
// =============================================================================

#[tokio::test]
async fn exhausted_operation_is_discarded_once() {
    let remote = Arc::new(MockRemoteStore::failing());
    let manager = manager(manual_config(), remote.clone()).await;
    let listener = Arc::new(RecordingListener::default());
    manager.add_listener(listener.clone());

    let id = manager.enqueue(stats_op("u1", 1)).await.unwrap();

    for attempt in 1..=3 {
        match manager.flush().await {
            FlushOutcome::Failed { discarded, .. } => {
                assert_eq!(discarded, usize::from(attempt == 3));
            }
            other => panic!("attempt {}: unexpected outcome {:?}", attempt, other),
        }
    }

    assert_eq!(manager.pending_count(), 0);
    assert_eq!(remote.attempt_count(), 3);
    assert_eq!(
        listener.failures(),
        vec![(id.to_string(), FAILURE_MESSAGE.to_string())]
    );
    assert_eq!(listener.completions(), vec![(0, 1), (0, 1), (0, 1)]);
    assert_eq!(manager.stats().total_discarded, 1);
    assert_eq!(manager.flush().await, FlushOutcome::Idle);
}

#[tokio::test]
async fn per_operation_retry_budget() {
    let remote = Arc::new(MockRemoteStore::failing());
    let manager = manager(manual_config(), remote.clone()).await;

    let fragile = Operation::builder(OperationType::StatsUpdate, "player_stats")
        .document("fragile")
        .max_retries(1)
        .build()
        .unwrap();
    manager.enqueue(fragile).await.unwrap();
    manager.enqueue(stats_op("sturdy", 1)).await.unwrap();

    manager.flush().await;
    let left = manager.pending_operations().await;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].target().document_id.as_deref(), Some("sturdy"));
    assert_eq!(left[0].retry_count(), 1);
}

#[tokio::test]
async fn worker_retries_after_backoff() {
    let remote = Arc::new(MockRemoteStore::new());
    remote.fail_next(2);
    let manager = manager(QueueConfig::for_testing(), remote.clone()).await;
    manager.start().unwrap();

    manager.enqueue(stats_op("u1", 7)).await.unwrap();
    manager.force_flush();

    assert!(
        wait_for(WAIT, || remote.committed_batches().len() == 1).await,
        "operation never committed"
    );
    assert!(remote.attempt_count() >= 3);
    assert!(wait_for(WAIT, || manager.is_idle()).await);
    assert_eq!(manager.stats().consecutive_failures, 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn failed_threshold_flush_retries_after_backoff() {
    let remote = Arc::new(MockRemoteStore::new());
    remote.fail_next(1);
    let config = QueueConfig {
        batch_size_threshold: 1,
        ..manual_config()
    };
    let manager = manager(config, remote.clone()).await;
    manager.start().unwrap();

    manager.enqueue(stats_op("u1", 4)).await.unwrap();

    // base delay is 10ms, the timer is an hour away
    assert!(
        wait_for(Duration::from_secs(1), || remote.committed_batches().len() == 1).await,
        "threshold failure was never retried: {:?}",
        manager.stats()
    );
    assert_eq!(remote.attempt_count(), 2);
    assert!(wait_for(WAIT, || manager.is_idle()).await);
    assert_eq!(manager.stats().consecutive_failures, 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn failed_manual_flush_retries_after_backoff() {
    let remote = Arc::new(MockRemoteStore::new());
    remote.fail_next(1);
    let manager = manager(manual_config(), remote.clone()).await;
    manager.start().unwrap();

    manager.enqueue(stats_op("u1", 4)).await.unwrap();
    assert!(matches!(manager.flush().await, FlushOutcome::Failed { .. }));

    assert!(
        wait_for(Duration::from_secs(1), || remote.committed_batches().len() == 1).await,
        "manual flush failure was never retried"
    );
    assert_eq!(manager.pending_count(), 0);

    manager.shutdown().await;
}

// =============================================================================
// Connectivity
// =============================================================================

#[tokio::test]
async fn offline_flushes_are_no_ops() {
    let remote = Arc::new(MockRemoteStore::new());
    let flag = Arc::new(ConnectivityFlag::new(false));
    let manager = manager_with(
        manual_config(),
        remote.clone(),
        flag.clone(),
        Arc::new(MemoryStore::new()),
    )
    .await;

    manager.enqueue(stats_op("u1", 1)).await.unwrap();
    manager.enqueue(stats_op("u2", 2)).await.unwrap();

    for _ in 0..5 {
        assert_eq!(manager.flush().await, FlushOutcome::Offline);
    }
    assert_eq!(remote.attempt_count(), 0);
    assert_eq!(manager.pending_count(), 2);
    assert!(manager
        .pending_operations()
        .await
        .iter()
        .all(|op| op.retry_count() == 0));

    flag.set_online(true);
    assert!(matches!(
        manager.flush().await,
        FlushOutcome::Committed { committed: 2, remaining: 0 }
    ));
}

#[tokio::test]
async fn timer_flushes_once_back_online() {
    let remote = Arc::new(MockRemoteStore::new());
    let flag = Arc::new(ConnectivityFlag::new(false));
    let manager = manager_with(
        QueueConfig::for_testing(),
        remote.clone(),
        flag.clone(),
        Arc::new(MemoryStore::new()),
    )
    .await;
    manager.start().unwrap();
    manager.enqueue(stats_op("u1", 1)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(remote.attempt_count(), 0);

    flag.set_online(true);
    assert!(wait_for(WAIT, || manager.is_idle()).await);
    assert_eq!(remote.committed_batches().len(), 1);

    manager.shutdown().await;
}

// =============================================================================
// Ordering
// =============================================================================

fn prioritized(doc: &str, priority: Priority) -> Operation {
    Operation::builder(OperationType::StatsUpdate, "player_stats")
        .document(doc)
        .priority(priority)
        .build()
        .unwrap()
}

#[tokio::test]
async fn batches_are_ordered_by_priority() {
    let remote = Arc::new(MockRemoteStore::new());
    let config = QueueConfig {
        max_batch_size: 2,
        ..manual_config()
    };
    let manager = manager(config, remote.clone()).await;

    manager.enqueue(prioritized("low", Priority::Low)).await.unwrap();
    manager.enqueue(prioritized("normal", Priority::Normal)).await.unwrap();
    manager.enqueue(prioritized("critical", Priority::Critical)).await.unwrap();
    manager.enqueue(prioritized("high", Priority::High)).await.unwrap();

    manager.flush().await;
    manager.flush().await;

    let docs: Vec<Vec<String>> = remote
        .committed_batches()
        .iter()
        .map(|b| b.iter().map(|w| w.document_id.clone()).collect())
        .collect();
    assert_eq!(
        docs,
        vec![vec!["critical", "high"], vec!["normal", "low"]]
    );
}

#[tokio::test]
async fn equal_priority_keeps_insertion_order() {
    let remote = Arc::new(MockRemoteStore::new());
    let manager = manager(manual_config(), remote.clone()).await;

    for doc in ["c", "a", "b"] {
        manager.enqueue(prioritized(doc, Priority::High)).await.unwrap();
    }
    manager.flush().await;

    let docs: Vec<String> = remote.committed_batches()[0]
        .iter()
        .map(|w| w.document_id.clone())
        .collect();
    assert_eq!(docs, vec!["c", "a", "b"]);
}

// =============================================================================
// Single flight
// =============================================================================

#[tokio::test]
async fn only_one_flush_in_flight() {
    let remote = Arc::new(MockRemoteStore::gated());
    let manager = Arc::new(manager(manual_config(), remote.clone()).await);
    manager.start().unwrap();
    manager.enqueue(stats_op("u1", 1)).await.unwrap();

    let first = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.flush().await })
    };
    assert!(wait_for(WAIT, || remote.active_commits() == 1).await);

    assert_eq!(manager.flush().await, FlushOutcome::AlreadyFlushing);
    for _ in 0..5 {
        assert!(manager.force_flush());
    }
    manager.enqueue(stats_op("u2", 2)).await.unwrap();

    remote.release(10);
    assert!(matches!(
        first.await.unwrap(),
        FlushOutcome::Committed { committed: 1, .. }
    ));

    manager.flush().await;
    assert!(wait_for(WAIT, || manager.is_idle()).await);
    assert_eq!(remote.max_concurrent_commits(), 1);
    // u1 once, u2 once: the forced requests never resubmitted anything
    assert_eq!(remote.attempt_count(), 2);

    manager.shutdown().await;
}

#[tokio::test]
async fn write_during_flight_is_sent_next_batch() {
    let remote = Arc::new(MockRemoteStore::gated());
    let manager = Arc::new(manager(manual_config(), remote.clone()).await);
    manager.enqueue(stats_op("u1", 1)).await.unwrap();

    let first = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.flush().await })
    };
    assert!(wait_for(WAIT, || remote.active_commits() == 1).await);

    manager.enqueue(stats_op("u1", 2)).await.unwrap();
    remote.release(1);
    first.await.unwrap();

    assert_eq!(manager.pending_count(), 1);
    remote.release(1);
    manager.flush().await;
    assert_eq!(remote.document("player_stats/u1").unwrap()["score"], 2);
}

// =============================================================================
// Durability
// =============================================================================

#[tokio::test]
async fn pending_operations_survive_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let remote = Arc::new(MockRemoteStore::new());

    let ids = {
        let store = Arc::new(SqliteStore::new(&path).await.unwrap());
        let offline = Arc::new(ConnectivityFlag::new(false));
        let manager = manager_with(manual_config(), remote.clone(), offline, store).await;

        let mut ids = Vec::new();
        for (doc, priority) in [("a", Priority::Low), ("b", Priority::Critical), ("c", Priority::Normal)] {
            ids.push(manager.enqueue(prioritized(doc, priority)).await.unwrap());
        }
        manager.shutdown().await;
        assert_eq!(manager.state(), ManagerState::Stopped);
        ids
    };
    assert_eq!(remote.attempt_count(), 0);

    let store = Arc::new(SqliteStore::new(&path).await.unwrap());
    let online = Arc::new(ConnectivityFlag::new(true));
    let manager = manager_with(manual_config(), remote.clone(), online, store).await;

    let restored: Vec<_> = manager
        .pending_operations()
        .await
        .iter()
        .map(|op| op.id().clone())
        .collect();
    assert_eq!(restored, ids);

    manager.flush().await;
    let docs: Vec<String> = remote.committed_batches()[0]
        .iter()
        .map(|w| w.document_id.clone())
        .collect();
    assert_eq!(docs, vec!["b", "c", "a"]);
    manager.shutdown().await;
}

#[tokio::test]
async fn retry_counts_survive_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let remote = Arc::new(MockRemoteStore::failing());

    {
        let store = Arc::new(SqliteStore::new(&path).await.unwrap());
        let manager = manager_with(
            manual_config(),
            remote.clone(),
            Arc::new(ConnectivityFlag::new(true)),
            store,
        )
        .await;
        let op = Operation::builder(OperationType::StatsUpdate, "player_stats")
            .document("u1")
            .max_retries(5)
            .build()
            .unwrap();
        manager.enqueue(op).await.unwrap();
        manager.flush().await;
        manager.flush().await;
        manager.shutdown().await;
    }

    let store = Arc::new(SqliteStore::new(&path).await.unwrap());
    let manager = manager_with(
        manual_config(),
        remote.clone(),
        Arc::new(ConnectivityFlag::new(true)),
        store,
    )
    .await;
    let pending = manager.pending_operations().await;
    assert_eq!(pending.len(), 1);
    // two manual flushes plus the final flush at shutdown
    assert_eq!(pending[0].retry_count(), 3);
    assert_eq!(pending[0].max_retries(), 5);
}

// =============================================================================
// Listeners and lifecycle
// =============================================================================

#[tokio::test]
async fn listener_sees_lifecycle_in_order() {
    let remote = Arc::new(MockRemoteStore::new());
    let manager = manager(manual_config(), remote).await;
    let listener = Arc::new(RecordingListener::default());
    let as_dyn: Arc<dyn QueueListener> = listener.clone();
    assert!(manager.add_listener(as_dyn.clone()));
    assert!(!manager.add_listener(as_dyn.clone()));

    let id = manager.enqueue(stats_op("u1", 1)).await.unwrap();
    manager.flush().await;
    manager.enqueue(stats_op("u2", 1)).await.unwrap();
    manager.clear().await;

    let events = listener.events();
    assert_eq!(events[0], Recorded::Queued(id.to_string()));
    assert_eq!(events[1], Recorded::FlushStarted(1));
    assert_eq!(events[2], Recorded::FlushCompleted(1, 0));
    assert!(matches!(events[3], Recorded::Queued(_)));
    assert_eq!(events[4], Recorded::Cleared);

    assert!(manager.remove_listener(&as_dyn));
    manager.enqueue(stats_op("u3", 1)).await.unwrap();
    assert_eq!(listener.events().len(), 5);
}

#[tokio::test]
async fn event_stream_reports_flushes() {
    let remote = Arc::new(MockRemoteStore::new());
    let manager = manager(manual_config(), remote).await;
    let mut events = manager.subscribe();

    manager.enqueue(stats_op("u1", 1)).await.unwrap();
    manager.flush().await;

    assert!(matches!(events.recv().await.unwrap(), QueueEvent::OperationQueued { .. }));
    assert!(matches!(events.recv().await.unwrap(), QueueEvent::FlushStarted { count: 1 }));
    assert!(matches!(
        events.recv().await.unwrap(),
        QueueEvent::FlushCompleted { committed: 1, failed: 0 }
    ));
}

#[tokio::test]
async fn shutdown_makes_final_attempt() {
    let remote = Arc::new(MockRemoteStore::new());
    let manager = manager(manual_config(), remote.clone()).await;
    manager.start().unwrap();

    manager.enqueue(stats_op("u1", 1)).await.unwrap();
    manager.shutdown().await;

    assert_eq!(remote.committed_batches().len(), 1);
    assert_eq!(manager.state(), ManagerState::Stopped);
    assert!(manager.enqueue(stats_op("u2", 1)).await.is_err());
}
