//! Convenience builders for common domain writes.
//!
//! Each helper pre-fills type, priority, target and write mode; the result
//! is an ordinary [`Operation`] for [`QueueManager::enqueue`](crate::QueueManager::enqueue).
//!
//! | Builder | Type | Priority | Target | Mode |
//! |---------|------|----------|--------|------|
//! | [`leaderboard_update`] | LeaderboardUpdate | High | `leaderboard/{uid}` | merge |
//! | [`player_stats`] | StatsUpdate | High | `player_stats/{uid}` | merge |
//! | [`share_record`] | ShareRecord | High | `shared_items/<auto>` | overwrite |
//! | [`sharded_increment`] | CounterIncrement | Normal | `counter_shards/{counter}_shard_{n}` | merge |
//! | [`state_save`] | StateSave | Critical | `game_state/{uid}` | overwrite |
//! | [`achievement_unlock`] | AchievementUnlock | Critical | `achievements/{uid}_{id}` | merge |
//!
//! # Sharded counters
//!
//! A hot counter spread over N shard documents: each increment lands on a
//! shard picked uniformly at random, so concurrent writers rarely contend
//! on one document. The true total is the sum over all shards and is
//! computed by the reader, not by the queue.

use crate::error::{QueueError, Result};
use crate::operation::{FieldValue, Operation, OperationType, Priority};
use rand::Rng;
use serde::{Deserialize, Serialize};

pub const LEADERBOARD_COLLECTION: &str = "leaderboard";
pub const PLAYER_STATS_COLLECTION: &str = "player_stats";
pub const SHARED_ITEMS_COLLECTION: &str = "shared_items";
pub const COUNTER_SHARDS_COLLECTION: &str = "counter_shards";
pub const GAME_STATE_COLLECTION: &str = "game_state";
pub const ACHIEVEMENTS_COLLECTION: &str = "achievements";

/// Shards per counter unless told otherwise.
pub const DEFAULT_SHARD_COUNT: u32 = 10;

/// Player statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerStats {
    pub health: i64,
    pub shield: i64,
    pub score: i64,
    /// Client-computed integrity hash, checked server-side.
    pub security_hash: Option<String>,
}

/// Something a user shares publicly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareRecord {
    pub user_id: String,
    pub user_name: String,
    pub photo_url: Option<String>,
    pub title: String,
}

/// Upsert the user's leaderboard entry.
pub fn leaderboard_update(user_id: &str, display_name: &str, score: i64) -> Result<Operation> {
    Operation::builder(OperationType::LeaderboardUpdate, LEADERBOARD_COLLECTION)
        .document(user_id)
        .priority(Priority::High)
        .owner(user_id)
        .field("userId", user_id)
        .field("displayName", display_name)
        .field("score", score)
        .field("isBot", false)
        .build()
}

/// Upsert the user's statistics snapshot.
pub fn player_stats(user_id: &str, stats: &PlayerStats) -> Result<Operation> {
    let mut builder = Operation::builder(OperationType::StatsUpdate, PLAYER_STATS_COLLECTION)
        .document(user_id)
        .priority(Priority::High)
        .owner(user_id)
        .field("userId", user_id)
        .field("health", stats.health)
        .field("shield", stats.shield)
        .field("score", stats.score);
    if let Some(hash) = &stats.security_hash {
        builder = builder.field("securityHash", hash.as_str());
    }
    builder.build()
}

/// Create a new shared item with a remote-allocated id.
pub fn share_record(record: &ShareRecord) -> Result<Operation> {
    let photo = record
        .photo_url
        .as_deref()
        .map(FieldValue::from)
        .unwrap_or(FieldValue::Value(serde_json::Value::Null));

    Operation::builder(OperationType::ShareRecord, SHARED_ITEMS_COLLECTION)
        .priority(Priority::High)
        .merge(false)
        .owner(record.user_id.as_str())
        .field("userId", record.user_id.as_str())
        .field("userName", record.user_name.as_str())
        .field("photoUrl", photo)
        .field("title", record.title.as_str())
        .field("likes", 0)
        .server_timestamp("timestamp")
        .build()
}

/// Document id of one counter shard.
pub fn shard_document_id(counter_id: &str, shard: u32) -> String {
    format!("{}_shard_{}", counter_id, shard)
}

/// Increment `counter_id` by one on a random shard out of
/// [`DEFAULT_SHARD_COUNT`].
pub fn sharded_increment<R: Rng + ?Sized>(counter_id: &str, rng: &mut R) -> Result<Operation> {
    sharded_increment_with(counter_id, DEFAULT_SHARD_COUNT, rng)
}

/// Increment `counter_id` by one on a random shard out of `shards`.
pub fn sharded_increment_with<R: Rng + ?Sized>(
    counter_id: &str,
    shards: u32,
    rng: &mut R,
) -> Result<Operation> {
    if shards == 0 {
        return Err(QueueError::invalid("shard count must be at least 1"));
    }
    let shard = rng.gen_range(0..shards);

    Operation::builder(OperationType::CounterIncrement, COUNTER_SHARDS_COLLECTION)
        .document(shard_document_id(counter_id, shard))
        .priority(Priority::Normal)
        .field("counterId", counter_id)
        .field("shard", shard)
        .increment("count", 1)
        .build()
}

/// Overwrite the user's saved state with the fields of `state`.
///
/// `state` must be a JSON object.
pub fn state_save(user_id: &str, state: serde_json::Value) -> Result<Operation> {
    let serde_json::Value::Object(fields) = state else {
        return Err(QueueError::invalid("saved state must be a JSON object"));
    };

    Operation::builder(OperationType::StateSave, GAME_STATE_COLLECTION)
        .document(user_id)
        .priority(Priority::Critical)
        .merge(false)
        .owner(user_id)
        .fields(fields.into_iter().map(|(k, v)| (k, FieldValue::Value(v))))
        .build()
}

/// Record an unlocked achievement.
pub fn achievement_unlock(user_id: &str, achievement_id: &str) -> Result<Operation> {
    Operation::builder(OperationType::AchievementUnlock, ACHIEVEMENTS_COLLECTION)
        .document(format!("{}_{}", user_id, achievement_id))
        .priority(Priority::Critical)
        .owner(user_id)
        .field("userId", user_id)
        .field("achievementId", achievement_id)
        .server_timestamp("unlockedAt")
        .build()
}
