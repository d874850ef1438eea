// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Versioned record codec for persisted operations.
//!
//! Every persisted operation is a [`StoredRecord`]: a schema version plus a
//! JSON body. Decoding dispatches on the version and migrates older shapes
//! to the current [`Operation`] in memory; the next save rewrites them at
//! [`CURRENT_SCHEMA_VERSION`].
//!
//! # Schema versions
//!
//! | Version | Shape |
//! |---------|-------|
//! | 1 | camelCase legacy record: `collection`, `documentId`, `userId`, `merge`, epoch-millis `createdAt`/`lastAttempt` (0 = never), UPPER_SNAKE enum names, plain JSON `data` |
//! | 2 | snake_case record with typed payload values (`server_timestamp`, `increment`) and RFC 3339 timestamps |
//!
//! A record that cannot be decoded is skipped by [`decode_all`] with a
//! warning, so one corrupt row never hides the rest of the queue.

use crate::error::{QueueError, Result};
use crate::operation::{FieldValue, Operation, OperationId, OperationType, Payload, Priority, Target};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Schema version written by this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Legacy schema version (camelCase, untyped payload).
pub const LEGACY_SCHEMA_VERSION: u32 = 1;

/// One persisted operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub schema_version: u32,
    pub body: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordV2 {
    id: String,
    #[serde(rename = "type")]
    op_type: OperationType,
    priority: Priority,
    collection_path: String,
    document_id: Option<String>,
    retry_count: u32,
    max_retries: u32,
    created_at: DateTime<Utc>,
    last_attempt_at: Option<DateTime<Utc>>,
    owner_id: Option<String>,
    merge_on_write: bool,
    payload: Payload,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordV1 {
    id: String,
    #[serde(rename = "type")]
    op_type: String,
    priority: String,
    collection: String,
    #[serde(default)]
    document_id: Option<String>,
    #[serde(default)]
    retry_count: u32,
    #[serde(default = "default_legacy_max_retries")]
    max_retries: u32,
    created_at: i64,
    #[serde(default)]
    last_attempt: i64,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default = "default_legacy_merge")]
    merge: bool,
    #[serde(default)]
    data: serde_json::Map<String, serde_json::Value>,
}

fn default_legacy_max_retries() -> u32 {
    crate::operation::DEFAULT_MAX_RETRIES
}

fn default_legacy_merge() -> bool {
    true
}

/// Encode an operation at the current schema version.
pub fn encode(op: &Operation) -> Result<StoredRecord> {
    let record = RecordV2 {
        id: op.id.as_str().to_string(),
        op_type: op.op_type.clone(),
        priority: op.priority,
        collection_path: op.target.collection_path.clone(),
        document_id: op.target.document_id.clone(),
        retry_count: op.retry_count,
        max_retries: op.max_retries,
        created_at: op.created_at,
        last_attempt_at: op.last_attempt_at,
        owner_id: op.owner_id.clone(),
        merge_on_write: op.merge_on_write,
        payload: op.payload.clone(),
    };
    Ok(StoredRecord {
        schema_version: CURRENT_SCHEMA_VERSION,
        body: serde_json::to_string(&record)?,
    })
}

/// Decode a record, migrating legacy versions.
pub fn decode(record: &StoredRecord) -> Result<Operation> {
    let op = match record.schema_version {
        CURRENT_SCHEMA_VERSION => {
            let v2: RecordV2 = serde_json::from_str(&record.body)?;
            from_v2(v2)
        }
        LEGACY_SCHEMA_VERSION => {
            let v1: RecordV1 = serde_json::from_str(&record.body)?;
            migrate_v1(v1)?
        }
        found => {
            return Err(QueueError::UnsupportedSchema {
                found,
                supported: CURRENT_SCHEMA_VERSION,
            })
        }
    };
    op.validate()?;
    Ok(op)
}

/// Decode every record, skipping (and logging) the ones that fail.
pub fn decode_all(records: &[StoredRecord]) -> Vec<Operation> {
    let mut ops = Vec::with_capacity(records.len());
    for (index, record) in records.iter().enumerate() {
        match decode(record) {
            Ok(op) => ops.push(op),
            Err(e) => {
                warn!(
                    index,
                    schema_version = record.schema_version,
                    error = %e,
                    "Skipping undecodable persisted operation"
                );
                crate::metrics::record_decode_skipped(record.schema_version);
            }
        }
    }
    ops
}

fn from_v2(v2: RecordV2) -> Operation {
    Operation {
        id: OperationId::from_raw(v2.id),
        op_type: v2.op_type,
        priority: v2.priority,
        target: Target::new(v2.collection_path, v2.document_id),
        payload: v2.payload,
        merge_on_write: v2.merge_on_write,
        owner_id: v2.owner_id,
        retry_count: v2.retry_count,
        max_retries: v2.max_retries,
        created_at: v2.created_at,
        last_attempt_at: v2.last_attempt_at,
    }
}

fn migrate_v1(v1: RecordV1) -> Result<Operation> {
    let created_at = millis_to_datetime(v1.created_at)?;
    let last_attempt_at = if v1.last_attempt == 0 {
        None
    } else {
        Some(millis_to_datetime(v1.last_attempt)?)
    };
    let payload = v1
        .data
        .into_iter()
        .map(|(k, v)| (k, FieldValue::Value(v)))
        .collect();

    Ok(Operation {
        id: OperationId::from_raw(v1.id),
        op_type: legacy_type(&v1.op_type),
        priority: legacy_priority(&v1.priority)?,
        target: Target::new(v1.collection, v1.document_id.filter(|d| !d.is_empty())),
        payload,
        merge_on_write: v1.merge,
        owner_id: v1.user_id.filter(|u| !u.is_empty()),
        retry_count: v1.retry_count,
        max_retries: v1.max_retries,
        created_at,
        last_attempt_at,
    })
}

fn legacy_type(name: &str) -> OperationType {
    match name {
        "LEADERBOARD_UPDATE" => OperationType::LeaderboardUpdate,
        "STATS_UPDATE" => OperationType::StatsUpdate,
        "SONG_SHARE" => OperationType::ShareRecord,
        "LIKE_INCREMENT" => OperationType::CounterIncrement,
        "GAME_STATE_SAVE" => OperationType::StateSave,
        "ACHIEVEMENT_UNLOCK" => OperationType::AchievementUnlock,
        other => OperationType::Custom(other.to_ascii_lowercase()),
    }
}

fn legacy_priority(name: &str) -> Result<Priority> {
    match name {
        "LOW" => Ok(Priority::Low),
        "NORMAL" => Ok(Priority::Normal),
        "HIGH" => Ok(Priority::High),
        "CRITICAL" => Ok(Priority::Critical),
        other => Err(QueueError::invalid(format!(
            "unknown legacy priority '{}'",
            other
        ))),
    }
}

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| QueueError::invalid(format!("timestamp {} out of range", millis)))
}
