// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Operation: one intended remote write, buffered client-side.
//!
//! Operations are built with [`OperationBuilder`], which validates the
//! target and payload. After construction only the retry counters change
//! (`retry_count`, `last_attempt_at`) and only from inside the crate.
//!
//! # Dedup key
//!
//! `(type, collection_path, document_id)` identifies "the latest intended
//! write" for a logical target. Operations without a `document_id` create a
//! new document on every commit and therefore have no dedup key.

use crate::error::{QueueError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Attempts allowed before an operation is discarded.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Ordered mapping of field name to value.
pub type Payload = BTreeMap<String, FieldValue>;

/// Opaque unique operation identifier.
///
/// Generated as a UUIDv7, so ids are time-ordered and collision-free.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    /// Generate a fresh id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    /// Wrap an existing id (used when rehydrating persisted records).
    pub(crate) fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Domain label for an operation. Not interpreted by the queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    LeaderboardUpdate,
    StatsUpdate,
    ShareRecord,
    CounterIncrement,
    StateSave,
    AchievementUnlock,
    /// Application-defined label.
    Custom(String),
}

impl OperationType {
    /// Stable label for logs and metrics.
    pub fn as_str(&self) -> &str {
        match self {
            Self::LeaderboardUpdate => "leaderboard_update",
            Self::StatsUpdate => "stats_update",
            Self::ShareRecord => "share_record",
            Self::CounterIncrement => "counter_increment",
            Self::StateSave => "state_save",
            Self::AchievementUnlock => "achievement_unlock",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority. Higher priorities are flushed first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// May be lost without harm (analytics).
    Low = 0,
    #[default]
    Normal = 1,
    /// Important user actions (shares, likes).
    High = 2,
    /// Must not be lost (purchases, achievements).
    Critical = 3,
}

impl Priority {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Where an operation writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub collection_path: String,
    /// `None` = create a new document with a remote-allocated id.
    pub document_id: Option<String>,
}

impl Target {
    pub fn new(collection_path: impl Into<String>, document_id: Option<String>) -> Self {
        Self {
            collection_path: collection_path.into(),
            document_id,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.document_id {
            Some(doc) => write!(f, "{}/{}", self.collection_path, doc),
            None => write!(f, "{}/<auto>", self.collection_path),
        }
    }
}

/// A payload value.
///
/// `ServerTimestamp` and `Increment` are markers resolved by the remote
/// store at commit time, not by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Value(serde_json::Value),
    ServerTimestamp,
    Increment(i64),
}

impl FieldValue {
    /// Whether the remote store computes the final value.
    pub fn is_server_computed(&self) -> bool {
        !matches!(self, Self::Value(_))
    }
}

impl From<serde_json::Value> for FieldValue {
    fn from(v: serde_json::Value) -> Self {
        Self::Value(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Value(serde_json::Value::from(v))
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Value(serde_json::Value::from(v))
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Value(serde_json::Value::from(v))
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        Self::Value(serde_json::Value::from(v))
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        Self::Value(serde_json::Value::from(v))
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Value(serde_json::Value::from(v))
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Value(serde_json::Value::from(v))
    }
}

/// Deduplication key: at most one pending operation per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey<'a> {
    pub op_type: &'a OperationType,
    pub collection_path: &'a str,
    pub document_id: &'a str,
}

/// One intended remote write.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub(crate) id: OperationId,
    pub(crate) op_type: OperationType,
    pub(crate) priority: Priority,
    pub(crate) target: Target,
    pub(crate) payload: Payload,
    pub(crate) merge_on_write: bool,
    pub(crate) owner_id: Option<String>,
    pub(crate) retry_count: u32,
    pub(crate) max_retries: u32,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) last_attempt_at: Option<DateTime<Utc>>,
}

impl Operation {
    /// Start building an operation against `collection_path`.
    pub fn builder(op_type: OperationType, collection_path: impl Into<String>) -> OperationBuilder {
        OperationBuilder::new(op_type, collection_path)
    }

    pub fn id(&self) -> &OperationId {
        &self.id
    }

    pub fn op_type(&self) -> &OperationType {
        &self.op_type
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn merge_on_write(&self) -> bool {
        self.merge_on_write
    }

    pub fn owner_id(&self) -> Option<&str> {
        self.owner_id.as_deref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.last_attempt_at
    }

    /// Dedup key, or `None` for auto-id creates.
    pub fn dedup_key(&self) -> Option<DedupKey<'_>> {
        self.target.document_id.as_deref().map(|doc| DedupKey {
            op_type: &self.op_type,
            collection_path: &self.target.collection_path,
            document_id: doc,
        })
    }

    /// Whether another operation targets the same logical write.
    pub fn supersedes(&self, other: &Operation) -> bool {
        match (self.dedup_key(), other.dedup_key()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Whether the retry budget is spent.
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Record a failed attempt.
    pub(crate) fn record_attempt(&mut self, now: DateTime<Utc>) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_attempt_at = Some(now);
    }

    pub(crate) fn set_owner_if_absent(&mut self, owner: Option<String>) {
        if self.owner_id.is_none() {
            self.owner_id = owner;
        }
    }

    /// Insert `value` under `field` unless the caller already set it.
    pub(crate) fn stamp_field(&mut self, field: &str, value: FieldValue) {
        self.payload.entry(field.to_string()).or_insert(value);
    }

    /// Fold the pending increments of a superseded operation into this one.
    ///
    /// Plain fields stay last-writer-wins; a newer plain value for a counter
    /// field replaces the counter.
    pub(crate) fn absorb_increments(&mut self, older: &Operation) {
        for (field, value) in &older.payload {
            let FieldValue::Increment(prev) = value else {
                continue;
            };
            match self.payload.get_mut(field) {
                Some(FieldValue::Increment(current)) => {
                    *current = current.saturating_add(*prev);
                }
                Some(_) => {}
                None => {
                    self.payload
                        .insert(field.clone(), FieldValue::Increment(*prev));
                }
            }
        }
    }

    /// Check structural validity.
    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().is_empty() {
            return Err(QueueError::invalid("operation id is empty"));
        }
        validate_collection_path(&self.target.collection_path)?;
        if let Some(doc) = &self.target.document_id {
            if doc.trim().is_empty() {
                return Err(QueueError::invalid("document id is empty"));
            }
            if doc.contains('/') {
                return Err(QueueError::invalid(format!(
                    "document id '{}' must not contain '/'",
                    doc
                )));
            }
        }
        if let Some(field) = self.payload.keys().find(|k| k.trim().is_empty()) {
            return Err(QueueError::invalid(format!(
                "payload field name '{}' is empty",
                field
            )));
        }
        if self.max_retries == 0 {
            return Err(QueueError::invalid("max_retries must be at least 1"));
        }
        Ok(())
    }
}

/// A collection path has an odd number of non-empty segments
/// (`users`, `users/u1/scores`).
fn validate_collection_path(path: &str) -> Result<()> {
    if path.trim().is_empty() {
        return Err(QueueError::invalid("collection path is empty"));
    }
    let segments: Vec<&str> = path.split('/').collect();
    if segments.iter().any(|s| s.trim().is_empty()) {
        return Err(QueueError::invalid(format!(
            "collection path '{}' has an empty segment",
            path
        )));
    }
    if segments.len() % 2 == 0 {
        return Err(QueueError::invalid(format!(
            "'{}' addresses a document, not a collection",
            path
        )));
    }
    Ok(())
}

/// Fluent builder for [`Operation`].
///
/// ```rust
/// use sync_queue::{Operation, OperationType, Priority};
///
/// let op = Operation::builder(OperationType::StatsUpdate, "player_stats")
///     .document("u1")
///     .priority(Priority::High)
///     .field("score", 25)
///     .build()
///     .unwrap();
/// assert_eq!(op.target().document_id.as_deref(), Some("u1"));
/// ```
#[derive(Debug, Clone)]
pub struct OperationBuilder {
    op_type: OperationType,
    priority: Priority,
    collection_path: String,
    document_id: Option<String>,
    payload: Payload,
    merge_on_write: bool,
    owner_id: Option<String>,
    max_retries: u32,
}

impl OperationBuilder {
    pub fn new(op_type: OperationType, collection_path: impl Into<String>) -> Self {
        Self {
            op_type,
            priority: Priority::Normal,
            collection_path: collection_path.into(),
            document_id: None,
            payload: Payload::new(),
            merge_on_write: true,
            owner_id: None,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Upsert into a specific document instead of creating a new one.
    pub fn document(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.payload.insert(name.into(), value.into());
        self
    }

    pub fn fields<K, V>(mut self, fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<FieldValue>,
    {
        for (k, v) in fields {
            self.payload.insert(k.into(), v.into());
        }
        self
    }

    /// Atomic increment resolved by the remote store.
    pub fn increment(mut self, name: impl Into<String>, by: i64) -> Self {
        self.payload.insert(name.into(), FieldValue::Increment(by));
        self
    }

    /// Timestamp resolved by the remote store.
    pub fn server_timestamp(mut self, name: impl Into<String>) -> Self {
        self.payload.insert(name.into(), FieldValue::ServerTimestamp);
        self
    }

    /// `true` merges into the existing document, `false` overwrites it.
    pub fn merge(mut self, merge: bool) -> Self {
        self.merge_on_write = merge;
        self
    }

    pub fn owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Validate and produce the operation.
    pub fn build(self) -> Result<Operation> {
        let op = Operation {
            id: OperationId::generate(),
            op_type: self.op_type,
            priority: self.priority,
            target: Target::new(self.collection_path, self.document_id),
            payload: self.payload,
            merge_on_write: self.merge_on_write,
            owner_id: self.owner_id,
            retry_count: 0,
            max_retries: self.max_retries,
            created_at: Utc::now(),
            last_attempt_at: None,
        };
        op.validate()?;
        Ok(op)
    }
}
