//! Storage trait definitions for Patchloop
//!
//! These traits define the two persistence seams the orchestration engine
//! depends on:
//! - `OutcomeStore`: append-only `(error_type, action, success, timestamp)` log
//! - `PlanStore`: goal-signature to step-decomposition memo
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// ContentDigest
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// OutcomeStore: append-only learning log
// ---------------------------------------------------------------------------

/// One observed outcome of applying a repair action to an error type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    /// Classified error type (e.g. "test", "build")
    pub error_type: String,
    /// Repair action that was attempted
    pub action: String,
    /// Whether the step it drove succeeded
    pub success: bool,
    /// When the outcome was observed
    pub timestamp: DateTime<Utc>,
}

impl OutcomeRecord {
    /// Create a record stamped with the current time
    pub fn new(error_type: impl Into<String>, action: impl Into<String>, success: bool) -> Self {
        Self {
            error_type: error_type.into(),
            action: action.into(),
            success,
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn validate(&self) -> StorageResult<()> {
        if self.error_type.trim().is_empty() {
            return Err(StorageError::InvalidRecord(
                "error_type must not be empty".to_string(),
            ));
        }
        if self.action.trim().is_empty() {
            return Err(StorageError::InvalidRecord(
                "action must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Success/failure counts for one action under one error type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionStats {
    pub action: String,
    pub successes: u64,
    pub failures: u64,
}

impl ActionStats {
    /// Total trials recorded for this action.
    pub fn trials(&self) -> u64 {
        self.successes + self.failures
    }
}

/// Aggregate view of the outcome log for one error type.
///
/// `actions` is sorted by action name so equal logs always aggregate to
/// equal stats regardless of append order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeStats {
    pub error_type: String,
    pub actions: Vec<ActionStats>,
}

impl OutcomeStats {
    /// Fold raw records into per-action counts, ignoring other error types.
    pub fn from_records<'a>(
        error_type: &str,
        records: impl IntoIterator<Item = &'a OutcomeRecord>,
    ) -> Self {
        let mut counts: BTreeMap<String, (u64, u64)> = BTreeMap::new();
        for record in records {
            if record.error_type != error_type {
                continue;
            }
            let entry = counts.entry(record.action.clone()).or_default();
            if record.success {
                entry.0 += 1;
            } else {
                entry.1 += 1;
            }
        }

        Self {
            error_type: error_type.to_string(),
            actions: counts
                .into_iter()
                .map(|(action, (successes, failures))| ActionStats {
                    action,
                    successes,
                    failures,
                })
                .collect(),
        }
    }

    /// Total trials across all actions.
    pub fn total(&self) -> u64 {
        self.actions.iter().map(ActionStats::trials).sum()
    }

    /// Counts for one action, if it has ever been tried.
    pub fn action(&self, action: &str) -> Option<&ActionStats> {
        self.actions.iter().find(|a| a.action == action)
    }
}

/// Append-only outcome log.
///
/// Guarantees:
/// - `append` never rewrites or removes an earlier record.
/// - `query(error_type)` reflects every record appended before it returned.
#[async_trait]
pub trait OutcomeStore: Send + Sync {
    /// Append one outcome record.
    async fn append(&self, record: OutcomeRecord) -> StorageResult<()>;

    /// Aggregate counts for an error type. Unknown types yield empty stats.
    async fn query(&self, error_type: &str) -> StorageResult<OutcomeStats>;

    /// Raw records for an error type, oldest first.
    async fn records(&self, error_type: &str) -> StorageResult<Vec<OutcomeRecord>>;
}

// ---------------------------------------------------------------------------
// PlanStore: plan cache backing store
// ---------------------------------------------------------------------------

/// A memoized goal decomposition.
///
/// `steps` is an opaque JSON document owned by the planner; the store never
/// interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    /// Canonical goal signature (the cache key)
    pub signature: String,
    /// Original goal text, kept for audit
    pub goal_text: String,
    /// Serialized step decomposition
    pub steps: serde_json::Value,
    /// Downstream failures attributed to this plan
    pub failures: u32,
    /// When the entry was first stored
    pub created_at: DateTime<Utc>,
}

impl PlanEntry {
    pub fn new(
        signature: impl Into<String>,
        goal_text: impl Into<String>,
        steps: serde_json::Value,
    ) -> Self {
        Self {
            signature: signature.into(),
            goal_text: goal_text.into(),
            steps,
            failures: 0,
            created_at: Utc::now(),
        }
    }
}

/// Keyed plan storage.
///
/// Semantics:
/// - `put` replaces any entry with the same signature.
/// - `remove` is a no-op for unknown signatures.
/// - `list` returns entries ordered by signature.
#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn get(&self, signature: &str) -> StorageResult<Option<PlanEntry>>;

    async fn put(&self, entry: PlanEntry) -> StorageResult<()>;

    async fn remove(&self, signature: &str) -> StorageResult<()>;

    async fn list(&self) -> StorageResult<Vec<PlanEntry>>;
}
