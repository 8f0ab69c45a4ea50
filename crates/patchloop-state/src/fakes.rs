//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryOutcomeStore` and `MemoryPlanStore` that satisfy the
//! trait contracts without any external dependencies.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::storage_traits::*;

fn poisoned<T>(_: T) -> StorageError {
    StorageError::Backend("in-memory store lock poisoned".to_string())
}

// ---------------------------------------------------------------------------
// MemoryOutcomeStore
// ---------------------------------------------------------------------------

/// In-memory outcome log backed by a `Vec<OutcomeRecord>`.
#[derive(Debug, Default)]
pub struct MemoryOutcomeStore {
    records: Mutex<Vec<OutcomeRecord>>,
}

impl MemoryOutcomeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records appended so far (all error types).
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl OutcomeStore for MemoryOutcomeStore {
    async fn append(&self, record: OutcomeRecord) -> StorageResult<()> {
        record.validate()?;
        self.records.lock().map_err(poisoned)?.push(record);
        Ok(())
    }

    async fn query(&self, error_type: &str) -> StorageResult<OutcomeStats> {
        let records = self.records.lock().map_err(poisoned)?;
        Ok(OutcomeStats::from_records(error_type, records.iter()))
    }

    async fn records(&self, error_type: &str) -> StorageResult<Vec<OutcomeRecord>> {
        let records = self.records.lock().map_err(poisoned)?;
        Ok(records
            .iter()
            .filter(|r| r.error_type == error_type)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryPlanStore
// ---------------------------------------------------------------------------

/// In-memory plan store backed by a `BTreeMap<signature, PlanEntry>`.
#[derive(Debug, Default)]
pub struct MemoryPlanStore {
    entries: Mutex<BTreeMap<String, PlanEntry>>,
}

impl MemoryPlanStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PlanStore for MemoryPlanStore {
    async fn get(&self, signature: &str) -> StorageResult<Option<PlanEntry>> {
        Ok(self.entries.lock().map_err(poisoned)?.get(signature).cloned())
    }

    async fn put(&self, entry: PlanEntry) -> StorageResult<()> {
        self.entries
            .lock()
            .map_err(poisoned)?
            .insert(entry.signature.clone(), entry);
        Ok(())
    }

    async fn remove(&self, signature: &str) -> StorageResult<()> {
        self.entries.lock().map_err(poisoned)?.remove(signature);
        Ok(())
    }

    async fn list(&self) -> StorageResult<Vec<PlanEntry>> {
        Ok(self
            .entries
            .lock()
            .map_err(poisoned)?
            .values()
            .cloned()
            .collect())
    }
}
