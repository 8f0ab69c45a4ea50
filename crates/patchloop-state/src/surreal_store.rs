//! SurrealDB-backed `OutcomeStore` and `PlanStore`
//!
//! One connection serves both tables. Writes go through a single async
//! mutex so concurrently finishing evaluations never race on the log.

use std::path::Path;

use async_trait::async_trait;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{StateError, StorageError};
use crate::migrations;
use crate::schema::{OutcomeRow, PlanRow};
use crate::storage_traits::{
    OutcomeRecord, OutcomeStats, OutcomeStore, PlanEntry, PlanStore, StorageResult,
};

const NAMESPACE: &str = "patchloop";
const DATABASE: &str = "learning";

fn backend(e: surrealdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// SurrealDB implementation of the learning and plan stores.
pub struct SurrealLearningStore {
    db: Surreal<Any>,
    write_lock: Mutex<()>,
}

impl SurrealLearningStore {
    /// Create an in-memory instance (tests, throwaway runs).
    pub async fn in_memory() -> crate::Result<Self> {
        Self::connect("mem://").await
    }

    /// Open (or create) an embedded on-disk store at `path`.
    pub async fn open(path: &Path) -> crate::Result<Self> {
        std::fs::create_dir_all(path).map_err(|e| {
            StateError::Connection(format!(
                "Failed to create database directory {}: {}",
                path.display(),
                e
            ))
        })?;
        let url = format!("surrealkv://{}", path.display());
        Self::connect(&url).await
    }

    /// Connect to any SurrealDB endpoint URL and initialise the schema.
    pub async fn connect(url: &str) -> crate::Result<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

        db.use_ns(NAMESPACE)
            .use_db(DATABASE)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db)
            .await
            .map_err(|e| StateError::SchemaSetup(e.to_string()))?;

        info!(url = %url, "SurrealLearningStore connected");
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    async fn outcome_rows(&self, error_type: &str) -> StorageResult<Vec<OutcomeRow>> {
        let et = error_type.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM outcomes WHERE error_type = $et ORDER BY timestamp ASC")
            .bind(("et", et))
            .await
            .map_err(backend)?;
        res.take(0).map_err(backend)
    }
}

#[async_trait]
impl OutcomeStore for SurrealLearningStore {
    async fn append(&self, record: OutcomeRecord) -> StorageResult<()> {
        record.validate()?;
        let _guard = self.write_lock.lock().await;

        debug!(error_type = %record.error_type, action = %record.action, "appending outcome");
        let _created: Option<OutcomeRow> = self
            .db
            .create("outcomes")
            .content(OutcomeRow::from(record))
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn query(&self, error_type: &str) -> StorageResult<OutcomeStats> {
        let records: Vec<OutcomeRecord> = self
            .outcome_rows(error_type)
            .await?
            .into_iter()
            .map(OutcomeRecord::from)
            .collect();
        Ok(OutcomeStats::from_records(error_type, records.iter()))
    }

    async fn records(&self, error_type: &str) -> StorageResult<Vec<OutcomeRecord>> {
        Ok(self
            .outcome_rows(error_type)
            .await?
            .into_iter()
            .map(OutcomeRecord::from)
            .collect())
    }
}

#[async_trait]
impl PlanStore for SurrealLearningStore {
    async fn get(&self, signature: &str) -> StorageResult<Option<PlanEntry>> {
        let sig = signature.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM plans WHERE signature = $sig")
            .bind(("sig", sig))
            .await
            .map_err(backend)?;
        let rows: Vec<PlanRow> = res.take(0).map_err(backend)?;
        Ok(rows.into_iter().next().map(PlanEntry::from))
    }

    async fn put(&self, entry: PlanEntry) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        let sig = entry.signature.clone();

        self.db
            .query("DELETE plans WHERE signature = $sig")
            .bind(("sig", sig))
            .await
            .map_err(backend)?;

        let _created: Option<PlanRow> = self
            .db
            .create("plans")
            .content(PlanRow::from(entry))
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn remove(&self, signature: &str) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        let sig = signature.to_string();
        self.db
            .query("DELETE plans WHERE signature = $sig")
            .bind(("sig", sig))
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn list(&self) -> StorageResult<Vec<PlanEntry>> {
        let mut res = self
            .db
            .query("SELECT * FROM plans ORDER BY signature ASC")
            .await
            .map_err(backend)?;
        let rows: Vec<PlanRow> = res.take(0).map_err(backend)?;
        Ok(rows.into_iter().map(PlanEntry::from).collect())
    }
}
