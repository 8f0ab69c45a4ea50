//! Row definitions for Patchloop SurrealDB tables
//!
//! Tables:
//! - outcomes: append-only learning log
//! - plans: plan cache entries keyed by goal signature

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage_traits::{OutcomeRecord, PlanEntry};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Outcome row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRow {
    /// SurrealDB record ID
    pub id: Option<surrealdb::sql::Thing>,
    pub error_type: String,
    pub action: String,
    pub success: bool,
    #[serde(with = "surreal_datetime")]
    pub timestamp: DateTime<Utc>,
}

impl From<OutcomeRecord> for OutcomeRow {
    fn from(record: OutcomeRecord) -> Self {
        Self {
            id: None,
            error_type: record.error_type,
            action: record.action,
            success: record.success,
            timestamp: record.timestamp,
        }
    }
}

impl From<OutcomeRow> for OutcomeRecord {
    fn from(row: OutcomeRow) -> Self {
        Self {
            error_type: row.error_type,
            action: row.action,
            success: row.success,
            timestamp: row.timestamp,
        }
    }
}

/// Plan row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRow {
    /// SurrealDB record ID
    pub id: Option<surrealdb::sql::Thing>,
    pub signature: String,
    pub goal_text: String,
    pub steps: serde_json::Value,
    pub failures: u32,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
}

impl From<PlanEntry> for PlanRow {
    fn from(entry: PlanEntry) -> Self {
        Self {
            id: None,
            signature: entry.signature,
            goal_text: entry.goal_text,
            steps: entry.steps,
            failures: entry.failures,
            created_at: entry.created_at,
        }
    }
}

impl From<PlanRow> for PlanEntry {
    fn from(row: PlanRow) -> Self {
        Self {
            signature: row.signature,
            goal_text: row.goal_text,
            steps: row.steps,
            failures: row.failures,
            created_at: row.created_at,
        }
    }
}
