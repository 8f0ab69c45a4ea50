//! SurrealDB schema initialization
//!
//! Defines the `outcomes` and `plans` tables with their indexes.
//! Safe to call on every connection (definitions are idempotent).

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all Patchloop tables in SurrealDB
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing Patchloop SurrealDB schema");

    init_outcomes_table(db).await?;
    init_plans_table(db).await?;

    info!("Patchloop schema initialization complete");
    Ok(())
}

/// Initialize `outcomes` table
///
/// Schema:
/// ```text
/// TABLE outcomes {
///   error_type: STRING (indexed)
///   action:     STRING
///   success:    BOOL
///   timestamp:  DATETIME
/// }
/// ```
///
/// Rows are never updated or deleted.
async fn init_outcomes_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing outcomes table");

    let sql = r#"
        DEFINE TABLE outcomes AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX idx_outcome_error_type ON TABLE outcomes COLUMNS error_type;
        DEFINE INDEX idx_outcome_pair ON TABLE outcomes COLUMNS error_type, action;
    "#;

    db.query(sql).await?;
    Ok(())
}

/// Initialize `plans` table
///
/// Schema:
/// ```text
/// TABLE plans {
///   signature:  STRING (unique)
///   goal_text:  STRING
///   steps:      ARRAY | OBJECT
///   failures:   INT
///   created_at: DATETIME
/// }
/// ```
async fn init_plans_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing plans table");

    let sql = r#"
        DEFINE TABLE plans AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete FULL;

        DEFINE INDEX idx_plan_signature ON TABLE plans COLUMNS signature UNIQUE;
    "#;

    db.query(sql).await?;
    Ok(())
}
