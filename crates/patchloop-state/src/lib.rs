//! Patchloop-State: persistence for repair learning and plan memoization
//!
//! This crate owns every byte Patchloop keeps between runs:
//!
//! - the append-only outcome log that feeds the action bandit
//! - the plan store backing the plan cache
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: append-only integrity and cheap aggregate queries.
//!
//! ## Key Components
//!
//! - `OutcomeStore` / `PlanStore`: backend-agnostic async traits
//! - `SurrealLearningStore`: SurrealDB implementation (embedded or remote)
//! - `fakes`: in-memory implementations for tests

mod error;
pub mod fakes;
mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use storage_traits::{
    ActionStats, ContentDigest, OutcomeRecord, OutcomeStats, OutcomeStore, PlanEntry, PlanStore,
    StorageResult,
};
pub use surreal_store::SurrealLearningStore;

/// Result type for patchloop-state connection and schema operations
pub type Result<T> = std::result::Result<T, StateError>;
