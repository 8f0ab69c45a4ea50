//! Error types for patchloop-state

use thiserror::Error;

/// Errors raised while opening or preparing the learning store
#[derive(Error, Debug)]
pub enum StateError {
    /// The endpoint could not be reached or the namespace selected
    #[error("learning store unavailable: {0}")]
    Connection(String),

    #[error("learning store query failed: {0}")]
    Query(String),

    #[error("learning store payload invalid: {0}")]
    Serialization(String),

    /// Outcome or plan tables could not be defined
    #[error("learning store schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors surfaced through the storage traits
#[derive(Error, Debug)]
pub enum StorageError {
    /// The backend rejected or failed an operation
    #[error("storage backend error: {0}")]
    Backend(String),

    /// A stored payload could not be (de)serialized
    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A digest string was not 64 lowercase hex characters
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// A record failed basic shape checks before being written
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}
