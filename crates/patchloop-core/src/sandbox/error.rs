//! Error types for the sandbox module.

use std::path::PathBuf;

use crate::budget::BudgetExceeded;

/// Errors produced by the sandbox layer.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox setup failed after {attempts} attempt(s): {reason}")]
    SetupFailure { attempts: u32, reason: String },

    #[error("base snapshot missing or not a directory: {}", .0.display())]
    SnapshotMissing(PathBuf),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("subprocess refused by budget: {0}")]
    Budget(#[from] BudgetExceeded),

    #[error("invalid sandbox configuration: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Infrastructure failures end the run; everything else is local to one
    /// evaluation.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::SetupFailure { .. } | Self::SnapshotMissing(_))
    }
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;
