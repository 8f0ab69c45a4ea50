//! Domain-level error taxonomy for Patchloop.

use crate::budget::BudgetExceeded;
use crate::domain::step::StepState;
use crate::sandbox::SandboxError;

/// Errors produced while building or advancing a step plan.
#[derive(Debug, thiserror::Error)]
pub enum PlanningError {
    #[error("step {step_id}: invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        step_id: String,
        from: StepState,
        to: StepState,
    },

    #[error("step {step_id} depends on unknown step {missing}")]
    MissingDependency { step_id: String, missing: String },

    #[error("duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("dependency cycle detected among steps")]
    CycleDetected,

    #[error("plan has no steps")]
    EmptyPlan,

    #[error("plan has no patch step")]
    NoPatchStep,

    #[error("decomposition rejected: {0}")]
    Decomposition(String),
}

/// Result type for planning operations.
pub type PlanResult<T> = std::result::Result<T, PlanningError>;

/// Patchloop domain errors.
#[derive(Debug, thiserror::Error)]
pub enum PatchloopError {
    #[error("invalid goal: {0}")]
    InvalidGoal(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("planning error: {0}")]
    Planning(#[from] PlanningError),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("budget exceeded: {0}")]
    Budget(#[from] BudgetExceeded),

    #[error("storage error: {0}")]
    Storage(#[from] patchloop_state::StorageError),

    #[error("patch error: {0}")]
    Patch(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for Patchloop domain operations.
pub type Result<T> = std::result::Result<T, PatchloopError>;
