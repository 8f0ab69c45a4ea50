//! Patchloop Core Library
//!
//! The repair orchestration engine: turns a failing test command into a
//! verified, applied patch under a resource budget.
//!
//! Leaves first: [`sandbox`] and [`budget`] underpin the
//! [`ensemble`] coordinator and the [`evaluator`] worker pool, whose
//! evidence the [`qa`] gate judges. [`memory`], [`plan_cache`] and [`halt`]
//! steer the [`controller`] loop that sequences them all.

pub mod budget;
pub mod buildpack;
pub mod config;
pub mod controller;
pub mod domain;
pub mod ensemble;
pub mod evaluator;
pub mod halt;
pub mod memory;
pub mod metrics;
pub mod obs;
pub mod plan_cache;
pub mod planner;
pub mod provider;
pub mod qa;
pub mod report;
pub mod sandbox;
pub mod telemetry;

pub use budget::{
    BudgetConfig, BudgetExceeded, BudgetGate, BudgetLimits, BudgetResource, BudgetSnapshot,
    BudgetState,
};
pub use buildpack::{builtin_buildpacks, detect_buildpack, BuildSpec, Buildpack};
pub use config::RunConfig;
pub use controller::{
    Controller, ControllerBuilder, ControllerState, RunStatus, TerminationReason,
};
pub use domain::{
    Candidate, CandidateId, Claim, ClaimKind, DiffStats, ErrorType, Evidence, Goal,
    GoalConstraints, GoalSignature, PatchloopError, PathPattern, PlanningError, QaDecision,
    QaVerdict, Result, RiskLevel, Step, StepKind, StepPlan, StepState, TestResults,
    UnifiedPatch, Verdict,
};
pub use ensemble::{EnsembleConfig, EnsembleCoordinator, EnsembleError, EnsembleMode};
pub use evaluator::{EvaluatorConfig, ParallelEvaluator, WorkerOutcome};
pub use halt::{HaltChecker, HaltConfig, HaltReason};
pub use memory::{ActionMemory, BanditConfig, RepairAction};
pub use metrics::{Metrics, PlanSource};
pub use plan_cache::{PlanCache, PlanCacheConfig};
pub use planner::{
    Decomposer, DecomposingPlanner, PatternPlanner, Planner, PlannerMode, PlanningContext,
};
pub use provider::{
    CommandProvider, ModelProvider, PatchConstraints, ProviderFailure, RepairContext,
    ScriptedProvider, ScriptedReply,
};
pub use qa::{EvaluationTarget, QaConfig, QaGate};
pub use report::{
    list_report_artifacts, read_report_artifact, repo_fingerprint, write_report_artifact,
    AuditEntry, PlanSummary, ReportListing, RunReport, StepArtifact,
};
pub use sandbox::{SandboxConfig, SandboxError, SandboxManager};
pub use telemetry::init_tracing;
