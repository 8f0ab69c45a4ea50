//! Domain models for Patchloop.
//!
//! Canonical definitions for the core entities:
//! - `Goal`: immutable description of the desired outcome
//! - `Step` / `StepPlan`: decomposition of a goal with forward-only state
//! - `Candidate`: a proposed patch
//! - `Evidence`: what evaluating a candidate produced
//! - `Claim` / `QaVerdict`: typed assertions and the gate's decision

pub mod candidate;
pub mod claim;
pub mod diff;
pub mod error;
pub mod evidence;
pub mod goal;
pub mod step;

pub use candidate::{Candidate, CandidateId};
pub use claim::{Claim, ClaimKind, QaDecision, QaVerdict, Verdict};
pub use diff::{DiffStats, PatchError, UnifiedPatch};
pub use error::{PatchloopError, PlanResult, PlanningError, Result};
pub use evidence::{ErrorType, Evidence, Finding, TestResults, SUITE_TEST};
pub use goal::{Goal, GoalConstraints, GoalSignature, PathPattern};
pub use step::{RiskLevel, ScopeBaseline, Step, StepKind, StepPlan, StepState};
