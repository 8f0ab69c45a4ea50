//! Controller states and how a run can end.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::budget::BudgetResource;
use crate::halt::HaltReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerState {
    Detecting,
    Planning,
    Querying,
    Evaluating,
    QaReview,
    Applying,
    Done,
    Halted,
    Failed,
}

impl ControllerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Detecting => "DETECTING",
            Self::Planning => "PLANNING",
            Self::Querying => "QUERYING",
            Self::Evaluating => "EVALUATING",
            Self::QaReview => "QA_REVIEW",
            Self::Applying => "APPLYING",
            Self::Done => "DONE",
            Self::Halted => "HALTED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Halted | Self::Failed)
    }

    /// Legal moves. Any live state may exit to `Halted` or `Failed`.
    pub fn can_transition_to(self, next: ControllerState) -> bool {
        use ControllerState::*;
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Halted | Failed) {
            return true;
        }
        matches!(
            (self, next),
            (Detecting, Planning)
                | (Detecting, Querying)
                | (Detecting, Done)
                | (Planning, Querying)
                | (Planning, Done)
                | (Querying, Evaluating)
                | (Evaluating, QaReview)
                | (Evaluating, Querying)
                | (QaReview, Evaluating)
                | (QaReview, Querying)
                | (QaReview, Applying)
                | (Applying, Querying)
                | (Applying, Done)
        )
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Done,
    Halted,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Done => "DONE",
            Self::Halted => "HALTED",
            Self::Failed => "FAILED",
        }
    }

    pub fn state(self) -> ControllerState {
        match self {
            Self::Done => ControllerState::Done,
            Self::Halted => ControllerState::Halted,
            Self::Failed => ControllerState::Failed,
        }
    }
}

/// Why a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TerminationReason {
    /// The test command already passes.
    NothingToRepair,
    /// Every failing test is fixed by applied patches.
    Applied,
    BudgetExceeded {
        resource: BudgetResource,
        detail: String,
    },
    SandboxFailure {
        detail: String,
    },
    HaltTriggered {
        halt: HaltReason,
    },
    PlanningFailed {
        detail: String,
    },
    ApplyFailed {
        detail: String,
    },
}

impl TerminationReason {
    pub fn status(&self) -> RunStatus {
        match self {
            Self::NothingToRepair | Self::Applied => RunStatus::Done,
            Self::HaltTriggered { .. } => RunStatus::Halted,
            Self::BudgetExceeded { .. }
            | Self::SandboxFailure { .. }
            | Self::PlanningFailed { .. }
            | Self::ApplyFailed { .. } => RunStatus::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NothingToRepair => "nothing_to_repair",
            Self::Applied => "applied",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::SandboxFailure { .. } => "sandbox_failure",
            Self::HaltTriggered { .. } => "halt_triggered",
            Self::PlanningFailed { .. } => "planning_failed",
            Self::ApplyFailed { .. } => "apply_failed",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BudgetExceeded { detail, .. }
            | Self::SandboxFailure { detail }
            | Self::PlanningFailed { detail }
            | Self::ApplyFailed { detail } => write!(f, "{}: {detail}", self.as_str()),
            Self::HaltTriggered { halt } => write!(f, "{}: {halt}", self.as_str()),
            _ => f.write_str(self.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_legal() {
        use ControllerState::*;
        let path = [
            Detecting, Planning, Querying, Evaluating, QaReview, Evaluating, QaReview, Applying,
            Done,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn terminal_states_are_final() {
        use ControllerState::*;
        assert!(!Done.can_transition_to(Querying));
        assert!(!Failed.can_transition_to(Halted));
        assert!(Evaluating.can_transition_to(Failed));
        assert!(!Querying.can_transition_to(Applying));
        assert!(!Detecting.can_transition_to(Evaluating));
    }

    #[test]
    fn reasons_map_to_status() {
        assert_eq!(TerminationReason::Applied.status(), RunStatus::Done);
        assert_eq!(TerminationReason::NothingToRepair.status(), RunStatus::Done);
        let halt = TerminationReason::HaltTriggered {
            halt: HaltReason::NoProgress { cycles: 3 },
        };
        assert_eq!(halt.status(), RunStatus::Halted);
        let budget = TerminationReason::BudgetExceeded {
            resource: BudgetResource::Steps,
            detail: "steps".into(),
        };
        assert_eq!(budget.status(), RunStatus::Failed);
        assert_eq!(budget.as_str(), "budget_exceeded");
    }
}
