//! Repair actions the bandit chooses between.

use serde::{Deserialize, Serialize};

/// A repair strategy handed to providers as part of the repair context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    MinimalPatch,
    FocusOnTest,
    BroadenContext,
    RevertRecentChange,
    AlternativeApproach,
}

impl RepairAction {
    pub const ALL: [RepairAction; 5] = [
        RepairAction::MinimalPatch,
        RepairAction::FocusOnTest,
        RepairAction::BroadenContext,
        RepairAction::RevertRecentChange,
        RepairAction::AlternativeApproach,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MinimalPatch => "minimal_patch",
            Self::FocusOnTest => "focus_on_test",
            Self::BroadenContext => "broaden_context",
            Self::RevertRecentChange => "revert_recent_change",
            Self::AlternativeApproach => "alternative_approach",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == s.trim())
    }

    /// Instruction passed to the provider alongside the failure context.
    pub fn hint(self) -> &'static str {
        match self {
            Self::MinimalPatch => "Make the smallest change that makes the failing tests pass.",
            Self::FocusOnTest => {
                "Start from the failing assertion and trace back to the code it exercises."
            }
            Self::BroadenContext => "Read the callers and surrounding module before editing.",
            Self::RevertRecentChange => {
                "Look for a recent change that introduced the failure and undo it."
            }
            Self::AlternativeApproach => {
                "Earlier candidates were rejected; take a different approach than before."
            }
        }
    }
}

impl std::fmt::Display for RepairAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for action in RepairAction::ALL {
            assert_eq!(RepairAction::parse(action.as_str()), Some(action));
            let json = serde_json::to_string(&action).unwrap();
            assert_eq!(json, format!("\"{}\"", action.as_str()));
        }
        assert_eq!(RepairAction::parse("rewrite_everything"), None);
    }
}
