//! Claims, verdicts and QA decisions.

use patchloop_state::ContentDigest;
use serde::{Deserialize, Serialize};

use super::candidate::CandidateId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimKind {
    FunctionalFix,
    NoRegression,
    ScopeMinimality,
    SafetyCompliance,
}

impl ClaimKind {
    pub const ALL: [ClaimKind; 4] = [
        ClaimKind::FunctionalFix,
        ClaimKind::NoRegression,
        ClaimKind::ScopeMinimality,
        ClaimKind::SafetyCompliance,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Pass,
    Fail,
    Inconclusive,
}

/// A typed assertion about a candidate with its verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub kind: ClaimKind,
    pub verdict: Verdict,
    pub rationale: String,
}

impl Claim {
    pub fn pass(kind: ClaimKind, rationale: impl Into<String>) -> Self {
        Self {
            kind,
            verdict: Verdict::Pass,
            rationale: rationale.into(),
        }
    }

    pub fn fail(kind: ClaimKind, rationale: impl Into<String>) -> Self {
        Self {
            kind,
            verdict: Verdict::Fail,
            rationale: rationale.into(),
        }
    }

    pub fn inconclusive(kind: ClaimKind, rationale: impl Into<String>) -> Self {
        Self {
            kind,
            verdict: Verdict::Inconclusive,
            rationale: rationale.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QaDecision {
    Accept,
    Reject,
    Escalate,
}

impl QaDecision {
    /// Any FAIL rejects; otherwise any INCONCLUSIVE escalates; otherwise accept.
    pub fn from_claims(claims: &[Claim]) -> Self {
        if claims.iter().any(|c| c.verdict == Verdict::Fail) {
            Self::Reject
        } else if claims.iter().any(|c| c.verdict == Verdict::Inconclusive) {
            Self::Escalate
        } else {
            Self::Accept
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Accept | Self::Reject)
    }
}

/// Recorded outcome of reviewing one candidate against one evidence record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaVerdict {
    pub candidate_id: CandidateId,
    pub evidence_digest: ContentDigest,
    pub claims: Vec<Claim>,
    pub decision: QaDecision,
}

impl QaVerdict {
    pub fn claim(&self, kind: ClaimKind) -> Option<&Claim> {
        self.claims.iter().find(|c| c.kind == kind)
    }
}
