//! Candidate patches.

use std::fmt;

use chrono::{DateTime, Utc};
use patchloop_state::ContentDigest;
use serde::{Deserialize, Serialize};

use super::diff::DiffStats;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CandidateId(String);

impl CandidateId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CandidateId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A proposed patch. Fields are fixed at construction; providers build it
/// with the `with_*` methods before handing it over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    id: CandidateId,
    step_id: String,
    provider_id: String,
    diff: String,
    fallback_used: bool,
    tokens_used: u64,
    created_at: DateTime<Utc>,
}

impl Candidate {
    pub fn new(
        step_id: impl Into<String>,
        provider_id: impl Into<String>,
        diff: impl Into<String>,
    ) -> Self {
        Self {
            id: CandidateId::new(),
            step_id: step_id.into(),
            provider_id: provider_id.into(),
            diff: diff.into(),
            fallback_used: false,
            tokens_used: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_tokens_used(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }

    /// Tag as produced by a secondary provider after the primary failed.
    pub(crate) fn into_fallback(mut self) -> Self {
        self.fallback_used = true;
        self
    }

    pub fn id(&self) -> &CandidateId {
        &self.id
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn diff(&self) -> &str {
        &self.diff
    }

    pub fn fallback_used(&self) -> bool {
        self.fallback_used
    }

    pub fn tokens_used(&self) -> u64 {
        self.tokens_used
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn digest(&self) -> ContentDigest {
        ContentDigest::from_bytes(self.diff.as_bytes())
    }

    pub fn stats(&self) -> DiffStats {
        DiffStats::from_diff(&self.diff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_tag_only_via_conversion() {
        let c = Candidate::new("propose-fix", "secondary", "--- a/x\n+++ b/x\n").with_tokens_used(12);
        assert!(!c.fallback_used());
        let id = c.id().clone();
        let tagged = c.into_fallback();
        assert!(tagged.fallback_used());
        assert_eq!(tagged.id(), &id);
        assert_eq!(tagged.tokens_used(), 12);
    }

    #[test]
    fn digest_tracks_diff() {
        let a = Candidate::new("s", "p", "diff-a");
        let b = Candidate::new("s", "q", "diff-a");
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.id(), b.id());
    }
}
