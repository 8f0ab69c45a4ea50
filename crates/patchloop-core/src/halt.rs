//! Non-convergence detection.
//!
//! The [`HaltChecker`] watches evaluations and cycles and reports the
//! first condition that should end the run gracefully.

use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::warn;

use patchloop_state::ContentDigest;

use crate::domain::Candidate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HaltConfig {
    /// Number of recent evaluations kept for the flaky check.
    pub window: usize,
    /// Consecutive flaky evaluations of one patch that force a halt. Must
    /// exceed the single escalation re-run so that re-run can reject.
    pub max_flaky_repeats: u32,
    /// Halt once the union of files changed by applied patches exceeds this
    /// multiple of the first applied patch's file count.
    pub scope_growth_ratio: f64,
    /// Cycles with an unchanged failure signature and no reduction in
    /// failing tests before halting.
    pub max_stalled_cycles: u32,
}

impl Default for HaltConfig {
    fn default() -> Self {
        Self {
            window: 10,
            max_flaky_repeats: 3,
            scope_growth_ratio: 3.0,
            max_stalled_cycles: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HaltReason {
    #[error("candidate {candidate_id} was flaky {repeats} times in a row")]
    FlakyCandidate { candidate_id: String, repeats: u32 },

    #[error("applied changes grew to {files} files (first patch touched {original})")]
    ScopeGrowth { files: usize, original: usize },

    #[error("failure signature unchanged for {cycles} cycles")]
    NoProgress { cycles: u32 },
}

impl HaltReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FlakyCandidate { .. } => "flaky_candidate",
            Self::ScopeGrowth { .. } => "scope_growth",
            Self::NoProgress { .. } => "no_progress",
        }
    }
}

#[derive(Debug, Clone)]
struct Observation {
    patch: ContentDigest,
    flaky: bool,
}

#[derive(Debug)]
pub struct HaltChecker {
    config: HaltConfig,
    recent: VecDeque<Observation>,
    original_files: Option<usize>,
    touched: BTreeSet<String>,
    last_signature: Option<String>,
    best_remaining: usize,
    stalled: u32,
}

impl HaltChecker {
    pub fn new(config: HaltConfig) -> Self {
        Self {
            config,
            recent: VecDeque::new(),
            original_files: None,
            touched: BTreeSet::new(),
            last_signature: None,
            best_remaining: usize::MAX,
            stalled: 0,
        }
    }

    /// Record one completed evaluation. Repeats are counted per patch
    /// content, so a provider re-proposing the same diff under a new
    /// candidate id still accumulates.
    pub fn observe_evaluation(&mut self, candidate: &Candidate, flaky: bool) -> Option<HaltReason> {
        let patch = candidate.digest();
        self.recent.push_back(Observation {
            patch: patch.clone(),
            flaky,
        });
        while self.recent.len() > self.config.window.max(1) {
            self.recent.pop_front();
        }

        let repeats = self
            .recent
            .iter()
            .rev()
            .take_while(|o| o.flaky && o.patch == patch)
            .count() as u32;
        if flaky && repeats >= self.config.max_flaky_repeats {
            let reason = HaltReason::FlakyCandidate {
                candidate_id: candidate.id().to_string(),
                repeats,
            };
            warn!(%reason, "halt");
            return Some(reason);
        }
        None
    }

    /// Record the files of a patch that was accepted and applied.
    pub fn observe_applied(&mut self, files: &[String]) -> Option<HaltReason> {
        if files.is_empty() {
            return None;
        }
        let original = *self.original_files.get_or_insert(files.len());
        self.touched.extend(files.iter().cloned());
        let limit = (original as f64 * self.config.scope_growth_ratio).max(1.0);
        if self.touched.len() as f64 > limit {
            let reason = HaltReason::ScopeGrowth {
                files: self.touched.len(),
                original,
            };
            warn!(%reason, "halt");
            return Some(reason);
        }
        None
    }

    /// Record the failure signature left after a full cycle of candidates
    /// was rejected.
    pub fn observe_cycle(&mut self, signature: &str, remaining: usize) -> Option<HaltReason> {
        let same = self.last_signature.as_deref() == Some(signature);
        if same && remaining >= self.best_remaining {
            self.stalled += 1;
        } else {
            self.stalled = 0;
        }
        self.best_remaining = self.best_remaining.min(remaining);
        self.last_signature = Some(signature.to_string());

        // the first sighting is not a repeat
        if self.stalled + 1 >= self.config.max_stalled_cycles {
            let reason = HaltReason::NoProgress {
                cycles: self.stalled + 1,
            };
            warn!(%reason, "halt");
            return Some(reason);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(diff: &str) -> Candidate {
        Candidate::new("propose-fix", "primary", diff)
    }

    #[test]
    fn repeated_flaky_patch_halts() {
        let mut halt = HaltChecker::new(HaltConfig::default());
        let (a, b) = (candidate("a"), candidate("b"));
        assert!(halt.observe_evaluation(&a, true).is_none());
        assert!(halt.observe_evaluation(&b, true).is_none());
        assert!(halt.observe_evaluation(&b, false).is_none());
        assert!(halt.observe_evaluation(&b, true).is_none());
        assert!(halt.observe_evaluation(&b, true).is_none());
        // same diff proposed again under a fresh id
        assert!(matches!(
            halt.observe_evaluation(&candidate("b"), true),
            Some(HaltReason::FlakyCandidate { repeats: 3, .. })
        ));
    }

    #[test]
    fn escalation_rerun_does_not_halt_by_default() {
        let mut halt = HaltChecker::new(HaltConfig::default());
        let c = candidate("flaky");
        assert!(halt.observe_evaluation(&c, true).is_none());
        assert!(halt.observe_evaluation(&c, true).is_none());
    }

    #[test]
    fn scope_growth_against_first_applied_patch() {
        let mut halt = HaltChecker::new(HaltConfig::default());
        let files = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert!(halt.observe_applied(&files(&["a.rs"])).is_none());
        assert!(halt.observe_applied(&files(&["b.rs", "c.rs"])).is_none());
        assert_eq!(
            halt.observe_applied(&files(&["d.rs"])),
            Some(HaltReason::ScopeGrowth {
                files: 4,
                original: 1
            })
        );
    }

    #[test]
    fn rejected_alternatives_do_not_count_towards_scope() {
        let mut halt = HaltChecker::new(HaltConfig::default());
        let files = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        // evaluations alone never feed the scope check
        for name in ["a.rs", "b.rs", "c.rs", "d.rs", "e.rs"] {
            let c = candidate(name);
            assert!(halt.observe_evaluation(&c, false).is_none());
        }
        assert!(halt.observe_applied(&files(&["b.rs", "c.rs", "d.rs"])).is_none());
    }

    #[test]
    fn stalled_signature_halts_but_progress_resets() {
        let mut halt = HaltChecker::new(HaltConfig::default());
        assert!(halt.observe_cycle("test:a,b", 2).is_none());
        assert!(halt.observe_cycle("test:a,b", 2).is_none());
        // progress: one test fixed
        assert!(halt.observe_cycle("test:b", 1).is_none());
        assert!(halt.observe_cycle("test:b", 1).is_none());
        assert_eq!(
            halt.observe_cycle("test:b", 1),
            Some(HaltReason::NoProgress { cycles: 3 })
        );
    }
}
