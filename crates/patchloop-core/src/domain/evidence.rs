//! Evidence collected while evaluating a candidate, plus failure
//! classification for detected failures.

use std::collections::BTreeSet;

use patchloop_state::ContentDigest;
use serde::{Deserialize, Serialize};

use super::candidate::CandidateId;
use super::diff::DiffStats;

/// Pseudo test name used when a runner only reports an exit code.
pub const SUITE_TEST: &str = "<suite>";

/// Per-test outcome of one test command invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResults {
    pub passed: BTreeSet<String>,
    pub failed: BTreeSet<String>,
    pub exit_code: i32,
    #[serde(default)]
    pub timed_out: bool,
}

impl TestResults {
    /// Results for a runner that only reports an exit code.
    pub fn aggregate(exit_code: i32) -> Self {
        let mut results = Self {
            exit_code,
            ..Self::default()
        };
        if exit_code == 0 {
            results.passed.insert(SUITE_TEST.to_string());
        } else {
            results.failed.insert(SUITE_TEST.to_string());
        }
        results
    }

    pub fn timed_out() -> Self {
        Self {
            exit_code: -1,
            timed_out: true,
            ..Self::default()
        }
    }

    pub fn is_aggregate(&self) -> bool {
        self.passed.iter().chain(&self.failed).all(|t| t == SUITE_TEST)
    }

    pub fn all_passed(&self) -> bool {
        !self.timed_out && self.failed.is_empty() && self.exit_code == 0
    }

    /// `Some(true)` passed, `Some(false)` failed, `None` not reported.
    pub fn outcome(&self, test: &str) -> Option<bool> {
        if self.failed.contains(test) {
            Some(false)
        } else if self.passed.contains(test) {
            Some(true)
        } else {
            None
        }
    }
}

/// A static-analysis finding on a candidate's diff.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Finding {
    pub rule: String,
    pub message: String,
}

/// Structured record of one evaluation attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub candidate_id: CandidateId,
    pub attempt: u32,
    pub apply_error: Option<String>,
    /// Focused run over the step's target tests. `None` if never reached.
    pub focused: Option<TestResults>,
    /// Full-suite run. `None` after a focused failure (fail-fast).
    pub full: Option<TestResults>,
    /// Tests whose outcome differed between the full run and its rerun.
    pub flaky_tests: BTreeSet<String>,
    pub diff: DiffStats,
    pub findings: Vec<Finding>,
    pub focused_ms: u64,
    pub full_ms: u64,
    pub total_ms: u64,
}

impl Evidence {
    pub fn new(candidate_id: CandidateId, attempt: u32, diff: DiffStats) -> Self {
        Self {
            candidate_id,
            attempt,
            diff,
            ..Self::default()
        }
    }

    pub fn applied(&self) -> bool {
        self.apply_error.is_none()
    }

    pub fn timed_out(&self) -> bool {
        self.focused.as_ref().is_some_and(|r| r.timed_out)
            || self.full.as_ref().is_some_and(|r| r.timed_out)
    }

    pub fn is_flaky(&self) -> bool {
        !self.flaky_tests.is_empty()
    }

    /// Target tests still failing in the deepest run reached.
    pub fn remaining_failures(&self, targets: &BTreeSet<String>) -> BTreeSet<String> {
        let Some(results) = self.full.as_ref().or(self.focused.as_ref()) else {
            return targets.clone();
        };
        if results.timed_out {
            return targets.clone();
        }
        targets
            .iter()
            .filter(|t| results.outcome(t) != Some(true))
            .cloned()
            .collect()
    }

    /// Digest over the canonical JSON form. Timings are excluded so a rerun
    /// with identical outcomes yields the same digest.
    pub fn digest(&self) -> ContentDigest {
        let mut canonical = self.clone();
        canonical.focused_ms = 0;
        canonical.full_ms = 0;
        canonical.total_ms = 0;
        canonical.attempt = 0;
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        ContentDigest::from_bytes(&bytes)
    }
}

/// Coarse class of a detected failure; the key for action memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Build,
    Test,
    Runtime,
    Timeout,
    Unknown,
}

impl ErrorType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Test => "test",
            Self::Runtime => "runtime",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }

    /// Classify by keywords in the failing command's output.
    pub fn classify(output: &str, timed_out: bool) -> Self {
        if timed_out {
            return Self::Timeout;
        }
        let msg = output.to_lowercase();
        if msg.contains("error[e")
            || msg.contains("could not compile")
            || msg.contains("compilation failed")
            || msg.contains("syntaxerror")
            || msg.contains("cannot find symbol")
            || msg.contains("linker error")
        {
            return Self::Build;
        }
        if msg.contains("assert") || msg.contains("test failed") {
            return Self::Test;
        }
        if msg.contains("panicked")
            || msg.contains("segmentation fault")
            || msg.contains("traceback")
            || msg.contains("null pointer")
        {
            return Self::Runtime;
        }
        if msg.contains("failed") || msg.contains("fail:") {
            return Self::Test;
        }
        Self::Unknown
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
