//! Adversarial QA gate.
//!
//! Every candidate starts unverified. The gate derives the four claims from
//! the candidate's evidence and decides ACCEPT (all PASS), REJECT (any FAIL)
//! or ESCALATE (otherwise). Verdicts are recorded per
//! `(candidate, evidence digest)`; once a candidate is accepted or rejected,
//! later reviews return that verdict unchanged.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use patchloop_state::ContentDigest;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::diff::is_confined;
use crate::domain::{
    Candidate, CandidateId, Claim, ClaimKind, DiffStats, Evidence, Finding, GoalConstraints,
    PatchloopError, QaDecision, QaVerdict, Result, ScopeBaseline,
};

/// Pattern that flags dangerous added code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRule {
    pub name: String,
    pub pattern: String,
}

impl ScanRule {
    fn new(name: &str, pattern: &str) -> Self {
        Self {
            name: name.to_string(),
            pattern: pattern.to_string(),
        }
    }
}

fn default_scan_rules() -> Vec<ScanRule> {
    vec![
        ScanRule::new("destructive_rm", r#"\brm\s+-[a-zA-Z]*[rR][a-zA-Z]*\s+["']?(/|\*|~|\$HOME)"#),
        ScanRule::new("pipe_to_shell", r"\b(curl|wget)\b[^|\n]*\|\s*(sudo\s+)?(ba|z)?sh\b"),
        ScanRule::new("private_key", r"-----BEGIN [A-Z ]*PRIVATE KEY-----"),
        ScanRule::new("aws_secret", r"(?i)aws_secret_access_key\s*[=:]"),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QaConfig {
    /// Multiplier on the step's minimal-diff baseline.
    pub scope_ratio: f64,
    /// File deletions a candidate may contain.
    pub max_deleted_files: u32,
    pub scan_rules: Vec<ScanRule>,
}

impl Default for QaConfig {
    fn default() -> Self {
        Self {
            scope_ratio: 1.0,
            max_deleted_files: 0,
            scan_rules: default_scan_rules(),
        }
    }
}

impl QaConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.scope_ratio.is_finite() && self.scope_ratio > 0.0) {
            return Err(PatchloopError::InvalidConfig(format!(
                "qa.scope_ratio must be positive, got {}",
                self.scope_ratio
            )));
        }
        StaticScanner::new(&self.scan_rules).map(|_| ())
    }
}

/// Regex scan over a diff's added lines.
#[derive(Debug, Clone)]
pub struct StaticScanner {
    rules: Vec<(String, Regex)>,
}

impl StaticScanner {
    pub fn new(rules: &[ScanRule]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|r| {
                Regex::new(&r.pattern)
                    .map(|re| (r.name.clone(), re))
                    .map_err(|e| {
                        PatchloopError::InvalidConfig(format!("scan rule '{}': {e}", r.name))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn scan(&self, stats: &DiffStats) -> Vec<Finding> {
        let mut findings = BTreeSet::new();
        for line in &stats.added_text {
            for (name, re) in &self.rules {
                if re.is_match(line) {
                    findings.insert(Finding {
                        rule: name.clone(),
                        message: truncate(line.trim(), 120),
                    });
                }
            }
        }
        findings.into_iter().collect()
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// What the step expects of a fix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationTarget {
    /// Tests failing before the patch; the fix must make them pass.
    pub failing_tests: BTreeSet<String>,
    /// Tests passing before the patch; none may start failing.
    pub baseline_passing: BTreeSet<String>,
}

pub struct QaGate {
    config: QaConfig,
    ledger: Mutex<HashMap<(CandidateId, ContentDigest), QaVerdict>>,
    decided: Mutex<HashMap<CandidateId, QaVerdict>>,
}

impl QaGate {
    pub fn new(config: QaConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ledger: Mutex::new(HashMap::new()),
            decided: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &QaConfig {
        &self.config
    }

    pub fn scanner(&self) -> Result<StaticScanner> {
        StaticScanner::new(&self.config.scan_rules)
    }

    /// Review `evidence` for `candidate`.
    pub fn review(
        &self,
        candidate: &Candidate,
        evidence: &Evidence,
        target: &EvaluationTarget,
        constraints: &GoalConstraints,
        baseline: ScopeBaseline,
    ) -> QaVerdict {
        let id = candidate.id().clone();
        if let Some(final_verdict) = lock(&self.decided).get(&id) {
            return final_verdict.clone();
        }
        let digest = evidence.digest();
        let key = (id.clone(), digest.clone());
        if let Some(recorded) = lock(&self.ledger).get(&key) {
            return recorded.clone();
        }

        let claims = vec![
            functional_fix(evidence, target),
            no_regression(evidence, target),
            self.scope_minimality(&evidence.diff, baseline),
            self.safety_compliance(evidence, constraints),
        ];
        let decision = QaDecision::from_claims(&claims);
        let verdict = QaVerdict {
            candidate_id: id.clone(),
            evidence_digest: digest,
            claims,
            decision,
        };
        debug!(candidate_id = %id, ?decision, "claims verified");

        // first writer wins if two reviews race on the same pair
        let verdict = lock(&self.ledger)
            .entry(key)
            .or_insert(verdict)
            .clone();
        if verdict.decision.is_terminal() {
            lock(&self.decided)
                .entry(id)
                .or_insert_with(|| verdict.clone());
        }
        crate::obs::emit_qa_decided(candidate.id().as_str(), verdict.decision);
        verdict
    }

    /// The terminal verdict for a candidate, if it has one.
    pub fn final_verdict(&self, id: &CandidateId) -> Option<QaVerdict> {
        lock(&self.decided).get(id).cloned()
    }

    fn scope_minimality(&self, diff: &DiffStats, baseline: ScopeBaseline) -> Claim {
        let kind = ClaimKind::ScopeMinimality;
        if diff.is_empty() {
            return Claim::fail(kind, "diff changes nothing");
        }
        let max_files = (baseline.files as f64 * self.config.scope_ratio).ceil() as usize;
        let max_lines = (baseline.lines as f64 * self.config.scope_ratio).ceil() as u32;
        let files = diff.file_count();
        let lines = diff.changed_lines();
        if files > max_files || lines > max_lines {
            Claim::fail(
                kind,
                format!("{files} file(s) / {lines} line(s) exceeds {max_files} / {max_lines}"),
            )
        } else {
            Claim::pass(kind, format!("{files} file(s) / {lines} line(s)"))
        }
    }

    fn safety_compliance(&self, evidence: &Evidence, constraints: &GoalConstraints) -> Claim {
        let kind = ClaimKind::SafetyCompliance;
        let mut problems = Vec::new();
        for path in &evidence.diff.files {
            if path.contains('*') || path.contains('?') {
                problems.push(format!("wildcard path {path}"));
            } else if !is_confined(path) {
                problems.push(format!("path escapes the project: {path}"));
            } else if let Some(pattern) = constraints.forbidden_match(path) {
                problems.push(format!("{path} matches forbidden pattern {pattern}"));
            } else if !constraints.is_allowed(path) {
                problems.push(format!("{path} is outside the allowed paths"));
            }
        }
        let deleted = evidence.diff.deleted_files.len();
        if deleted > self.config.max_deleted_files as usize {
            problems.push(format!(
                "deletes {deleted} file(s), at most {} allowed",
                self.config.max_deleted_files
            ));
        }
        for finding in &evidence.findings {
            problems.push(format!("{}: {}", finding.rule, finding.message));
        }
        if problems.is_empty() {
            Claim::pass(kind, "all changed paths allowed")
        } else {
            Claim::fail(kind, problems.join("; "))
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn functional_fix(evidence: &Evidence, target: &EvaluationTarget) -> Claim {
    let kind = ClaimKind::FunctionalFix;
    if let Some(err) = &evidence.apply_error {
        return Claim::fail(kind, format!("patch did not apply: {err}"));
    }
    if evidence.timed_out() {
        return Claim::fail(kind, "evaluation timed out");
    }
    if evidence.focused.is_none() {
        return Claim::inconclusive(kind, "focused tests never ran");
    }
    let remaining = evidence.remaining_failures(&target.failing_tests);
    if remaining.is_empty() {
        return Claim::pass(
            kind,
            format!("{} target test(s) pass", target.failing_tests.len()),
        );
    }
    if remaining.iter().all(|t| evidence.flaky_tests.contains(t)) {
        return Claim::inconclusive(kind, format!("non-reproducible: {}", join(&remaining)));
    }
    Claim::fail(kind, format!("still failing: {}", join(&remaining)))
}

fn no_regression(evidence: &Evidence, target: &EvaluationTarget) -> Claim {
    let kind = ClaimKind::NoRegression;
    if evidence.apply_error.is_some() {
        return Claim::fail(kind, "patch did not apply");
    }
    let Some(full) = &evidence.full else {
        return Claim::inconclusive(kind, "full suite not run");
    };
    if full.timed_out {
        return Claim::fail(kind, "full suite timed out");
    }
    let regressions: BTreeSet<String> = target
        .baseline_passing
        .iter()
        .filter(|t| full.failed.contains(*t))
        .cloned()
        .collect();
    if regressions.is_empty() {
        return Claim::pass(
            kind,
            format!("{} baseline test(s) still pass", target.baseline_passing.len()),
        );
    }
    let (flaky, hard): (BTreeSet<String>, BTreeSet<String>) = regressions
        .into_iter()
        .partition(|t| evidence.flaky_tests.contains(t));
    if hard.is_empty() {
        Claim::inconclusive(kind, format!("non-reproducible: {}", join(&flaky)))
    } else {
        Claim::fail(kind, format!("regressed: {}", join(&hard)))
    }
}

fn join(tests: &BTreeSet<String>) -> String {
    tests.iter().cloned().collect::<Vec<_>>().join(", ")
}
