//! Run reports and their on-disk artifact.
//!
//! A report is written as `<dir>/<run_id>/report.json` next to
//! `report.digest`, the SHA-256 of the JSON bytes. Reading verifies the
//! digest. Every applied step carries a [`StepArtifact`] with the patch
//! digest and a fingerprint of the repository it left behind.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use patchloop_state::ContentDigest;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;
use walkdir::WalkDir;

use crate::budget::BudgetSnapshot;
use crate::controller::{RunStatus, TerminationReason};
use crate::domain::{
    Claim, ErrorType, Evidence, PatchloopError, QaDecision, Result, StepKind, StepPlan, StepState,
};
use crate::metrics::PlanSource;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: String,
    pub title: String,
    pub kind: StepKind,
    pub state: StepState,
}

impl StepRecord {
    pub fn from_plan(plan: &StepPlan) -> Vec<Self> {
        plan.steps
            .iter()
            .map(|s| Self {
                id: s.id.clone(),
                title: s.title.clone(),
                kind: s.kind,
                state: s.state(),
            })
            .collect()
    }
}

/// Condensed view of an [`Evidence`] record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceSummary {
    pub applied: bool,
    pub apply_error: Option<String>,
    pub timed_out: bool,
    pub focused_failed: Vec<String>,
    /// `None` when the full suite never ran.
    pub full_failed: Option<Vec<String>>,
    pub flaky_tests: Vec<String>,
    pub files: Vec<String>,
    pub added_lines: u32,
    pub removed_lines: u32,
    pub findings: Vec<String>,
    pub total_ms: u64,
}

impl From<&Evidence> for EvidenceSummary {
    fn from(evidence: &Evidence) -> Self {
        Self {
            applied: evidence.applied(),
            apply_error: evidence.apply_error.clone(),
            timed_out: evidence.timed_out(),
            focused_failed: evidence
                .focused
                .as_ref()
                .map(|r| r.failed.iter().cloned().collect())
                .unwrap_or_default(),
            full_failed: evidence
                .full
                .as_ref()
                .map(|r| r.failed.iter().cloned().collect()),
            flaky_tests: evidence.flaky_tests.iter().cloned().collect(),
            files: evidence.diff.files.iter().cloned().collect(),
            added_lines: evidence.diff.added_lines,
            removed_lines: evidence.diff.removed_lines,
            findings: evidence
                .findings
                .iter()
                .map(|f| format!("{}: {}", f.rule, f.message))
                .collect(),
            total_ms: evidence.total_ms,
        }
    }
}

/// What applying one step's accepted patch produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepArtifact {
    pub step_id: String,
    pub candidate_id: String,
    pub provider: String,
    /// SHA-256 of the applied diff text.
    pub diff_digest: String,
    pub files: Vec<String>,
    /// Wall-clock time from the step's first query until the patch landed.
    pub elapsed_ms: u64,
    /// [`repo_fingerprint`] after the patch; `None` if it could not be read.
    pub repo_fingerprint: Option<String>,
}

/// One candidate as seen by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub candidate_id: String,
    pub step_id: String,
    pub cycle: u32,
    pub provider: String,
    pub fallback_used: bool,
    pub attempt: u32,
    pub slot: Option<usize>,
    pub evidence: Option<EvidenceSummary>,
    pub claims: Vec<Claim>,
    pub decision: Option<QaDecision>,
    pub cancelled: bool,
    /// Why the candidate ended without a verdict, when it did.
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub goal: String,
    pub status: RunStatus,
    pub reason: TerminationReason,
    /// Concatenated diffs applied to the target, in order.
    pub applied_patch: Option<String>,
    pub plan_id: Option<String>,
    pub plan_source: Option<PlanSource>,
    pub error_type: Option<ErrorType>,
    /// Tests failing when the run started.
    pub failing_tests: Vec<String>,
    pub cycles: u32,
    pub budget: BudgetSnapshot,
    pub steps: Vec<StepRecord>,
    pub audit: Vec<AuditEntry>,
    #[serde(default)]
    pub artifacts: Vec<StepArtifact>,
    /// Text exposition of the metrics at the end of the run.
    pub metrics: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RunReport {
    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        match &self.reason {
            TerminationReason::NothingToRepair
            | TerminationReason::Applied
            | TerminationReason::HaltTriggered { .. } => 0,
            TerminationReason::BudgetExceeded { .. } => 2,
            TerminationReason::SandboxFailure { .. } => 3,
            TerminationReason::PlanningFailed { .. } | TerminationReason::ApplyFailed { .. } => 1,
        }
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        let accepted = self
            .audit
            .iter()
            .filter(|a| a.decision == Some(QaDecision::Accept))
            .count();
        format!(
            "{} ({}) after {} cycle(s): {} candidate(s), {} accepted, {}ms",
            self.status.as_str(),
            self.reason,
            self.cycles,
            self.audit.len(),
            accepted,
            self.duration_ms
        )
    }

    pub fn plan_summary(&self) -> PlanSummary {
        let count = |state: StepState| self.steps.iter().filter(|s| s.state == state).count();
        PlanSummary {
            plan_id: self.plan_id.clone(),
            source: self.plan_source,
            steps: self.steps.len(),
            succeeded: count(StepState::Succeeded),
            failed: count(StepState::Failed),
            skipped: count(StepState::Skipped),
            files_touched: self
                .artifacts
                .iter()
                .flat_map(|a| a.files.iter().cloned())
                .collect(),
            patch_ms: self.artifacts.iter().map(|a| a.elapsed_ms).sum(),
        }
    }
}

/// Step counts and touched files of a run's plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub plan_id: Option<String>,
    pub source: Option<PlanSource>,
    pub steps: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub files_touched: BTreeSet<String>,
    /// Sum of the applied steps' elapsed time.
    pub patch_ms: u64,
}

/// One verified report found on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportListing {
    pub run_id: String,
    pub status: RunStatus,
    pub reason: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub plan: PlanSummary,
}

impl From<&RunReport> for ReportListing {
    fn from(report: &RunReport) -> Self {
        Self {
            run_id: report.run_id.clone(),
            status: report.status,
            reason: report.reason.as_str().to_string(),
            started_at: report.started_at,
            duration_ms: report.duration_ms,
            plan: report.plan_summary(),
        }
    }
}

/// Directory names never part of a fingerprint, on top of the caller's.
const FINGERPRINT_SKIPPED: &[&str] = &[".patchloop"];

/// SHA-256 over every regular file's relative path and contents, in path
/// order. Top-level directories named in `excluded` are skipped.
pub fn repo_fingerprint(root: &Path, excluded: &[String]) -> std::io::Result<String> {
    let skipped = |name: &std::ffi::OsStr| {
        excluded.iter().any(|x| name == x.as_str()) || FINGERPRINT_SKIPPED.iter().any(|x| name == *x)
    };
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() != 1 || !skipped(e.file_name()));

    let mut hasher = Sha256::new();
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(std::fs::read(entry.path())?);
        hasher.update([0u8]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Persist `<dir>/<run_id>/report.json` and `<dir>/<run_id>/report.digest`.
pub fn write_report_artifact(report: &RunReport, dir: &Path) -> Result<PathBuf> {
    let run_dir = dir.join(&report.run_id);
    std::fs::create_dir_all(&run_dir)?;

    let artifact_path = run_dir.join("report.json");
    let digest_path = run_dir.join("report.digest");
    let json = serde_json::to_vec_pretty(report)?;
    let digest = ContentDigest::from_bytes(&json).as_str().to_string();

    std::fs::write(&artifact_path, &json)?;
    std::fs::write(&digest_path, digest.as_bytes())?;

    Ok(artifact_path)
}

/// Read `<dir>/<run_id>/report.json`, verifying it against its digest.
pub fn read_report_artifact(run_id: &str, dir: &Path) -> Result<RunReport> {
    let run_dir = dir.join(run_id);
    let json = std::fs::read(run_dir.join("report.json"))?;
    let expected = std::fs::read_to_string(run_dir.join("report.digest"))?;
    let actual = ContentDigest::from_bytes(&json).as_str().to_string();
    if expected.trim() != actual {
        return Err(PatchloopError::DigestMismatch {
            expected: expected.trim().to_string(),
            actual,
        });
    }
    Ok(serde_json::from_slice(&json)?)
}

/// Every verified report under `dir`, oldest first. Reports that fail
/// verification are logged and left out.
pub fn list_report_artifacts(dir: &Path) -> Result<Vec<ReportListing>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut listings = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let run_id = entry.file_name().to_string_lossy().to_string();
        match read_report_artifact(&run_id, dir) {
            Ok(report) => listings.push(ReportListing::from(&report)),
            Err(e) => warn!(run_id = %run_id, error = %e, "skipping unreadable report"),
        }
    }
    listings.sort_by(|a, b| (a.started_at, &a.run_id).cmp(&(b.started_at, &b.run_id)));
    Ok(listings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{BudgetConfig, BudgetGate};

    fn report(reason: TerminationReason) -> RunReport {
        RunReport {
            run_id: "run-1".into(),
            goal: "fix the parser".into(),
            status: reason.status(),
            reason,
            applied_patch: None,
            plan_id: Some("plan-abc".into()),
            plan_source: Some(PlanSource::Pattern),
            error_type: Some(ErrorType::Test),
            failing_tests: vec!["parser::eof".into()],
            cycles: 1,
            budget: BudgetGate::new(BudgetConfig::default()).snapshot(),
            steps: Vec::new(),
            audit: Vec::new(),
            artifacts: Vec::new(),
            metrics: String::new(),
            started_at: Utc::now(),
            duration_ms: 12,
        }
    }

    #[test]
    fn artifact_round_trip_and_tamper_detection() {
        let dir = tempfile::tempdir().unwrap();
        let original = report(TerminationReason::Applied);
        let path = write_report_artifact(&original, dir.path()).unwrap();
        assert!(path.ends_with("run-1/report.json"));
        assert_eq!(read_report_artifact("run-1", dir.path()).unwrap(), original);

        std::fs::write(&path, b"{\"tampered\": true}").unwrap();
        assert!(matches!(
            read_report_artifact("run-1", dir.path()),
            Err(PatchloopError::DigestMismatch { .. })
        ));
    }

    fn step(id: &str, state: StepState) -> StepRecord {
        StepRecord {
            id: id.into(),
            title: id.into(),
            kind: StepKind::Patch,
            state,
        }
    }

    #[test]
    fn plan_summary_counts_steps_and_touched_files() {
        let mut r = report(TerminationReason::Applied);
        r.steps = vec![
            step("propose-fix", StepState::Succeeded),
            step("verify-full", StepState::Succeeded),
            step("cleanup", StepState::Skipped),
        ];
        r.artifacts = vec![StepArtifact {
            step_id: "propose-fix".into(),
            candidate_id: "c-1".into(),
            provider: "primary".into(),
            diff_digest: ContentDigest::from_bytes(b"diff").as_str().to_string(),
            files: vec!["src/lib.rs".into(), "src/parser.rs".into()],
            elapsed_ms: 40,
            repo_fingerprint: Some("ab".into()),
        }];
        let summary = r.plan_summary();
        assert_eq!(summary.plan_id.as_deref(), Some("plan-abc"));
        assert_eq!((summary.steps, summary.succeeded, summary.skipped), (3, 2, 1));
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.files_touched.len(), 2);
        assert_eq!(summary.patch_ms, 40);
    }

    #[test]
    fn listing_is_ordered_and_skips_tampered_reports() {
        let dir = tempfile::tempdir().unwrap();
        let mut older = report(TerminationReason::Applied);
        older.run_id = "run-old".into();
        older.started_at = Utc::now() - chrono::Duration::minutes(5);
        let mut newer = report(TerminationReason::NothingToRepair);
        newer.run_id = "run-new".into();
        let mut broken = report(TerminationReason::Applied);
        broken.run_id = "run-broken".into();
        for r in [&newer, &older, &broken] {
            write_report_artifact(r, dir.path()).unwrap();
        }
        std::fs::write(dir.path().join("run-broken/report.digest"), "00").unwrap();
        std::fs::write(dir.path().join("stray.txt"), "not a run").unwrap();

        let listed = list_report_artifacts(dir.path()).unwrap();
        let ids: Vec<&str> = listed.iter().map(|l| l.run_id.as_str()).collect();
        assert_eq!(ids, vec!["run-old", "run-new"]);
        assert_eq!(listed[1].reason, "nothing_to_repair");

        assert!(list_report_artifacts(&dir.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn fingerprint_tracks_contents_and_skips_excluded_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join("target")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "fn a() {}\n").unwrap();
        let excluded = vec!["target".to_string()];

        let before = repo_fingerprint(dir.path(), &excluded).unwrap();
        assert_eq!(before.len(), 64);
        std::fs::write(dir.path().join("target/out"), "build output").unwrap();
        std::fs::create_dir_all(dir.path().join(".patchloop/runs")).unwrap();
        std::fs::write(dir.path().join(".patchloop/runs/x"), "report").unwrap();
        assert_eq!(repo_fingerprint(dir.path(), &excluded).unwrap(), before);

        std::fs::write(dir.path().join("src/lib.rs"), "fn b() {}\n").unwrap();
        assert_ne!(repo_fingerprint(dir.path(), &excluded).unwrap(), before);
    }

    #[test]
    fn exit_codes_follow_termination() {
        assert_eq!(report(TerminationReason::Applied).exit_code(), 0);
        assert_eq!(report(TerminationReason::NothingToRepair).exit_code(), 0);
        let halted = report(TerminationReason::HaltTriggered {
            halt: crate::halt::HaltReason::NoProgress { cycles: 3 },
        });
        assert_eq!(halted.exit_code(), 0);
        let budget = report(TerminationReason::BudgetExceeded {
            resource: crate::budget::BudgetResource::Steps,
            detail: "limit".into(),
        });
        assert_eq!(budget.exit_code(), 2);
        let sandbox = report(TerminationReason::SandboxFailure {
            detail: "disk".into(),
        });
        assert_eq!(sandbox.exit_code(), 3);
    }
}
