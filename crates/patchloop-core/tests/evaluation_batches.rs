//! Evaluation batches driven through real sandboxes and shell test scripts.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use patchloop_core::buildpack::parse_libtest_output;
use patchloop_core::qa::StaticScanner;
use patchloop_core::sandbox::CommandOutput;
use patchloop_core::{
    BudgetConfig, BudgetGate, BudgetLimits, BuildSpec, Buildpack, Candidate, EvaluationTarget,
    EvaluatorConfig, Metrics, ParallelEvaluator, SandboxConfig, SandboxManager, TestResults,
    WorkerOutcome,
};
use tempfile::TempDir;

/// Runs one shell script for both focused and full suites.
struct ScriptBuildpack(&'static str);

impl Buildpack for ScriptBuildpack {
    fn name(&self) -> &'static str {
        "script"
    }

    fn detect(&self, _path: &Path) -> bool {
        true
    }

    fn build_spec(&self, _path: &Path) -> BuildSpec {
        let argv: Vec<String> = ["sh", "-c", self.0].iter().map(|s| s.to_string()).collect();
        BuildSpec {
            language: "shell".into(),
            build_cmd: Vec::new(),
            test_cmd: argv.clone(),
            focused_test_cmd: argv,
            source_globs: Vec::new(),
        }
    }

    fn focused_test_cmd(&self, spec: &BuildSpec, _tests: &[String]) -> Vec<String> {
        spec.focused_test_cmd.clone()
    }

    fn parse_test_output(&self, output: &CommandOutput) -> TestResults {
        parse_libtest_output(output)
    }
}

/// The second run inside a sandbox (the first full run) fails the baseline
/// test; every other run passes.
const FLAKY_BASELINE: &str = r#"n=$(( $(cat runs 2>/dev/null || echo 0) + 1 ))
echo $n > runs
echo "test tests::target ... ok"
if [ $n -eq 2 ]; then echo "test tests::baseline ... FAILED"; exit 101; fi
echo "test tests::baseline ... ok""#;

const BROKEN_BASELINE: &str = r#"echo "test tests::target ... ok"
echo "test tests::baseline ... FAILED"
exit 101"#;

const DELAYED_PASS: &str = r#"sleep $(cat delay.txt)
echo "test tests::target ... ok"
echo "test tests::baseline ... ok""#;

fn repo() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("delay.txt"), "0\n").unwrap();
    dir
}

fn evaluator(repo: &TempDir, script: &'static str, workers: usize) -> ParallelEvaluator {
    let metrics = Arc::new(Metrics::new());
    let budget = Arc::new(BudgetGate::new(BudgetConfig {
        limits: BudgetLimits::default(),
        enforce: false,
        ..BudgetConfig::default()
    }));
    let sandboxes = Arc::new(
        SandboxManager::new(
            repo.path(),
            SandboxConfig {
                max_live: workers,
                ..SandboxConfig::default()
            },
            budget,
            Arc::clone(&metrics),
        )
        .unwrap(),
    );
    let buildpack = ScriptBuildpack(script);
    let spec = buildpack.build_spec(repo.path());
    ParallelEvaluator::new(
        sandboxes,
        Arc::new(buildpack),
        spec,
        StaticScanner::new(&[]).unwrap(),
        EvaluatorConfig {
            workers,
            focused_timeout_ms: 30_000,
            full_timeout_ms: 30_000,
            flaky_reruns: 1,
        },
        metrics,
    )
}

fn target() -> EvaluationTarget {
    EvaluationTarget {
        failing_tests: BTreeSet::from(["tests::target".to_string()]),
        baseline_passing: BTreeSet::from(["tests::baseline".to_string()]),
    }
}

fn set_delay(seconds: &str) -> String {
    format!(
        "--- a/delay.txt\n+++ b/delay.txt\n@@ -1 +1 @@\n-0\n+{seconds}\n"
    )
}

async fn evaluate_one(evaluator: &ParallelEvaluator) -> patchloop_core::Evidence {
    let mut batch = evaluator.start(target());
    batch.submit(Candidate::new("propose-fix", "primary", set_delay("0")));
    let mut outcomes = batch.next().await.unwrap();
    assert_eq!(outcomes.len(), 1);
    match outcomes.remove(0) {
        WorkerOutcome::Completed(result) => result.evidence,
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failure_that_vanishes_on_rerun_is_marked_flaky() {
    let repo = repo();
    let evidence = evaluate_one(&evaluator(&repo, FLAKY_BASELINE, 1)).await;

    assert!(evidence.is_flaky());
    assert_eq!(
        evidence.flaky_tests,
        BTreeSet::from(["tests::baseline".to_string()])
    );
    let full = evidence.full.as_ref().unwrap();
    assert!(full.failed.contains("tests::baseline"));
    assert!(evidence.remaining_failures(&target().failing_tests).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reproducible_failure_is_not_flaky() {
    let repo = repo();
    let evidence = evaluate_one(&evaluator(&repo, BROKEN_BASELINE, 1)).await;

    assert!(!evidence.is_flaky());
    let full = evidence.full.as_ref().unwrap();
    assert!(full.failed.contains("tests::baseline"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simultaneous_completions_come_back_lowest_slot_first() {
    let repo = repo();
    let evaluator = evaluator(&repo, DELAYED_PASS, 3);
    let mut batch = evaluator.start(target());
    // later submissions finish first
    for delay in ["0.6", "0.3", "0"] {
        batch.submit(Candidate::new("propose-fix", "primary", set_delay(delay)));
    }

    // let every worker finish before collecting
    tokio::time::sleep(Duration::from_secs(5)).await;
    let ready = batch.next().await.unwrap();

    let slots: Vec<usize> = ready.iter().map(WorkerOutcome::slot).collect();
    assert_eq!(slots, vec![0, 1, 2]);
    assert!(ready
        .iter()
        .all(|o| matches!(o, WorkerOutcome::Completed(_))));
    assert!(batch.next().await.is_none());
}
