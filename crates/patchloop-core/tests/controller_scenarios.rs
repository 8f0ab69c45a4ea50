//! End-to-end runs of the controller loop against a tiny shell project.
//!
//! The fixture's `run_tests.sh` reads `value.txt` and prints libtest-style
//! lines: `tests::target` passes only when the value is `fixed`, and the
//! value `slow` makes the script sleep first. With the value `flaky` the
//! target passes but `tests::baseline` fails on every second invocation
//! inside a sandbox, so a full run and its rerun disagree.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use patchloop_core::buildpack::parse_libtest_output;
use patchloop_core::domain::PlanResult;
use patchloop_core::sandbox::CommandOutput;
use patchloop_core::{
    BudgetState, BuildSpec, Buildpack, ClaimKind, Controller, Goal, Metrics, PatternPlanner,
    PlanSource, Planner, PlanningContext, QaDecision, RunConfig, RunStatus, ScriptedProvider,
    ScriptedReply, StepPlan, StepState, TerminationReason, TestResults, Verdict,
};
use patchloop_state::fakes::{MemoryOutcomeStore, MemoryPlanStore};
use patchloop_state::OutcomeStore;
use tempfile::TempDir;

const RUN_TESTS: &str = r#"v=$(cat value.txt)
if [ "$v" = slow ]; then sleep 30; fi
if [ "$v" = flaky ]; then
  n=$(( $(cat runs.txt 2>/dev/null || echo 0) + 1 ))
  echo $n > runs.txt
  echo "test tests::target ... ok"
  if [ $((n % 2)) -eq 0 ]; then
    echo "test tests::baseline ... FAILED"
    exit 101
  fi
  echo "test tests::baseline ... ok"
  exit 0
fi
echo "test tests::baseline ... ok"
if [ "$v" = fixed ]; then
  echo "test tests::target ... ok"
  exit 0
fi
echo "test tests::target ... FAILED"
echo "assertion failed: value == fixed" >&2
exit 101
"#;

struct ShellBuildpack;

impl Buildpack for ShellBuildpack {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn detect(&self, path: &Path) -> bool {
        path.join("run_tests.sh").exists()
    }

    fn build_spec(&self, _path: &Path) -> BuildSpec {
        let argv = vec!["sh".to_string(), "run_tests.sh".to_string()];
        BuildSpec {
            language: "shell".into(),
            build_cmd: Vec::new(),
            test_cmd: argv.clone(),
            focused_test_cmd: argv,
            source_globs: vec!["*.txt".into()],
        }
    }

    fn parse_test_output(&self, output: &CommandOutput) -> TestResults {
        parse_libtest_output(output)
    }
}

/// Counts decompositions so cache reuse is observable.
struct CountingPlanner {
    inner: PatternPlanner,
    calls: AtomicU32,
}

#[async_trait]
impl Planner for CountingPlanner {
    async fn decompose(&self, goal: &Goal, context: &PlanningContext) -> PlanResult<StepPlan> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.decompose(goal, context).await
    }

    fn last_source(&self) -> PlanSource {
        PlanSource::Pattern
    }
}

fn fixture() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("run_tests.sh"), RUN_TESTS).unwrap();
    std::fs::write(dir.path().join("value.txt"), "broken\n").unwrap();
    dir
}

fn set_value(to: &str) -> String {
    format!(
        "diff --git a/value.txt b/value.txt\n--- a/value.txt\n+++ b/value.txt\n@@ -1 +1 @@\n-broken\n+{to}\n"
    )
}

fn goal() -> Goal {
    Goal::new(
        "Fix the failing target test",
        vec!["sh".into(), "run_tests.sh".into()],
    )
    .unwrap()
}

fn config() -> RunConfig {
    let mut config = RunConfig::default();
    config.bandit.seed = Some(7);
    config.evaluator.focused_timeout_ms = 60_000;
    config.evaluator.full_timeout_ms = 60_000;
    config
}

fn provider(id: &str, replies: Vec<ScriptedReply>) -> Arc<ScriptedProvider> {
    Arc::new(ScriptedProvider::new(id, replies))
}

fn value(dir: &TempDir) -> String {
    std::fs::read_to_string(dir.path().join("value.txt"))
        .unwrap()
        .trim()
        .to_string()
}

#[tokio::test]
async fn single_fix_is_accepted_and_applied() {
    let repo = fixture();
    let controller = Controller::builder(repo.path())
        .config(config())
        .buildpack(Arc::new(ShellBuildpack))
        .provider(provider("primary", vec![ScriptedReply::patch(set_value("fixed"))]))
        .build()
        .unwrap();

    let report = controller.run(&goal()).await;

    assert_eq!(report.status, RunStatus::Done);
    assert_eq!(report.reason, TerminationReason::Applied);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(value(&repo), "fixed");
    assert_eq!(report.failing_tests, vec!["tests::target".to_string()]);
    assert!(report.applied_patch.as_deref().unwrap().contains("+fixed"));

    let accepted: Vec<_> = report
        .audit
        .iter()
        .filter(|a| a.decision == Some(QaDecision::Accept))
        .collect();
    assert_eq!(accepted.len(), 1);
    for kind in ClaimKind::ALL {
        let claim = accepted[0].claims.iter().find(|c| c.kind == kind).unwrap();
        assert_eq!(claim.verdict, Verdict::Pass, "{kind:?}: {}", claim.rationale);
    }

    let state = |id: &str| report.steps.iter().find(|s| s.id == id).unwrap().state;
    assert_eq!(state("analyze-failure"), StepState::Succeeded);
    assert_eq!(state("propose-fix"), StepState::Succeeded);
    assert_eq!(state("verify-full"), StepState::Succeeded);
    assert_eq!(controller.metrics().sandboxes_acquired(), controller.metrics().sandboxes_released());
}

#[tokio::test]
async fn passing_project_has_nothing_to_repair() {
    let repo = fixture();
    std::fs::write(repo.path().join("value.txt"), "fixed\n").unwrap();
    let primary = provider("primary", vec![ScriptedReply::patch(set_value("fixed"))]);
    let controller = Controller::builder(repo.path())
        .config(config())
        .buildpack(Arc::new(ShellBuildpack))
        .provider(primary.clone())
        .build()
        .unwrap();

    let report = controller.run(&goal()).await;
    assert_eq!(report.reason, TerminationReason::NothingToRepair);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(primary.calls(), 0);
}

#[tokio::test]
async fn fourth_step_exceeds_enforced_budget() {
    let repo = fixture();
    let mut config = config();
    config.budget.limits.max_steps = Some(3);
    config.budget.enforce = true;
    config.halt.max_stalled_cycles = 10;
    let controller = Controller::builder(repo.path())
        .config(config)
        .buildpack(Arc::new(ShellBuildpack))
        .provider(provider("primary", vec![ScriptedReply::patch(set_value("wrong"))]))
        .build()
        .unwrap();

    let report = controller.run(&goal()).await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.reason.as_str(), "budget_exceeded");
    assert_eq!(report.exit_code(), 2);
    assert_eq!(report.cycles, 3);
    assert_eq!(report.budget.steps, 3);
    assert_eq!(value(&repo), "broken");
    let state = |id: &str| report.steps.iter().find(|s| s.id == id).unwrap().state;
    assert_eq!(state("propose-fix"), StepState::Failed);
    assert_eq!(state("verify-full"), StepState::Skipped);
}

#[tokio::test]
async fn unenforced_budget_runs_past_its_limit_until_exhausted() {
    let repo = fixture();
    let mut config = config();
    config.budget.limits.max_steps = Some(1);
    config.budget.enforce = false;
    config.halt.max_stalled_cycles = 10;
    let controller = Controller::builder(repo.path())
        .config(config)
        .buildpack(Arc::new(ShellBuildpack))
        .provider(provider("primary", vec![ScriptedReply::patch(set_value("wrong"))]))
        .build()
        .unwrap();

    let report = controller.run(&goal()).await;

    // steps 2 and 3 exceed the limit without stopping; the third overrun exhausts
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.reason.as_str(), "budget_exceeded");
    assert_eq!(report.cycles, 3);
    assert_eq!(report.budget.state, BudgetState::Exhausted);
    assert_eq!(report.budget.steps, 4);
    assert_eq!(report.budget.exceeded_attempts, 3);
    assert!(!report.budget.enforce);
    assert_eq!(value(&repo), "broken");
}

#[tokio::test]
async fn flaky_candidate_is_rerun_then_rejected_and_the_run_continues() {
    let repo = fixture();
    let primary = provider(
        "primary",
        vec![
            ScriptedReply::patch(set_value("flaky")),
            ScriptedReply::patch(set_value("fixed")),
        ],
    );
    let controller = Controller::builder(repo.path())
        .config(config())
        .buildpack(Arc::new(ShellBuildpack))
        .provider(primary.clone())
        .build()
        .unwrap();

    let report = controller.run(&goal()).await;

    assert_eq!(report.status, RunStatus::Done, "{}", report.summary());
    assert_eq!(value(&repo), "fixed");
    assert_eq!(report.cycles, 2);
    assert_eq!(primary.calls(), 2);

    let flaky: Vec<_> = report.audit.iter().filter(|a| a.cycle == 1).collect();
    assert_eq!(flaky.len(), 2);
    assert!(flaky.iter().all(|a| a.candidate_id == flaky[0].candidate_id));
    assert_eq!((flaky[0].attempt, flaky[1].attempt), (1, 2));
    assert_eq!(flaky[0].decision, Some(QaDecision::Escalate));
    assert_eq!(flaky[1].decision, Some(QaDecision::Reject));
    let evidence = flaky[1].evidence.as_ref().unwrap();
    assert_eq!(evidence.flaky_tests, vec!["tests::baseline".to_string()]);
    let regression = flaky[1]
        .claims
        .iter()
        .find(|c| c.kind == ClaimKind::NoRegression)
        .unwrap();
    assert_eq!(regression.verdict, Verdict::Inconclusive);

    assert_eq!(controller.metrics().decisions(QaDecision::Escalate), 2);
}

#[tokio::test]
async fn accepted_fix_is_not_lost_to_rejected_alternatives_scope() {
    let repo = fixture();
    let mut config = config();
    config.halt.scope_growth_ratio = 1.0;
    let stray = "--- /dev/null\n+++ b/other.txt\n@@ -0,0 +1 @@\n+unrelated\n";
    let fix = format!(
        "{}--- /dev/null\n+++ b/notes.txt\n@@ -0,0 +1 @@\n+value is fixed\n",
        set_value("fixed")
    );
    let controller = Controller::builder(repo.path())
        .config(config)
        .buildpack(Arc::new(ShellBuildpack))
        .provider(provider(
            "primary",
            vec![ScriptedReply::patch(stray), ScriptedReply::patch(fix)],
        ))
        .build()
        .unwrap();

    let report = controller.run(&goal()).await;

    // the rejected stray file and the two-file fix together exceed 1.0x
    // the first diff, but only applied patches count towards scope growth
    assert_eq!(report.status, RunStatus::Done, "{}", report.summary());
    assert_eq!(report.cycles, 2);
    assert_eq!(value(&repo), "fixed");
    assert!(repo.path().join("notes.txt").exists());
    assert!(!repo.path().join("other.txt").exists());

    assert_eq!(report.artifacts.len(), 1);
    let artifact = &report.artifacts[0];
    assert_eq!(artifact.step_id, "propose-fix");
    assert_eq!(
        artifact.files,
        vec!["notes.txt".to_string(), "value.txt".to_string()]
    );
}

#[tokio::test]
async fn repeated_rejections_without_progress_halt() {
    let repo = fixture();
    let mut config = config();
    config.halt.max_stalled_cycles = 2;
    let controller = Controller::builder(repo.path())
        .config(config)
        .buildpack(Arc::new(ShellBuildpack))
        .provider(provider("primary", vec![ScriptedReply::patch(set_value("wrong"))]))
        .build()
        .unwrap();

    let report = controller.run(&goal()).await;

    assert_eq!(report.status, RunStatus::Halted);
    assert_eq!(report.reason.as_str(), "halt_triggered");
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.cycles, 2);
}

#[tokio::test]
async fn first_accept_cancels_the_other_evaluation() {
    let repo = fixture();
    let outcomes = Arc::new(MemoryOutcomeStore::new());
    let controller = Controller::builder(repo.path())
        .config(config())
        .buildpack(Arc::new(ShellBuildpack))
        .provider(provider("primary", vec![ScriptedReply::patch(set_value("fixed"))]))
        .provider(provider("secondary", vec![ScriptedReply::patch(set_value("slow"))]))
        .outcome_store(outcomes.clone())
        .build()
        .unwrap();

    let report = controller.run(&goal()).await;

    assert_eq!(report.status, RunStatus::Done);
    assert!(report.duration_ms < 20_000, "slow candidate was not stopped");
    let slow = report
        .audit
        .iter()
        .find(|a| a.provider == "secondary")
        .unwrap();
    assert!(slow.cancelled);
    assert_eq!(slow.decision, None);
    assert_eq!(controller.metrics().cancelled(), 1);
    assert_eq!(controller.metrics().sandboxes_acquired(), controller.metrics().sandboxes_released());

    // one outcome for the accepted cycle; nothing for the cancelled work
    let stats = outcomes.query("test").await.unwrap();
    assert_eq!(stats.total(), 1);
    assert_eq!(outcomes.len(), 1);
}

#[tokio::test]
async fn secondary_result_is_used_when_primary_times_out() {
    let repo = fixture();
    let mut config = config();
    config.ensemble.provider_timeout_ms = 200;
    let controller = Controller::builder(repo.path())
        .config(config)
        .buildpack(Arc::new(ShellBuildpack))
        .provider(provider("primary", vec![ScriptedReply::Hang]))
        .provider(provider("secondary", vec![ScriptedReply::patch(set_value("fixed"))]))
        .build()
        .unwrap();

    let report = controller.run(&goal()).await;

    assert_eq!(report.status, RunStatus::Done);
    let accepted = report
        .audit
        .iter()
        .find(|a| a.decision == Some(QaDecision::Accept))
        .unwrap();
    assert_eq!(accepted.provider, "secondary");
    assert!(accepted.fallback_used);
    assert_eq!(controller.metrics().fallbacks_used(), 1);
}

#[tokio::test]
async fn identical_goal_is_served_from_plan_cache() {
    let plans = Arc::new(MemoryPlanStore::new());
    let planner = Arc::new(CountingPlanner {
        inner: PatternPlanner::new(0),
        calls: AtomicU32::new(0),
    });
    let metrics = Arc::new(Metrics::new());

    let mut reports = Vec::new();
    for _ in 0..2 {
        let repo = fixture();
        let controller = Controller::builder(repo.path())
            .config(config())
            .buildpack(Arc::new(ShellBuildpack))
            .provider(provider("primary", vec![ScriptedReply::patch(set_value("fixed"))]))
            .planner(planner.clone())
            .plan_store(plans.clone())
            .metrics(metrics.clone())
            .build()
            .unwrap();
        reports.push(controller.run(&goal()).await);
    }

    assert_eq!(planner.calls.load(Ordering::SeqCst), 1);
    assert_eq!(reports[0].plan_source, Some(PlanSource::Pattern));
    assert_eq!(reports[1].plan_source, Some(PlanSource::Cache));
    assert_eq!(reports[0].plan_id, reports[1].plan_id);
    assert!(reports.iter().all(|r| r.status == RunStatus::Done));
    assert_eq!(metrics.cache_hits(), 1);
    assert_eq!(metrics.cache_misses(), 1);
    assert_eq!(metrics.plans(PlanSource::Cache), 1);
}

#[tokio::test]
async fn report_artifact_is_written_and_verified() {
    let repo = fixture();
    let artifacts = tempfile::tempdir().unwrap();
    let controller = Controller::builder(repo.path())
        .config(config())
        .buildpack(Arc::new(ShellBuildpack))
        .provider(provider("primary", vec![ScriptedReply::patch(set_value("fixed"))]))
        .build()
        .unwrap();

    let report = controller.run(&goal()).await;
    patchloop_core::write_report_artifact(&report, artifacts.path()).unwrap();
    let read = patchloop_core::read_report_artifact(&report.run_id, artifacts.path()).unwrap();
    assert_eq!(read, report);
    assert!(read.metrics.contains("plans_total{source=\"pattern\"} 1"));

    // the step record pins the applied diff and the tree it produced
    let artifact = &read.artifacts[0];
    assert_eq!(artifact.diff_digest.len(), 64);
    assert_eq!(artifact.files, vec!["value.txt".to_string()]);
    let excluded = config().sandbox.excluded_dirs;
    let fingerprint = patchloop_core::repo_fingerprint(repo.path(), &excluded).unwrap();
    assert_eq!(artifact.repo_fingerprint.as_deref(), Some(fingerprint.as_str()));

    let listed = patchloop_core::list_report_artifacts(artifacts.path()).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].run_id, report.run_id);
    assert_eq!(listed[0].plan.steps, 6);
    assert_eq!(listed[0].plan.succeeded, 6);
    assert_eq!(listed[0].plan.files_touched.len(), 1);
}
