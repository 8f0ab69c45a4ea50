//! Parallel patch evaluator.
//!
//! A batch runs each submitted candidate on a worker: acquire a sandbox,
//! apply the diff, run the focused tests, and only if they pass run the full
//! suite. At most `workers` candidates run at once, each in its own sandbox.
//! Results come back in completion order; results that complete together are
//! ordered by worker slot.
//!
//! Cancelling a batch drops every worker future. Dropping a worker kills the
//! running command's process group and releases its sandbox.

use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::budget::BudgetExceeded;
use crate::buildpack::{BuildSpec, Buildpack};
use crate::domain::{Candidate, Evidence, Finding, PatchError, TestResults, UnifiedPatch};
use crate::metrics::Metrics;
use crate::qa::{EvaluationTarget, StaticScanner};
use crate::sandbox::{SandboxError, SandboxInstance, SandboxManager};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Concurrent workers (`K`).
    pub workers: usize,
    pub focused_timeout_ms: u64,
    pub full_timeout_ms: u64,
    /// Full-suite reruns used to tell flaky failures from real ones.
    pub flaky_reruns: u32,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            focused_timeout_ms: 300_000,
            full_timeout_ms: 900_000,
            flaky_reruns: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EvaluationResult {
    pub slot: usize,
    pub candidate: Candidate,
    pub evidence: Evidence,
}

/// How a worker ended.
#[derive(Debug)]
pub enum WorkerOutcome {
    Completed(EvaluationResult),
    /// The sandbox could not be provided; fatal for the run.
    Infrastructure {
        slot: usize,
        candidate: Candidate,
        error: SandboxError,
    },
    /// A subprocess was refused by the budget gate.
    Budget {
        slot: usize,
        candidate: Candidate,
        error: BudgetExceeded,
    },
    /// The worker panicked; treated as a rejected candidate.
    Crashed {
        slot: usize,
        candidate: Candidate,
        reason: String,
    },
}

impl WorkerOutcome {
    pub fn slot(&self) -> usize {
        match self {
            Self::Completed(r) => r.slot,
            Self::Infrastructure { slot, .. }
            | Self::Budget { slot, .. }
            | Self::Crashed { slot, .. } => *slot,
        }
    }

    pub fn candidate(&self) -> &Candidate {
        match self {
            Self::Completed(r) => &r.candidate,
            Self::Infrastructure { candidate, .. }
            | Self::Budget { candidate, .. }
            | Self::Crashed { candidate, .. } => candidate,
        }
    }
}

enum TaskExit {
    Finished(WorkerOutcome),
    Cancelled(Candidate),
}

/// Lowest-free-index slot allocator.
#[derive(Clone)]
struct SlotPool {
    free: Arc<Mutex<BTreeSet<usize>>>,
}

impl SlotPool {
    fn new(size: usize) -> Self {
        Self {
            free: Arc::new(Mutex::new((0..size).collect())),
        }
    }

    fn take(&self) -> SlotGuard {
        let slot = {
            let mut free = match self.free.lock() {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
            // the worker semaphore guarantees a free slot
            free.pop_first().unwrap_or(usize::MAX)
        };
        SlotGuard {
            slot,
            pool: self.clone(),
        }
    }
}

struct SlotGuard {
    slot: usize,
    pool: SlotPool,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Ok(mut free) = self.pool.free.lock() {
            free.insert(self.slot);
        }
    }
}

struct WorkerContext {
    sandboxes: Arc<SandboxManager>,
    buildpack: Arc<dyn Buildpack>,
    spec: BuildSpec,
    scanner: StaticScanner,
    config: EvaluatorConfig,
    metrics: Arc<Metrics>,
    target: EvaluationTarget,
}

pub struct ParallelEvaluator {
    sandboxes: Arc<SandboxManager>,
    buildpack: Arc<dyn Buildpack>,
    spec: BuildSpec,
    scanner: StaticScanner,
    config: EvaluatorConfig,
    metrics: Arc<Metrics>,
}

impl ParallelEvaluator {
    pub fn new(
        sandboxes: Arc<SandboxManager>,
        buildpack: Arc<dyn Buildpack>,
        spec: BuildSpec,
        scanner: StaticScanner,
        config: EvaluatorConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            sandboxes,
            buildpack,
            spec,
            scanner,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// Open a batch of evaluations against one target.
    pub fn start(&self, target: EvaluationTarget) -> EvaluationBatch {
        let workers = self.config.workers.max(1);
        let (cancel, _) = watch::channel(false);
        EvaluationBatch {
            ctx: Arc::new(WorkerContext {
                sandboxes: Arc::clone(&self.sandboxes),
                buildpack: Arc::clone(&self.buildpack),
                spec: self.spec.clone(),
                scanner: self.scanner.clone(),
                config: self.config.clone(),
                metrics: Arc::clone(&self.metrics),
                target,
            }),
            tasks: JoinSet::new(),
            workers: Arc::new(Semaphore::new(workers)),
            slots: SlotPool::new(workers),
            cancel,
        }
    }
}

/// In-flight evaluations for one step cycle.
pub struct EvaluationBatch {
    ctx: Arc<WorkerContext>,
    tasks: JoinSet<TaskExit>,
    workers: Arc<Semaphore>,
    slots: SlotPool,
    cancel: watch::Sender<bool>,
}

impl EvaluationBatch {
    pub fn submit(&mut self, candidate: Candidate) {
        self.spawn(candidate, 1);
    }

    /// Evaluate an escalated candidate a second time.
    pub fn resubmit(&mut self, candidate: Candidate) {
        self.spawn(candidate, 2);
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    fn spawn(&mut self, candidate: Candidate, attempt: u32) {
        let ctx = Arc::clone(&self.ctx);
        let workers = Arc::clone(&self.workers);
        let slots = self.slots.clone();
        let mut cancelled = self.cancel.subscribe();

        self.tasks.spawn(async move {
            let work = async {
                let Ok(_permit) = workers.acquire_owned().await else {
                    return None;
                };
                let slot = slots.take();
                let outcome = AssertUnwindSafe(evaluate(&ctx, slot.slot, &candidate, attempt))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| WorkerOutcome::Crashed {
                        slot: slot.slot,
                        candidate: candidate.clone(),
                        reason: panic_message(&*panic),
                    });
                Some(outcome)
            };
            tokio::select! {
                biased;
                _ = wait_cancelled(&mut cancelled) => TaskExit::Cancelled(candidate.clone()),
                outcome = work => match outcome {
                    Some(outcome) => TaskExit::Finished(outcome),
                    None => TaskExit::Cancelled(candidate.clone()),
                },
            }
        });
    }

    /// Wait for the next completion. Every other worker that has already
    /// finished is returned with it, ordered by slot. `None` once the batch
    /// is empty.
    pub async fn next(&mut self) -> Option<Vec<WorkerOutcome>> {
        loop {
            let first = self.tasks.join_next().await?;
            let mut ready = Vec::new();
            collect_exit(first, &mut ready);
            while let Some(Some(more)) = self.tasks.join_next().now_or_never() {
                collect_exit(more, &mut ready);
            }
            if !ready.is_empty() {
                ready.sort_by_key(WorkerOutcome::slot);
                return Some(ready);
            }
        }
    }

    /// Cancel every in-flight evaluation and wait until their sandboxes are
    /// released. Returns the candidates that were cut short.
    pub async fn cancel_all(&mut self) -> Vec<Candidate> {
        if self.tasks.is_empty() {
            return Vec::new();
        }
        let _ = self.cancel.send(true);
        let mut cancelled = Vec::new();
        while let Some(exit) = self.tasks.join_next().await {
            match exit {
                Ok(TaskExit::Cancelled(candidate)) => cancelled.push(candidate),
                Ok(TaskExit::Finished(outcome)) => {
                    // finished in the same instant the signal went out
                    cancelled.push(outcome.candidate().clone())
                }
                Err(e) => warn!(error = %e, "evaluation task failed during cancellation"),
            }
        }
        for candidate in &cancelled {
            self.ctx.metrics.inc_cancelled();
            debug!(candidate_id = %candidate.id(), "evaluation cancelled");
        }
        cancelled
    }
}

fn collect_exit(
    exit: Result<TaskExit, tokio::task::JoinError>,
    ready: &mut Vec<WorkerOutcome>,
) {
    match exit {
        Ok(TaskExit::Finished(outcome)) => ready.push(outcome),
        Ok(TaskExit::Cancelled(candidate)) => {
            debug!(candidate_id = %candidate.id(), "cancelled evaluation drained")
        }
        Err(e) => warn!(error = %e, "evaluation task aborted"),
    }
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // batch dropped; the JoinSet aborts us
            std::future::pending::<()>().await;
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "worker panicked".to_string())
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

#[instrument(skip_all, fields(candidate_id = %candidate.id(), slot = slot, attempt = attempt))]
async fn evaluate(
    ctx: &WorkerContext,
    slot: usize,
    candidate: &Candidate,
    attempt: u32,
) -> WorkerOutcome {
    let started = Instant::now();
    let sandbox = match ctx.sandboxes.acquire().await {
        Ok(sandbox) => sandbox,
        Err(error) => {
            warn!(error = %error, "sandbox unavailable");
            return WorkerOutcome::Infrastructure {
                slot,
                candidate: candidate.clone(),
                error,
            };
        }
    };

    let mut evidence = Evidence::new(candidate.id().clone(), attempt, candidate.stats());
    evidence.findings = ctx.scanner.scan(&evidence.diff);

    let outcome = match run_tests(ctx, &sandbox, candidate, &mut evidence).await {
        Ok(()) => {
            evidence.total_ms = started.elapsed().as_millis() as u64;
            ctx.metrics.inc_evaluated();
            crate::obs::emit_candidate_evaluated(
                candidate.id().as_str(),
                slot,
                evidence.applied(),
                evidence.total_ms,
            );
            WorkerOutcome::Completed(EvaluationResult {
                slot,
                candidate: candidate.clone(),
                evidence,
            })
        }
        Err(error) => WorkerOutcome::Budget {
            slot,
            candidate: candidate.clone(),
            error,
        },
    };
    ctx.sandboxes.release(sandbox);
    outcome
}

/// Apply the patch and run focused then full tests, filling `evidence`.
/// Only a budget refusal is an error; everything else is evidence.
async fn run_tests(
    ctx: &WorkerContext,
    sandbox: &SandboxInstance,
    candidate: &Candidate,
    evidence: &mut Evidence,
) -> Result<(), BudgetExceeded> {
    let diff = candidate.diff().to_string();
    let root = sandbox.workdir().to_path_buf();
    let applied =
        tokio::task::spawn_blocking(move || UnifiedPatch::parse(&diff)?.apply_to(&root)).await;
    match applied {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            info!(error = %e, "patch did not apply");
            if matches!(e, PatchError::Escapes(_) | PatchError::UnsafePath(_)) {
                evidence.findings.push(Finding {
                    rule: "path-escape".into(),
                    message: e.to_string(),
                });
            }
            evidence.apply_error = Some(e.to_string());
            return Ok(());
        }
        Err(e) => {
            evidence.apply_error = Some(format!("patch task failed: {e}"));
            return Ok(());
        }
    }

    let targets = &ctx.target.failing_tests;
    let targets_vec: Vec<String> = targets.iter().cloned().collect();
    let focused_argv = ctx.buildpack.focused_test_cmd(&ctx.spec, &targets_vec);
    let focused_started = Instant::now();
    let focused = run_suite(ctx, sandbox, &focused_argv, ctx.config.focused_timeout_ms).await?;
    evidence.focused_ms = focused_started.elapsed().as_millis() as u64;
    let focused_ok = !focused.timed_out && targets.iter().all(|t| focused.outcome(t) == Some(true));
    evidence.focused = Some(focused);
    if !focused_ok {
        debug!("focused tests failed; skipping full suite");
        return Ok(());
    }

    let full_started = Instant::now();
    let full = run_suite(ctx, sandbox, &ctx.spec.test_cmd, ctx.config.full_timeout_ms).await?;
    if !full.timed_out && needs_rerun(&full, &ctx.target) {
        for _ in 0..ctx.config.flaky_reruns {
            let rerun = run_suite(ctx, sandbox, &ctx.spec.test_cmd, ctx.config.full_timeout_ms).await?;
            if rerun.timed_out {
                continue;
            }
            for test in full.failed.iter().chain(&rerun.failed) {
                if full.outcome(test) != rerun.outcome(test) {
                    evidence.flaky_tests.insert(test.clone());
                }
            }
        }
        if !evidence.flaky_tests.is_empty() {
            warn!(flaky = ?evidence.flaky_tests, "non-reproducible test results");
        }
    }
    evidence.full_ms = full_started.elapsed().as_millis() as u64;
    evidence.full = Some(full);
    Ok(())
}

async fn run_suite(
    ctx: &WorkerContext,
    sandbox: &SandboxInstance,
    argv: &[String],
    timeout_ms: u64,
) -> Result<TestResults, BudgetExceeded> {
    let output = match ctx
        .sandboxes
        .run(sandbox, argv, Duration::from_millis(timeout_ms))
        .await
    {
        Ok(output) => output,
        Err(SandboxError::Budget(exceeded)) => return Err(exceeded),
        Err(e) => {
            warn!(error = %e, "test command could not run");
            return Ok(attribute_aggregate(TestResults::aggregate(-1), &ctx.target));
        }
    };
    let results = ctx.buildpack.parse_test_output(&output);
    Ok(attribute_aggregate(results, &ctx.target))
}

/// A runner that only reports an exit code says nothing per test; credit
/// its outcome to the target tests.
fn attribute_aggregate(mut results: TestResults, target: &EvaluationTarget) -> TestResults {
    if results.timed_out || !results.is_aggregate() {
        return results;
    }
    if results.all_passed() {
        results.passed.extend(target.failing_tests.iter().cloned());
    } else {
        results.failed.extend(target.failing_tests.iter().cloned());
    }
    results
}

fn needs_rerun(full: &TestResults, target: &EvaluationTarget) -> bool {
    full.failed
        .iter()
        .any(|t| target.baseline_passing.contains(t) || target.failing_tests.contains(t))
}
