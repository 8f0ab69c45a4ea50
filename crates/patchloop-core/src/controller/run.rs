//! One run of the controller loop.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use super::state::{ControllerState, RunStatus, TerminationReason};
use super::Controller;
use crate::budget::{BudgetExceeded, BudgetGate};
use crate::buildpack::BuildSpec;
use crate::domain::{
    Candidate, CandidateId, ErrorType, Goal, GoalSignature, QaDecision, QaVerdict, StepKind,
    StepState, UnifiedPatch, Verdict, SUITE_TEST,
};
use crate::ensemble::{EnsembleCoordinator, EnsembleError};
use crate::evaluator::{EvaluationResult, ParallelEvaluator, WorkerOutcome};
use crate::halt::{HaltChecker, HaltReason};
use crate::memory::RepairAction;
use crate::metrics::PlanSource;
use crate::obs;
use crate::plan_cache::CacheHit;
use crate::planner::PlanningContext;
use crate::provider::{PatchConstraints, RepairContext};
use crate::qa::EvaluationTarget;
use crate::report::{repo_fingerprint, AuditEntry, EvidenceSummary, RunReport, StepArtifact, StepRecord};
use crate::sandbox::{SandboxError, SandboxManager};

/// Rejection reasons handed back to providers.
const MAX_REJECTIONS: usize = 5;
/// Characters of failing output kept as the excerpt.
const EXCERPT_CHARS: usize = 2000;

type Stop = TerminationReason;

fn budget_stop(e: BudgetExceeded) -> Stop {
    TerminationReason::BudgetExceeded {
        resource: e.resource,
        detail: e.to_string(),
    }
}

fn sandbox_stop(e: SandboxError) -> Stop {
    match e {
        SandboxError::Budget(e) => budget_stop(e),
        other => TerminationReason::SandboxFailure {
            detail: other.to_string(),
        },
    }
}

/// What DETECTING learned about the project.
#[derive(Debug, Clone)]
struct FailureContext {
    error_type: ErrorType,
    failing: BTreeSet<String>,
    passing: BTreeSet<String>,
    excerpt: String,
}

fn failure_signature(error_type: ErrorType, failing: &BTreeSet<String>) -> String {
    let tests: Vec<&str> = failing.iter().map(String::as_str).collect();
    format!("{error_type}:{}", tests.join(","))
}

fn tail(text: &str, chars: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(chars)).collect()
}

/// Outcome of one QUERYING..QA_REVIEW cycle that did not stop the run.
struct CycleOutcome {
    accepted: Option<EvaluationResult>,
    /// Smallest set of target tests still failing under any candidate.
    remaining: BTreeSet<String>,
    rejections: Vec<String>,
    evaluated: usize,
}

/// A repeated INCONCLUSIVE counts as a rejection.
fn effective_decision(decision: QaDecision, attempt: u32) -> QaDecision {
    if decision == QaDecision::Escalate && attempt >= 2 {
        QaDecision::Reject
    } else {
        decision
    }
}

fn rejection_summary(verdict: &QaVerdict) -> String {
    let failed: Vec<String> = verdict
        .claims
        .iter()
        .filter(|c| c.verdict != Verdict::Pass)
        .map(|c| format!("{:?}: {}", c.kind, c.rationale))
        .collect();
    failed.join("; ")
}

struct Run<'a> {
    ctl: &'a Controller,
    goal: &'a Goal,
    run_id: String,
    started: Instant,
    started_at: chrono::DateTime<Utc>,
    state: ControllerState,
    budget: Arc<BudgetGate>,
    halt: HaltChecker,
    /// Scope growth seen when a patch was applied; stops the next step.
    scope_halt: Option<HaltReason>,
    cached: Option<CacheHit>,
    plan: Option<crate::domain::StepPlan>,
    plan_source: Option<PlanSource>,
    /// Signature the plan is filed under in the cache.
    cache_key: GoalSignature,
    failure: Option<FailureContext>,
    audit: Vec<AuditEntry>,
    applied: Vec<String>,
    artifacts: Vec<StepArtifact>,
    cycles: u32,
}

pub(super) async fn execute(ctl: &Controller, run_id: String, goal: &Goal) -> RunReport {
    obs::emit_run_started(&run_id, goal.intent());
    let budget = Arc::new(BudgetGate::new(ctl.config.budget.clone()));
    let mut run = Run {
        ctl,
        goal,
        run_id,
        started: Instant::now(),
        started_at: Utc::now(),
        state: ControllerState::Detecting,
        budget: Arc::clone(&budget),
        halt: HaltChecker::new(ctl.config.halt.clone()),
        scope_halt: None,
        cached: None,
        plan: None,
        plan_source: None,
        cache_key: goal.signature(),
        failure: None,
        audit: Vec::new(),
        applied: Vec::new(),
        artifacts: Vec::new(),
        cycles: 0,
    };

    let reason = match SandboxManager::new(
        &ctl.repo,
        ctl.config.sandbox.clone(),
        budget,
        Arc::clone(&ctl.metrics),
    ) {
        Ok(sandboxes) => match run.drive(Arc::new(sandboxes)).await {
            Ok(reason) | Err(reason) => reason,
        },
        Err(e) => sandbox_stop(e),
    };
    run.finish(reason).await
}

impl Run<'_> {
    // -----------------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------------

    /// Budget-checked move to a live state.
    fn transition(&mut self, next: ControllerState) -> Result<(), Stop> {
        self.budget.check_step().map_err(budget_stop)?;
        self.move_to(next);
        Ok(())
    }

    fn move_to(&mut self, next: ControllerState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            warn!(from = %self.state, to = %next, "unexpected controller transition");
        }
        obs::emit_state_transition(&self.run_id, self.state.as_str(), next.as_str());
        self.state = next;
    }

    fn set_step(&mut self, step_id: &str, to: StepState) {
        let Some(step) = self.plan.as_mut().and_then(|p| p.step_mut(step_id)) else {
            return;
        };
        if let Err(e) = step.transition(to) {
            warn!(error = %e, "step transition refused");
        }
    }

    fn steps_of(&self, kind: StepKind) -> Vec<String> {
        self.plan
            .as_ref()
            .map(|p| p.ids_of(kind))
            .unwrap_or_default()
    }

    async fn drive(&mut self, sandboxes: Arc<SandboxManager>) -> Result<Stop, Stop> {
        self.cached = self.ctl.plan_cache.lookup(&self.cache_key).await;

        let spec = self.ctl.spec_for(self.goal);
        let failure = self.detect(&sandboxes, &spec).await?;
        self.failure = Some(failure.clone());
        if failure.failing.is_empty() {
            info!("test command passes; nothing to repair");
            return Ok(TerminationReason::NothingToRepair);
        }

        self.plan(&spec, &failure).await?;
        for step_id in self.steps_of(StepKind::Analyze) {
            self.set_step(&step_id, StepState::Running);
            self.set_step(&step_id, StepState::Succeeded);
        }

        let evaluator = ParallelEvaluator::new(
            Arc::clone(&sandboxes),
            Arc::clone(&self.ctl.buildpack),
            spec,
            self.ctl.scanner.clone(),
            self.ctl.config.evaluator.clone(),
            Arc::clone(&self.ctl.metrics),
        );
        let ensemble = EnsembleCoordinator::new(
            self.ctl.providers.clone(),
            self.ctl.config.ensemble.clone(),
            Arc::clone(&self.budget),
            Arc::clone(&self.ctl.metrics),
        );

        let mut target = EvaluationTarget {
            failing_tests: failure.failing.clone(),
            baseline_passing: failure.passing.clone(),
        };
        let mut last_accepted: Option<EvaluationResult> = None;
        for step_id in self.steps_of(StepKind::Patch) {
            if target.failing_tests.is_empty() {
                debug!(step_id = %step_id, "no failing tests left; skipping patch step");
                self.set_step(&step_id, StepState::Skipped);
                continue;
            }
            if let Some(halt) = self.scope_halt.take() {
                return Err(TerminationReason::HaltTriggered { halt });
            }
            self.set_step(&step_id, StepState::Running);
            match self
                .repair_step(&step_id, &target, &failure, &ensemble, &evaluator)
                .await
            {
                Ok(result) => {
                    self.set_step(&step_id, StepState::Succeeded);
                    self.ctl.metrics.inc_step(true);
                    target.failing_tests = result.evidence.remaining_failures(&target.failing_tests);
                    if let Some(full) = &result.evidence.full {
                        target.baseline_passing = full.passed.clone();
                    }
                    last_accepted = Some(result);
                }
                Err(stop) => {
                    self.set_step(&step_id, StepState::Failed);
                    self.ctl.metrics.inc_step(false);
                    return Err(stop);
                }
            }
        }

        for step_id in self.steps_of(StepKind::Verify) {
            match &last_accepted {
                Some(result) => {
                    let verified =
                        result.evidence.focused.is_some() && result.evidence.full.is_some();
                    self.set_step(&step_id, StepState::Running);
                    self.set_step(
                        &step_id,
                        if verified {
                            StepState::Succeeded
                        } else {
                            StepState::Failed
                        },
                    );
                }
                None => self.set_step(&step_id, StepState::Skipped),
            }
        }

        if let Err(e) = self.ctl.plan_cache.record_success(&self.cache_key).await {
            warn!(error = %e, "could not update plan cache entry");
        }
        Ok(TerminationReason::Applied)
    }

    // -----------------------------------------------------------------------
    // DETECTING
    // -----------------------------------------------------------------------

    async fn detect(
        &mut self,
        sandboxes: &SandboxManager,
        spec: &BuildSpec,
    ) -> Result<FailureContext, Stop> {
        self.budget.check_step().map_err(budget_stop)?;
        let instance = sandboxes.acquire().await.map_err(sandbox_stop)?;
        let timeout = Duration::from_millis(self.ctl.config.evaluator.full_timeout_ms);
        let output = sandboxes.run(&instance, &spec.test_cmd, timeout).await;
        sandboxes.release(instance);
        let output = output.map_err(sandbox_stop)?;

        let results = self.ctl.buildpack.parse_test_output(&output);
        let mut failing = results.failed.clone();
        if failing.is_empty() && !results.all_passed() {
            failing.insert(SUITE_TEST.to_string());
        }
        let passing: BTreeSet<String> = results.passed.difference(&failing).cloned().collect();
        let combined = output.combined();
        let error_type = ErrorType::classify(&combined, output.timed_out);
        info!(
            failing = failing.len(),
            passing = passing.len(),
            %error_type,
            "failure detected"
        );
        Ok(FailureContext {
            error_type,
            failing,
            passing,
            excerpt: tail(&combined, EXCERPT_CHARS),
        })
    }

    // -----------------------------------------------------------------------
    // PLANNING
    // -----------------------------------------------------------------------

    async fn plan(&mut self, spec: &BuildSpec, failure: &FailureContext) -> Result<(), Stop> {
        if let Some(hit) = self.cached.take() {
            info!(plan_id = %hit.plan.plan_id, similarity = hit.similarity, "reusing cached plan");
            self.ctl.metrics.inc_plan(PlanSource::Cache);
            self.cache_key = hit.signature;
            self.plan = Some(hit.plan);
            self.plan_source = Some(PlanSource::Cache);
            return Ok(());
        }

        self.transition(ControllerState::Planning)?;
        let context = PlanningContext {
            language: spec.language.clone(),
            test_cmd: spec.test_cmd.clone(),
            failing_tests: failure.failing.iter().cloned().collect(),
            error_excerpt: failure.excerpt.clone(),
            source_globs: spec.source_globs.clone(),
            test_globs: Vec::new(),
        };
        let plan = self
            .ctl
            .planner
            .decompose(self.goal, &context)
            .await
            .map_err(|e| TerminationReason::PlanningFailed {
                detail: e.to_string(),
            })?;
        let source = self.ctl.planner.last_source();
        self.ctl.metrics.inc_plan(source);
        info!(plan_id = %plan.plan_id, steps = plan.steps.len(), source = source.as_str(), "plan ready");

        if let Err(e) = self
            .ctl
            .plan_cache
            .store(&self.cache_key, self.goal.intent(), &plan)
            .await
        {
            warn!(error = %e, "could not cache plan");
        }
        self.plan = Some(plan);
        self.plan_source = Some(source);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // QUERYING / EVALUATING / QA_REVIEW / APPLYING
    // -----------------------------------------------------------------------

    fn patch_constraints(&self) -> PatchConstraints {
        let constraints = self.goal.constraints();
        let baseline = self.plan.as_ref().map(|p| p.baseline).unwrap_or_default();
        let ratio = self.ctl.qa.config().scope_ratio;
        PatchConstraints {
            allowed_paths: constraints.allowed_paths(),
            forbidden_patterns: constraints.forbidden_patterns(),
            max_files: (baseline.files as f64 * ratio).ceil() as u32,
            max_lines: (baseline.lines as f64 * ratio).ceil() as u32,
        }
    }

    /// Cycle until a candidate for `step_id` is accepted and applied, or
    /// the run must stop.
    async fn repair_step(
        &mut self,
        step_id: &str,
        target: &EvaluationTarget,
        failure: &FailureContext,
        ensemble: &EnsembleCoordinator,
        evaluator: &ParallelEvaluator,
    ) -> Result<EvaluationResult, Stop> {
        let (step_intent, file_hints) = self
            .plan
            .as_ref()
            .and_then(|p| p.step(step_id))
            .map(|s| (s.intent.clone(), s.allowed_files.clone()))
            .unwrap_or_default();
        let constraints = self.patch_constraints();
        let mut rejections: Vec<String> = Vec::new();
        let step_started = Instant::now();

        loop {
            self.transition(ControllerState::Querying)?;
            self.budget.consume_step().map_err(budget_stop)?;
            self.cycles += 1;

            let selection = self.ctl.memory.select(failure.error_type, &[]).await;
            let context = RepairContext {
                run_id: self.run_id.clone(),
                goal_intent: self.goal.intent().to_string(),
                step_id: step_id.to_string(),
                step_intent: step_intent.clone(),
                action: selection.action,
                action_hint: selection.action.hint().to_string(),
                error_type: failure.error_type,
                failing_tests: target.failing_tests.iter().cloned().collect(),
                failure_excerpt: failure.excerpt.clone(),
                previous_rejections: rejections.clone(),
                cycle: self.cycles,
                file_hints: file_hints.clone(),
            };
            let candidates = match ensemble.query(&context, &constraints).await {
                Ok(outcome) => outcome.candidates,
                Err(EnsembleError::Budget(e)) => return Err(budget_stop(e)),
                Err(e) => {
                    warn!(error = %e, cycle = self.cycles, "no candidates this cycle");
                    rejections.push(e.to_string());
                    Vec::new()
                }
            };

            self.transition(ControllerState::Evaluating)?;
            let cycle = self.evaluate(step_id, candidates, target, evaluator).await?;

            if let Some(result) = cycle.accepted {
                self.record_outcome(failure.error_type, selection.action, true)
                    .await;
                self.transition(ControllerState::Applying)?;
                self.apply(&result.candidate).await?;
                self.record_artifact(step_id, &result, step_started).await;
                return Ok(result);
            }

            if cycle.evaluated > 0 {
                self.record_outcome(failure.error_type, selection.action, false)
                    .await;
            }
            rejections.extend(cycle.rejections);
            if rejections.len() > MAX_REJECTIONS {
                rejections.drain(..rejections.len() - MAX_REJECTIONS);
            }
            let signature = failure_signature(failure.error_type, &cycle.remaining);
            if let Some(halt) = self.halt.observe_cycle(&signature, cycle.remaining.len()) {
                return Err(TerminationReason::HaltTriggered { halt });
            }
        }
    }

    /// Evaluate `candidates` concurrently and review each as it completes.
    /// The first ACCEPT cancels everything still in flight.
    async fn evaluate(
        &mut self,
        step_id: &str,
        candidates: Vec<Candidate>,
        target: &EvaluationTarget,
        evaluator: &ParallelEvaluator,
    ) -> Result<CycleOutcome, Stop> {
        let mut outcome = CycleOutcome {
            accepted: None,
            remaining: target.failing_tests.clone(),
            rejections: Vec::new(),
            evaluated: 0,
        };
        if candidates.is_empty() {
            return Ok(outcome);
        }

        let baseline = self.plan.as_ref().map(|p| p.baseline).unwrap_or_default();
        let mut resubmitted: HashSet<CandidateId> = HashSet::new();
        let mut batch = evaluator.start(target.clone());
        for candidate in candidates {
            batch.submit(candidate);
        }

        let mut stop: Option<Stop> = None;
        while let Some(ready) = batch.next().await {
            if let Err(reason) = self.transition(ControllerState::QaReview) {
                stop = Some(reason);
                break;
            }
            // completion order; simultaneous completions arrive by slot
            for worker in ready {
                let slot = worker.slot();
                match worker {
                    WorkerOutcome::Completed(result) => {
                        outcome.evaluated += 1;
                        let verdict = self.ctl.qa.review(
                            &result.candidate,
                            &result.evidence,
                            target,
                            self.goal.constraints(),
                            baseline,
                        );
                        self.ctl.metrics.inc_decision(verdict.decision);
                        let decision = effective_decision(verdict.decision, result.evidence.attempt);
                        let halt = self
                            .halt
                            .observe_evaluation(&result.candidate, result.evidence.is_flaky());
                        self.audit.push(AuditEntry {
                            candidate_id: result.candidate.id().to_string(),
                            step_id: step_id.to_string(),
                            cycle: self.cycles,
                            provider: result.candidate.provider_id().to_string(),
                            fallback_used: result.candidate.fallback_used(),
                            attempt: result.evidence.attempt,
                            slot: Some(slot),
                            evidence: Some(EvidenceSummary::from(&result.evidence)),
                            claims: verdict.claims.clone(),
                            decision: Some(decision),
                            cancelled: false,
                            note: None,
                        });

                        // a valid ACCEPT outranks a halt raised by the same evaluation
                        let accepting = decision == QaDecision::Accept
                            && outcome.accepted.is_none()
                            && stop.is_none();
                        if !accepting {
                            if let Some(halt) = halt {
                                stop.get_or_insert(TerminationReason::HaltTriggered { halt });
                            }
                        }

                        match decision {
                            QaDecision::Accept if accepting => {
                                info!(candidate_id = %result.candidate.id(), slot, "candidate accepted");
                                outcome.accepted = Some(result);
                            }
                            QaDecision::Accept => {
                                debug!(candidate_id = %result.candidate.id(), "accepted too late");
                            }
                            QaDecision::Escalate if stop.is_none() => {
                                info!(candidate_id = %result.candidate.id(), "escalated; re-evaluating");
                                resubmitted.insert(result.candidate.id().clone());
                                batch.resubmit(result.candidate);
                            }
                            QaDecision::Escalate => {
                                debug!(candidate_id = %result.candidate.id(), "escalated while stopping");
                            }
                            QaDecision::Reject => {
                                let remaining =
                                    result.evidence.remaining_failures(&target.failing_tests);
                                if remaining.len() < outcome.remaining.len() {
                                    outcome.remaining = remaining;
                                }
                                outcome.rejections.push(rejection_summary(&verdict));
                            }
                        }
                    }
                    WorkerOutcome::Infrastructure {
                        candidate, error, ..
                    } => {
                        self.audit_unreviewed(&candidate, step_id, slot, &resubmitted, error.to_string());
                        stop.get_or_insert(sandbox_stop(error));
                    }
                    WorkerOutcome::Budget {
                        candidate, error, ..
                    } => {
                        self.audit_unreviewed(&candidate, step_id, slot, &resubmitted, error.to_string());
                        stop.get_or_insert(budget_stop(error));
                    }
                    WorkerOutcome::Crashed {
                        candidate, reason, ..
                    } => {
                        warn!(candidate_id = %candidate.id(), %reason, "evaluation crashed");
                        outcome.rejections.push(format!("evaluation crashed: {reason}"));
                        self.audit_unreviewed(&candidate, step_id, slot, &resubmitted, reason);
                    }
                }
            }
            if outcome.accepted.is_some() || stop.is_some() {
                break;
            }
            if batch.in_flight() > 0 {
                if let Err(reason) = self.transition(ControllerState::Evaluating) {
                    stop = Some(reason);
                    break;
                }
            }
        }

        for candidate in batch.cancel_all().await {
            let attempt = if resubmitted.contains(candidate.id()) { 2 } else { 1 };
            self.audit.push(AuditEntry {
                candidate_id: candidate.id().to_string(),
                step_id: step_id.to_string(),
                cycle: self.cycles,
                provider: candidate.provider_id().to_string(),
                fallback_used: candidate.fallback_used(),
                attempt,
                slot: None,
                evidence: None,
                claims: Vec::new(),
                decision: None,
                cancelled: true,
                note: Some("evaluation cancelled".into()),
            });
        }

        match stop {
            Some(reason) => Err(reason),
            None => Ok(outcome),
        }
    }

    fn audit_unreviewed(
        &mut self,
        candidate: &Candidate,
        step_id: &str,
        slot: usize,
        resubmitted: &HashSet<CandidateId>,
        note: String,
    ) {
        self.audit.push(AuditEntry {
            candidate_id: candidate.id().to_string(),
            step_id: step_id.to_string(),
            cycle: self.cycles,
            provider: candidate.provider_id().to_string(),
            fallback_used: candidate.fallback_used(),
            attempt: if resubmitted.contains(candidate.id()) { 2 } else { 1 },
            slot: Some(slot),
            evidence: None,
            claims: Vec::new(),
            decision: None,
            cancelled: false,
            note: Some(note),
        });
    }

    async fn record_outcome(&self, error_type: ErrorType, action: RepairAction, success: bool) {
        if let Err(e) = self.ctl.memory.record(error_type, action, success).await {
            warn!(error = %e, action = %action, "could not record outcome");
        }
    }

    /// Record what applying `result` changed, and feed the scope check.
    async fn record_artifact(&mut self, step_id: &str, result: &EvaluationResult, started: Instant) {
        let files: Vec<String> = result.evidence.diff.files.iter().cloned().collect();
        if let Some(halt) = self.halt.observe_applied(&files) {
            self.scope_halt.get_or_insert(halt);
        }

        let root = self.ctl.repo.clone();
        let excluded = self.ctl.config.sandbox.excluded_dirs.clone();
        let fingerprint =
            tokio::task::spawn_blocking(move || repo_fingerprint(&root, &excluded)).await;
        let repo_fingerprint = match fingerprint {
            Ok(Ok(digest)) => Some(digest),
            Ok(Err(e)) => {
                warn!(error = %e, "could not fingerprint repository");
                None
            }
            Err(e) => {
                warn!(error = %e, "fingerprint task failed");
                None
            }
        };

        self.artifacts.push(StepArtifact {
            step_id: step_id.to_string(),
            candidate_id: result.candidate.id().to_string(),
            provider: result.candidate.provider_id().to_string(),
            diff_digest: result.candidate.digest().as_str().to_string(),
            files,
            elapsed_ms: started.elapsed().as_millis() as u64,
            repo_fingerprint,
        });
    }

    async fn apply(&mut self, candidate: &Candidate) -> Result<(), Stop> {
        let diff = candidate.diff().to_string();
        let root = self.ctl.repo.clone();
        let applied =
            tokio::task::spawn_blocking(move || UnifiedPatch::parse(&diff)?.apply_to(&root)).await;
        match applied {
            Ok(Ok(())) => {
                info!(candidate_id = %candidate.id(), "patch applied to target");
                self.applied.push(candidate.diff().to_string());
                Ok(())
            }
            Ok(Err(e)) => Err(TerminationReason::ApplyFailed {
                detail: e.to_string(),
            }),
            Err(e) => Err(TerminationReason::ApplyFailed {
                detail: format!("apply task failed: {e}"),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Terminal
    // -----------------------------------------------------------------------

    async fn finish(mut self, reason: TerminationReason) -> RunReport {
        let status = reason.status();
        if let Some(plan) = self.plan.as_mut() {
            for step in plan.steps.iter_mut() {
                let to = match step.state() {
                    StepState::Pending => StepState::Skipped,
                    StepState::Running if status == RunStatus::Done => StepState::Succeeded,
                    StepState::Running => StepState::Failed,
                    _ => continue,
                };
                if let Err(e) = step.transition(to) {
                    warn!(error = %e, "step transition refused");
                }
            }
        }

        let downstream_failure = status != RunStatus::Done && self.plan.is_some();
        if downstream_failure {
            match self.ctl.plan_cache.record_failure(&self.cache_key).await {
                Ok(true) => info!(signature = %self.cache_key, "plan evicted after repeated failures"),
                Ok(false) => {}
                Err(e) => warn!(error = %e, "could not record plan failure"),
            }
        }

        self.move_to(status.state());
        let duration_ms = self.started.elapsed().as_millis() as u64;
        self.ctl.metrics.flush();
        obs::emit_run_finished(&self.run_id, status.as_str(), reason.as_str(), duration_ms);
        if status == RunStatus::Done {
            info!(%reason, cycles = self.cycles, "run finished");
        } else {
            warn!(%reason, cycles = self.cycles, "run ended without a fix");
        }

        let failure = self.failure.as_ref();
        RunReport {
            run_id: self.run_id.clone(),
            goal: self.goal.intent().to_string(),
            status,
            reason,
            applied_patch: (!self.applied.is_empty()).then(|| self.applied.concat()),
            plan_id: self.plan.as_ref().map(|p| p.plan_id.clone()),
            plan_source: self.plan_source,
            error_type: failure.map(|f| f.error_type),
            failing_tests: failure
                .map(|f| f.failing.iter().cloned().collect())
                .unwrap_or_default(),
            cycles: self.cycles,
            budget: self.budget.snapshot(),
            steps: self.plan.as_ref().map(StepRecord::from_plan).unwrap_or_default(),
            audit: std::mem::take(&mut self.audit),
            artifacts: std::mem::take(&mut self.artifacts),
            metrics: self.ctl.metrics.render(),
            started_at: self.started_at,
            duration_ms,
        }
    }
}
