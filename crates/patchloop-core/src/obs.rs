//! Structured observability hooks for Patchloop run lifecycle events.
//!
//! This module provides:
//! - A run-scoped tracing span via `run_span`
//! - Emission functions for key lifecycle events: start, state transitions,
//!   ensemble queries, evaluations, QA decisions, budget transitions, finish
//!
//! Events are emitted at `info!` level (configurable via `RUST_LOG`).

use tracing::info;

use crate::budget::BudgetState;
use crate::domain::QaDecision;

/// Run-scoped span. Attach it to the run future with
/// [`tracing::Instrument::instrument`] so every event carries `run_id`.
///
/// # Example
///
/// ```ignore
/// controller.execute(goal).instrument(run_span(&run_id)).await
/// ```
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("patchloop.run", run_id = %run_id)
}

/// Emit event: run started for a goal.
pub fn emit_run_started(run_id: &str, goal: &str) {
    info!(event = "run.started", run_id = %run_id, goal = %goal);
}

/// Emit event: controller moved between states.
pub fn emit_state_transition(run_id: &str, from: &str, to: &str) {
    info!(event = "run.state_transition", run_id = %run_id, from = from, to = to);
}

/// Emit event: an ensemble query finished.
pub fn emit_ensemble_queried(run_id: &str, candidates: usize, failures: usize, fallback_used: bool) {
    info!(
        event = "ensemble.queried",
        run_id = %run_id,
        candidates = candidates,
        failures = failures,
        fallback_used = fallback_used,
    );
}

/// Emit event: a worker finished evaluating a candidate.
pub fn emit_candidate_evaluated(candidate_id: &str, slot: usize, applied: bool, total_ms: u64) {
    info!(
        event = "candidate.evaluated",
        candidate_id = %candidate_id,
        slot = slot,
        applied = applied,
        total_ms = total_ms,
    );
}

/// Emit event: the QA gate decided on a candidate.
pub fn emit_qa_decided(candidate_id: &str, decision: QaDecision) {
    info!(event = "qa.decided", candidate_id = %candidate_id, decision = ?decision);
}

/// Emit event: the budget gate advanced to a new state.
pub fn emit_budget_transition(from: BudgetState, to: BudgetState) {
    if to >= BudgetState::Exceeded {
        tracing::warn!(event = "budget.transition", from = ?from, to = ?to);
    } else {
        info!(event = "budget.transition", from = ?from, to = ?to);
    }
}

/// Emit event: run finished.
pub fn emit_run_finished(run_id: &str, status: &str, reason: &str, duration_ms: u64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        status = status,
        reason = reason,
        duration_ms = duration_ms,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let span = run_span("test-run-id");
        let _entered = span.enter();
        emit_state_transition("test-run-id", "DETECTING", "PLANNING");
    }
}
