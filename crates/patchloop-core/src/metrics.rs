//! Atomic counters for Patchloop observability.
//!
//! Counters are incremented silently at the call site and shared through an
//! `Arc<Metrics>`. [`Metrics::flush`] emits current values as a single
//! `tracing::info!` event; [`Metrics::render`] produces a pull-based text
//! exposition.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::QaDecision;

/// Where a step plan came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    Cache,
    Pattern,
    Decomposer,
}

impl PlanSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Pattern => "pattern",
            Self::Decomposer => "decomposer",
        }
    }
}

/// Lightweight atomic counters. No allocations, no locking.
#[derive(Debug, Default)]
pub struct Metrics {
    plans_cache: AtomicU64,
    plans_pattern: AtomicU64,
    plans_decomposer: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    steps_succeeded: AtomicU64,
    steps_failed: AtomicU64,
    candidates_evaluated: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    escalated: AtomicU64,
    cancelled: AtomicU64,
    sandboxes_acquired: AtomicU64,
    sandboxes_released: AtomicU64,
    provider_failures: AtomicU64,
    fallbacks_used: AtomicU64,
}

fn inc(counter: &AtomicU64, name: &'static str) {
    counter.fetch_add(1, Ordering::Relaxed);
    tracing::trace!(metric = name, "counter incremented");
}

fn get(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_plan(&self, source: PlanSource) {
        match source {
            PlanSource::Cache => inc(&self.plans_cache, "plans_cache"),
            PlanSource::Pattern => inc(&self.plans_pattern, "plans_pattern"),
            PlanSource::Decomposer => inc(&self.plans_decomposer, "plans_decomposer"),
        }
    }

    pub fn inc_cache_hit(&self) {
        inc(&self.cache_hits, "cache_hits");
    }

    pub fn inc_cache_miss(&self) {
        inc(&self.cache_misses, "cache_misses");
    }

    pub fn inc_step(&self, succeeded: bool) {
        if succeeded {
            inc(&self.steps_succeeded, "steps_succeeded");
        } else {
            inc(&self.steps_failed, "steps_failed");
        }
    }

    pub fn inc_evaluated(&self) {
        inc(&self.candidates_evaluated, "candidates_evaluated");
    }

    pub fn inc_decision(&self, decision: QaDecision) {
        match decision {
            QaDecision::Accept => inc(&self.accepted, "accepted"),
            QaDecision::Reject => inc(&self.rejected, "rejected"),
            QaDecision::Escalate => inc(&self.escalated, "escalated"),
        }
    }

    pub fn inc_cancelled(&self) {
        inc(&self.cancelled, "cancelled");
    }

    pub fn inc_sandbox_acquired(&self) {
        inc(&self.sandboxes_acquired, "sandboxes_acquired");
    }

    pub fn inc_sandbox_released(&self) {
        inc(&self.sandboxes_released, "sandboxes_released");
    }

    pub fn inc_provider_failure(&self) {
        inc(&self.provider_failures, "provider_failures");
    }

    pub fn inc_fallback(&self) {
        inc(&self.fallbacks_used, "fallbacks_used");
    }

    pub fn plans(&self, source: PlanSource) -> u64 {
        match source {
            PlanSource::Cache => get(&self.plans_cache),
            PlanSource::Pattern => get(&self.plans_pattern),
            PlanSource::Decomposer => get(&self.plans_decomposer),
        }
    }

    pub fn cache_hits(&self) -> u64 {
        get(&self.cache_hits)
    }

    pub fn cache_misses(&self) -> u64 {
        get(&self.cache_misses)
    }

    pub fn cache_hit_rate(&self) -> f64 {
        ratio(self.cache_hits(), self.cache_hits() + self.cache_misses())
    }

    pub fn step_success_rate(&self) -> f64 {
        let ok = get(&self.steps_succeeded);
        ratio(ok, ok + get(&self.steps_failed))
    }

    pub fn candidates_evaluated(&self) -> u64 {
        get(&self.candidates_evaluated)
    }

    pub fn decisions(&self, decision: QaDecision) -> u64 {
        match decision {
            QaDecision::Accept => get(&self.accepted),
            QaDecision::Reject => get(&self.rejected),
            QaDecision::Escalate => get(&self.escalated),
        }
    }

    pub fn cancelled(&self) -> u64 {
        get(&self.cancelled)
    }

    pub fn sandboxes_acquired(&self) -> u64 {
        get(&self.sandboxes_acquired)
    }

    pub fn sandboxes_released(&self) -> u64 {
        get(&self.sandboxes_released)
    }

    pub fn provider_failures(&self) -> u64 {
        get(&self.provider_failures)
    }

    pub fn fallbacks_used(&self) -> u64 {
        get(&self.fallbacks_used)
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            plans_cache = self.plans(PlanSource::Cache),
            plans_pattern = self.plans(PlanSource::Pattern),
            plans_decomposer = self.plans(PlanSource::Decomposer),
            cache_hits = self.cache_hits(),
            cache_misses = self.cache_misses(),
            candidates_evaluated = self.candidates_evaluated(),
            accepted = self.decisions(QaDecision::Accept),
            rejected = self.decisions(QaDecision::Reject),
            escalated = self.decisions(QaDecision::Escalate),
            cancelled = self.cancelled(),
            provider_failures = self.provider_failures(),
            fallbacks_used = self.fallbacks_used(),
        );
    }

    /// Text exposition, one `name{labels} value` per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for source in [PlanSource::Cache, PlanSource::Pattern, PlanSource::Decomposer] {
            let _ = writeln!(
                out,
                "plans_total{{source=\"{}\"}} {}",
                source.as_str(),
                self.plans(source)
            );
        }
        let _ = writeln!(out, "plan_cache_hits_total {}", self.cache_hits());
        let _ = writeln!(out, "plan_cache_misses_total {}", self.cache_misses());
        let _ = writeln!(out, "cache_hit_rate {:.2}", self.cache_hit_rate());
        let _ = writeln!(
            out,
            "steps_total{{outcome=\"succeeded\"}} {}",
            get(&self.steps_succeeded)
        );
        let _ = writeln!(
            out,
            "steps_total{{outcome=\"failed\"}} {}",
            get(&self.steps_failed)
        );
        let _ = writeln!(out, "step_success_rate {:.2}", self.step_success_rate());
        let _ = writeln!(
            out,
            "candidates_evaluated_total {}",
            self.candidates_evaluated()
        );
        for (label, decision) in [
            ("accept", QaDecision::Accept),
            ("reject", QaDecision::Reject),
            ("escalate", QaDecision::Escalate),
        ] {
            let _ = writeln!(
                out,
                "qa_decisions_total{{decision=\"{}\"}} {}",
                label,
                self.decisions(decision)
            );
        }
        let _ = writeln!(out, "evaluations_cancelled_total {}", self.cancelled());
        let _ = writeln!(
            out,
            "sandboxes_live {}",
            self.sandboxes_acquired()
                .saturating_sub(self.sandboxes_released())
        );
        let _ = writeln!(out, "provider_failures_total {}", self.provider_failures());
        let _ = writeln!(out, "fallbacks_used_total {}", self.fallbacks_used());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_exposes_rates() {
        let m = Metrics::new();
        m.inc_plan(PlanSource::Cache);
        m.inc_cache_hit();
        m.inc_cache_miss();
        m.inc_cache_miss();
        m.inc_cache_miss();
        m.inc_step(true);
        m.inc_step(true);
        m.inc_step(true);
        m.inc_step(false);
        let text = m.render();
        assert!(text.contains("plans_total{source=\"cache\"} 1"));
        assert!(text.contains("cache_hit_rate 0.25"));
        assert!(text.contains("step_success_rate 0.75"));
    }

    #[test]
    fn live_sandboxes_gauge() {
        let m = Metrics::new();
        m.inc_sandbox_acquired();
        m.inc_sandbox_acquired();
        m.inc_sandbox_released();
        assert!(m.render().contains("sandboxes_live 1"));
    }
}
