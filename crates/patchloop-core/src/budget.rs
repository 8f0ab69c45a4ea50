//! Budget Gate: per-run resource accounting shared by concurrent consumers.
//!
//! Counters are `AtomicU64`s. With enforcement on, an increment that would
//! pass its limit is refused with a compare-and-swap loop, so no counter is
//! ever observed above its limit. The gate state only moves forward
//! (`Active < Warning < Exceeded < Exhausted`) via `fetch_max`.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::obs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetResource {
    Steps,
    ModelCalls,
    Tokens,
    Subprocesses,
    ElapsedMs,
}

impl BudgetResource {
    const ALL: [BudgetResource; 5] = [
        BudgetResource::Steps,
        BudgetResource::ModelCalls,
        BudgetResource::Tokens,
        BudgetResource::Subprocesses,
        BudgetResource::ElapsedMs,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Steps => "steps",
            Self::ModelCalls => "model_calls",
            Self::Tokens => "tokens",
            Self::Subprocesses => "subprocesses",
            Self::ElapsedMs => "elapsed_ms",
        }
    }
}

impl fmt::Display for BudgetResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum BudgetState {
    Active = 0,
    Warning = 1,
    Exceeded = 2,
    Exhausted = 3,
}

impl BudgetState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Active,
            1 => Self::Warning,
            2 => Self::Exceeded,
            _ => Self::Exhausted,
        }
    }
}

/// Limits per resource. `None` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetLimits {
    pub max_steps: Option<u64>,
    pub max_model_calls: Option<u64>,
    pub max_tokens: Option<u64>,
    pub max_subprocesses: Option<u64>,
    pub max_elapsed_ms: Option<u64>,
}

impl BudgetLimits {
    fn get(&self, resource: BudgetResource) -> Option<u64> {
        match resource {
            BudgetResource::Steps => self.max_steps,
            BudgetResource::ModelCalls => self.max_model_calls,
            BudgetResource::Tokens => self.max_tokens,
            BudgetResource::Subprocesses => self.max_subprocesses,
            BudgetResource::ElapsedMs => self.max_elapsed_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub limits: BudgetLimits,
    /// Fraction of a limit at which the gate enters `Warning`.
    pub warning_threshold: f64,
    /// Refuse operations that would pass a limit.
    pub enforce: bool,
    /// Exceeded attempts after which the gate is `Exhausted`.
    pub exhaust_after: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            limits: BudgetLimits {
                max_steps: Some(12),
                max_model_calls: Some(60),
                max_tokens: Some(400_000),
                max_subprocesses: Some(400),
                max_elapsed_ms: Some(3_600_000),
            },
            warning_threshold: 0.8,
            enforce: true,
            exhaust_after: 3,
        }
    }
}

/// A consumption attempt the gate refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{resource} budget exceeded: {used} used of limit {limit} (gate {state:?})")]
pub struct BudgetExceeded {
    pub resource: BudgetResource,
    pub used: u64,
    pub limit: u64,
    pub state: BudgetState,
}

/// Point-in-time copy of the gate for reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub state: BudgetState,
    pub steps: u64,
    pub model_calls: u64,
    pub tokens: u64,
    pub subprocesses: u64,
    pub elapsed_ms: u64,
    pub exceeded_attempts: u32,
    pub limits: BudgetLimits,
    pub enforce: bool,
}

#[derive(Debug)]
pub struct BudgetGate {
    config: BudgetConfig,
    counters: [AtomicU64; 5],
    state: AtomicU8,
    exceeded_attempts: AtomicU32,
    last_exceeded: AtomicU8,
    started: Instant,
}

impl BudgetGate {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            counters: Default::default(),
            state: AtomicU8::new(BudgetState::Active as u8),
            exceeded_attempts: AtomicU32::new(0),
            last_exceeded: AtomicU8::new(BudgetResource::Steps as u8),
            started: Instant::now(),
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    pub fn state(&self) -> BudgetState {
        BudgetState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn used(&self, resource: BudgetResource) -> u64 {
        self.counters[resource.index()].load(Ordering::SeqCst)
    }

    /// True once the run must stop: exhausted, or exceeded while enforcing.
    pub fn is_fatal(&self) -> bool {
        match self.state() {
            BudgetState::Exhausted => true,
            BudgetState::Exceeded => self.config.enforce,
            _ => false,
        }
    }

    /// Gate check performed before every controller transition. Also folds
    /// wall-clock time into the elapsed counter.
    pub fn check_step(&self) -> Result<BudgetState, BudgetExceeded> {
        let elapsed = self.started.elapsed().as_millis() as u64;
        let counter = &self.counters[BudgetResource::ElapsedMs.index()];
        let previous = counter.load(Ordering::SeqCst);
        if elapsed > previous {
            self.consume(BudgetResource::ElapsedMs, elapsed - previous)?;
        }
        if self.is_fatal() {
            return Err(self.refusal(self.last_resource()));
        }
        Ok(self.state())
    }

    pub fn consume_step(&self) -> Result<BudgetState, BudgetExceeded> {
        self.consume(BudgetResource::Steps, 1)
    }

    pub fn consume_model_call(&self) -> Result<BudgetState, BudgetExceeded> {
        self.consume(BudgetResource::ModelCalls, 1)
    }

    pub fn consume_tokens(&self, tokens: u64) -> Result<BudgetState, BudgetExceeded> {
        self.consume(BudgetResource::Tokens, tokens)
    }

    pub fn consume_subprocess(&self) -> Result<BudgetState, BudgetExceeded> {
        self.consume(BudgetResource::Subprocesses, 1)
    }

    fn consume(&self, resource: BudgetResource, amount: u64) -> Result<BudgetState, BudgetExceeded> {
        if self.state() == BudgetState::Exhausted {
            self.last_exceeded.store(resource as u8, Ordering::SeqCst);
            return Err(self.refusal(resource));
        }
        let counter = &self.counters[resource.index()];
        let Some(limit) = self.config.limits.get(resource) else {
            counter.fetch_add(amount, Ordering::SeqCst);
            return Ok(self.state());
        };

        if self.config.enforce {
            let updated = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                let next = cur.saturating_add(amount);
                (next <= limit).then_some(next)
            });
            match updated {
                Ok(previous) => {
                    self.observe(previous.saturating_add(amount), limit);
                    Ok(self.state())
                }
                Err(_) => {
                    self.record_exceeded(resource);
                    Err(self.refusal(resource))
                }
            }
        } else {
            let next = counter
                .fetch_add(amount, Ordering::SeqCst)
                .saturating_add(amount);
            if next > limit {
                self.record_exceeded(resource);
                if self.state() == BudgetState::Exhausted {
                    return Err(self.refusal(resource));
                }
            } else {
                self.observe(next, limit);
            }
            Ok(self.state())
        }
    }

    fn observe(&self, value: u64, limit: u64) {
        if value as f64 >= self.config.warning_threshold * limit as f64 {
            self.advance(BudgetState::Warning);
        }
    }

    fn record_exceeded(&self, resource: BudgetResource) {
        self.last_exceeded.store(resource as u8, Ordering::SeqCst);
        let attempts = self.exceeded_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        self.advance(BudgetState::Exceeded);
        if attempts >= self.config.exhaust_after {
            self.advance(BudgetState::Exhausted);
        }
    }

    fn advance(&self, to: BudgetState) {
        let previous = BudgetState::from_u8(self.state.fetch_max(to as u8, Ordering::SeqCst));
        if previous < to {
            obs::emit_budget_transition(previous, to);
        }
    }

    fn last_resource(&self) -> BudgetResource {
        let idx = self.last_exceeded.load(Ordering::SeqCst) as usize;
        BudgetResource::ALL
            .get(idx)
            .copied()
            .unwrap_or(BudgetResource::Steps)
    }

    fn refusal(&self, resource: BudgetResource) -> BudgetExceeded {
        BudgetExceeded {
            resource,
            used: self.used(resource),
            limit: self.config.limits.get(resource).unwrap_or(u64::MAX),
            state: self.state(),
        }
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            state: self.state(),
            steps: self.used(BudgetResource::Steps),
            model_calls: self.used(BudgetResource::ModelCalls),
            tokens: self.used(BudgetResource::Tokens),
            subprocesses: self.used(BudgetResource::Subprocesses),
            elapsed_ms: self.used(BudgetResource::ElapsedMs),
            exceeded_attempts: self.exceeded_attempts.load(Ordering::SeqCst),
            limits: self.config.limits.clone(),
            enforce: self.config.enforce,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn gate(limits: BudgetLimits, enforce: bool) -> BudgetGate {
        BudgetGate::new(BudgetConfig {
            limits,
            warning_threshold: 0.8,
            enforce,
            exhaust_after: 3,
        })
    }

    fn steps(n: u64) -> BudgetLimits {
        BudgetLimits {
            max_steps: Some(n),
            ..BudgetLimits::default()
        }
    }

    #[test]
    fn fourth_step_is_refused_when_enforcing() {
        let g = gate(steps(3), true);
        assert_eq!(g.consume_step().unwrap(), BudgetState::Active);
        assert_eq!(g.consume_step().unwrap(), BudgetState::Active);
        assert_eq!(g.consume_step().unwrap(), BudgetState::Warning);
        let err = g.consume_step().unwrap_err();
        assert_eq!(err.resource, BudgetResource::Steps);
        assert_eq!(err.limit, 3);
        assert_eq!(g.used(BudgetResource::Steps), 3);
        assert_eq!(g.state(), BudgetState::Exceeded);
        assert!(g.is_fatal());
        assert!(g.check_step().is_err());
    }

    #[test]
    fn non_enforcing_gate_completes_then_exhausts() {
        let g = gate(steps(1), false);
        g.consume_step().unwrap();
        assert_eq!(g.consume_step().unwrap(), BudgetState::Exceeded);
        assert!(!g.is_fatal());
        assert!(g.check_step().is_ok());
        assert_eq!(g.used(BudgetResource::Steps), 2);

        assert_eq!(g.consume_step().unwrap(), BudgetState::Exceeded);
        // third exceeded attempt exhausts the gate
        assert!(g.consume_step().is_err());
        assert_eq!(g.state(), BudgetState::Exhausted);
        // exhausted blocks everything, including unlimited resources
        assert!(g.consume_tokens(1).is_err());
        assert!(g.check_step().is_err());
    }

    #[test]
    fn unlimited_resources_never_warn() {
        let g = gate(BudgetLimits::default(), true);
        for _ in 0..1000 {
            g.consume_model_call().unwrap();
        }
        assert_eq!(g.state(), BudgetState::Active);
        assert_eq!(g.snapshot().model_calls, 1000);
    }

    #[test]
    fn state_never_moves_backwards() {
        let g = gate(
            BudgetLimits {
                max_tokens: Some(100),
                max_steps: Some(100),
                ..BudgetLimits::default()
            },
            true,
        );
        g.consume_tokens(90).unwrap();
        assert_eq!(g.state(), BudgetState::Warning);
        g.consume_step().unwrap();
        assert_eq!(g.state(), BudgetState::Warning);
    }

    #[tokio::test]
    async fn concurrent_consumers_never_pass_limit() {
        let g = Arc::new(gate(
            BudgetLimits {
                max_tokens: Some(1_000),
                ..BudgetLimits::default()
            },
            true,
        ));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let g = g.clone();
            handles.push(tokio::spawn(async move {
                let mut granted = 0u64;
                for _ in 0..50 {
                    if g.consume_tokens(7).is_ok() {
                        granted += 7;
                    }
                    assert!(g.used(BudgetResource::Tokens) <= 1_000);
                    tokio::task::yield_now().await;
                }
                granted
            }));
        }
        let mut total = 0;
        for h in handles {
            total += h.await.unwrap();
        }
        assert_eq!(total, g.used(BudgetResource::Tokens));
        assert!(total <= 1_000);
        assert!(total > 1_000 - 7);
    }
}
