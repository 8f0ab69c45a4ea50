//! Ensemble query coordinator.
//!
//! Fans one repair request out to every configured provider concurrently,
//! each call bounded by its own timeout, and applies the fallback policy:
//!
//! - primary answered: every valid candidate is kept
//! - primary failed: the first responsive secondary is used alone, tagged
//!   `fallback_used`
//! - nobody answered: [`EnsembleError::AllProvidersFailed`]

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::budget::{BudgetExceeded, BudgetGate};
use crate::domain::Candidate;
use crate::metrics::Metrics;
use crate::provider::{ModelProvider, PatchConstraints, ProviderFailure, RepairContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnsembleMode {
    /// Query the primary; secondaries are asked one at a time only after it fails.
    Single,
    /// Query every provider concurrently.
    #[default]
    Ensemble,
}

impl std::str::FromStr for EnsembleMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "ensemble" => Ok(Self::Ensemble),
            other => Err(format!("unknown ensemble mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub mode: EnsembleMode,
    /// Per-provider call timeout.
    pub provider_timeout_ms: u64,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            mode: EnsembleMode::Ensemble,
            provider_timeout_ms: 60_000,
        }
    }
}

/// How one provider call ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderReport {
    pub provider: String,
    pub primary: bool,
    pub duration_ms: u64,
    /// `None` when the provider produced a candidate.
    pub failure: Option<ProviderFailure>,
}

/// Candidates retained for evaluation plus per-provider reports.
#[derive(Debug, Clone)]
pub struct EnsembleOutcome {
    pub candidates: Vec<Candidate>,
    pub reports: Vec<ProviderReport>,
    pub fallback_used: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum EnsembleError {
    #[error("all {attempted} provider(s) failed")]
    AllProvidersFailed {
        attempted: usize,
        reports: Vec<ProviderReport>,
    },

    #[error("provider query refused by budget: {0}")]
    Budget(#[from] BudgetExceeded),

    #[error("no providers configured")]
    NoProviders,
}

pub type EnsembleResult<T> = std::result::Result<T, EnsembleError>;

pub struct EnsembleCoordinator {
    providers: Vec<Arc<dyn ModelProvider>>,
    config: EnsembleConfig,
    budget: Arc<BudgetGate>,
    metrics: Arc<Metrics>,
}

impl EnsembleCoordinator {
    /// `providers[0]` is the primary.
    pub fn new(
        providers: Vec<Arc<dyn ModelProvider>>,
        config: EnsembleConfig,
        budget: Arc<BudgetGate>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            providers,
            config,
            budget,
            metrics,
        }
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    #[instrument(skip_all, fields(run_id = %context.run_id, step_id = %context.step_id, cycle = context.cycle))]
    pub async fn query(
        &self,
        context: &RepairContext,
        constraints: &PatchConstraints,
    ) -> EnsembleResult<EnsembleOutcome> {
        if self.providers.is_empty() {
            return Err(EnsembleError::NoProviders);
        }
        let answers = match self.config.mode {
            EnsembleMode::Ensemble => self.query_all(context, constraints).await?,
            EnsembleMode::Single => self.query_in_order(context, constraints).await?,
        };
        let outcome = self.resolve(answers)?;
        crate::obs::emit_ensemble_queried(
            &context.run_id,
            outcome.candidates.len(),
            outcome.reports.iter().filter(|r| r.failure.is_some()).count(),
            outcome.fallback_used,
        );
        Ok(outcome)
    }

    /// Reserve a model call for each provider up front so a refusal never
    /// leaves a request half dispatched.
    async fn query_all(
        &self,
        context: &RepairContext,
        constraints: &PatchConstraints,
    ) -> EnsembleResult<Vec<Answer>> {
        for _ in &self.providers {
            self.budget.consume_model_call()?;
        }
        let calls = self
            .providers
            .iter()
            .enumerate()
            .map(|(idx, provider)| self.call(idx, provider.as_ref(), context, constraints));
        Ok(join_all(calls).await)
    }

    async fn query_in_order(
        &self,
        context: &RepairContext,
        constraints: &PatchConstraints,
    ) -> EnsembleResult<Vec<Answer>> {
        let mut answers = Vec::new();
        for (idx, provider) in self.providers.iter().enumerate() {
            self.budget.consume_model_call()?;
            let answer = self.call(idx, provider.as_ref(), context, constraints).await;
            let done = answer.result.is_ok();
            answers.push(answer);
            if done {
                break;
            }
        }
        Ok(answers)
    }

    async fn call(
        &self,
        idx: usize,
        provider: &dyn ModelProvider,
        context: &RepairContext,
        constraints: &PatchConstraints,
    ) -> Answer {
        let timeout_ms = self.config.provider_timeout_ms;
        let started = Instant::now();
        let result = match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            provider.propose(context, constraints),
        )
        .await
        {
            Ok(Ok(candidate)) if candidate.diff().trim().is_empty() => {
                Err(ProviderFailure::EmptyPatch {
                    provider: provider.id().to_string(),
                })
            }
            Ok(result) => result,
            Err(_) => Err(ProviderFailure::Timeout {
                provider: provider.id().to_string(),
                timeout_ms,
            }),
        };
        Answer {
            idx,
            provider: provider.id().to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
            result,
        }
    }

    fn resolve(&self, answers: Vec<Answer>) -> EnsembleResult<EnsembleOutcome> {
        let attempted = answers.len();
        let primary_ok = answers
            .iter()
            .any(|a| a.idx == 0 && a.result.is_ok());

        let mut reports = Vec::with_capacity(attempted);
        let mut candidates = Vec::new();
        for answer in answers {
            let failure = match answer.result {
                Ok(candidate) => {
                    self.budget.consume_tokens(candidate.tokens_used())?;
                    candidates.push((answer.idx, candidate));
                    None
                }
                Err(failure) => {
                    warn!(provider = %answer.provider, error = %failure, "provider failed");
                    self.metrics.inc_provider_failure();
                    Some(failure)
                }
            };
            reports.push(ProviderReport {
                provider: answer.provider,
                primary: answer.idx == 0,
                duration_ms: answer.duration_ms,
                failure,
            });
        }

        if candidates.is_empty() {
            return Err(EnsembleError::AllProvidersFailed { attempted, reports });
        }

        candidates.sort_by_key(|(idx, _)| *idx);
        let (candidates, fallback_used) = if primary_ok {
            (candidates.into_iter().map(|(_, c)| c).collect(), false)
        } else {
            // first responsive secondary in configuration order, alone
            let (idx, first) = candidates.swap_remove(0);
            info!(provider = %first.provider_id(), idx, "primary failed; using fallback");
            self.metrics.inc_fallback();
            (vec![first.into_fallback()], true)
        };
        debug!(retained = candidates.len(), fallback_used, "ensemble resolved");
        Ok(EnsembleOutcome {
            candidates,
            reports,
            fallback_used,
        })
    }
}

struct Answer {
    idx: usize,
    provider: String,
    duration_ms: u64,
    result: Result<Candidate, ProviderFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{BudgetConfig, BudgetLimits};
    use crate::provider::tests::{constraints, context};
    use crate::provider::{ScriptedProvider, ScriptedReply};

    fn coordinator(
        providers: Vec<Arc<dyn ModelProvider>>,
        mode: EnsembleMode,
    ) -> (EnsembleCoordinator, Arc<BudgetGate>) {
        let budget = Arc::new(BudgetGate::new(BudgetConfig::default()));
        let coordinator = EnsembleCoordinator::new(
            providers,
            EnsembleConfig {
                mode,
                provider_timeout_ms: 200,
            },
            Arc::clone(&budget),
            Arc::new(Metrics::new()),
        );
        (coordinator, budget)
    }

    fn scripted(id: &str, reply: ScriptedReply) -> Arc<dyn ModelProvider> {
        Arc::new(ScriptedProvider::new(id, vec![reply]))
    }

    #[tokio::test]
    async fn keeps_all_valid_candidates_when_primary_answers() {
        let (c, budget) = coordinator(
            vec![
                scripted("primary", ScriptedReply::patch("a")),
                scripted("second", ScriptedReply::patch("b")),
                scripted("third", ScriptedReply::fail("down")),
            ],
            EnsembleMode::Ensemble,
        );
        let out = c.query(&context(), &constraints()).await.unwrap();
        assert_eq!(out.candidates.len(), 2);
        assert!(!out.fallback_used);
        assert!(out.candidates.iter().all(|c| !c.fallback_used()));
        assert_eq!(out.reports.len(), 3);
        assert_eq!(budget.used(crate::budget::BudgetResource::ModelCalls), 3);
    }

    #[tokio::test]
    async fn primary_timeout_falls_back_to_secondary() {
        let (c, _) = coordinator(
            vec![
                scripted("primary", ScriptedReply::Hang),
                scripted("second", ScriptedReply::delayed("fix", 10)),
            ],
            EnsembleMode::Ensemble,
        );
        let out = c.query(&context(), &constraints()).await.unwrap();
        assert!(out.fallback_used);
        assert_eq!(out.candidates.len(), 1);
        assert_eq!(out.candidates[0].provider_id(), "second");
        assert!(out.candidates[0].fallback_used());
        assert!(matches!(
            out.reports[0].failure,
            Some(ProviderFailure::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn all_failed_is_reported() {
        let (c, _) = coordinator(
            vec![
                scripted("primary", ScriptedReply::fail("x")),
                scripted("second", ScriptedReply::patch("   ")),
            ],
            EnsembleMode::Ensemble,
        );
        match c.query(&context(), &constraints()).await {
            Err(EnsembleError::AllProvidersFailed { attempted, reports }) => {
                assert_eq!(attempted, 2);
                assert!(matches!(
                    reports[1].failure,
                    Some(ProviderFailure::EmptyPatch { .. })
                ));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn single_mode_stops_at_first_success() {
        let second = Arc::new(ScriptedProvider::new("second", vec![ScriptedReply::patch("b")]));
        let (c, _) = coordinator(
            vec![scripted("primary", ScriptedReply::patch("a")), second.clone()],
            EnsembleMode::Single,
        );
        let out = c.query(&context(), &constraints()).await.unwrap();
        assert_eq!(out.candidates.len(), 1);
        assert_eq!(second.calls(), 0);
    }

    #[tokio::test]
    async fn model_call_budget_refuses_dispatch() {
        let budget = Arc::new(BudgetGate::new(BudgetConfig {
            limits: BudgetLimits {
                max_model_calls: Some(1),
                ..BudgetLimits::default()
            },
            ..BudgetConfig::default()
        }));
        let c = EnsembleCoordinator::new(
            vec![
                scripted("primary", ScriptedReply::patch("a")),
                scripted("second", ScriptedReply::patch("b")),
            ],
            EnsembleConfig::default(),
            Arc::clone(&budget),
            Arc::new(Metrics::new()),
        );
        assert!(matches!(
            c.query(&context(), &constraints()).await,
            Err(EnsembleError::Budget(_))
        ));
        assert!(budget.used(crate::budget::BudgetResource::ModelCalls) <= 1);
    }
}
