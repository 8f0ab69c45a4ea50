//! Thompson-sampling selector over persisted `(error_type, action)` outcomes.

use std::sync::{Arc, Mutex};

use patchloop_state::{OutcomeRecord, OutcomeStats, OutcomeStore, StorageResult};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::action::RepairAction;
use crate::domain::ErrorType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BanditConfig {
    /// Beta prior added to the success count.
    pub prior_alpha: f64,
    /// Beta prior added to the failure count.
    pub prior_beta: f64,
    /// Fixed RNG seed; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            prior_alpha: 1.0,
            prior_beta: 1.0,
            seed: None,
        }
    }
}

/// Beta posterior of one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posterior {
    pub action: RepairAction,
    pub alpha: f64,
    pub beta: f64,
}

impl Posterior {
    pub fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }
}

/// Result of one selection round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSelection {
    pub action: RepairAction,
    /// One draw per candidate action, in candidate order.
    pub samples: Vec<(RepairAction, f64)>,
}

/// Action memory: persisted outcome counts plus posterior sampling.
///
/// Writes go through a single async lock so concurrently finishing steps
/// append one at a time.
pub struct ActionMemory {
    store: Arc<dyn OutcomeStore>,
    config: BanditConfig,
    rng: Mutex<StdRng>,
    writer: tokio::sync::Mutex<()>,
}

impl ActionMemory {
    pub fn new(store: Arc<dyn OutcomeStore>, config: BanditConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            store,
            config,
            rng: Mutex::new(rng),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    /// Posteriors for `actions` under `error_type`. A store failure yields
    /// the bare prior.
    pub async fn posterior(&self, error_type: ErrorType, actions: &[RepairAction]) -> Vec<Posterior> {
        let stats = match self.store.query(error_type.as_str()).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error_type = %error_type, error = %e, "outcome query failed; using priors");
                OutcomeStats::from_records(error_type.as_str(), std::iter::empty::<&OutcomeRecord>())
            }
        };
        actions
            .iter()
            .map(|&action| {
                let (s, f) = stats
                    .action(action.as_str())
                    .map(|a| (a.successes, a.failures))
                    .unwrap_or((0, 0));
                Posterior {
                    action,
                    alpha: self.config.prior_alpha + s as f64,
                    beta: self.config.prior_beta + f as f64,
                }
            })
            .collect()
    }

    /// Draw once per action and pick the highest draw. Ties keep the
    /// earlier action. `actions` defaults to every action when empty.
    #[instrument(skip(self, actions), fields(error_type = %error_type))]
    pub async fn select(&self, error_type: ErrorType, actions: &[RepairAction]) -> ActionSelection {
        let actions: &[RepairAction] = if actions.is_empty() {
            &RepairAction::ALL
        } else {
            actions
        };
        let posteriors = self.posterior(error_type, actions).await;

        let samples: Vec<(RepairAction, f64)> = {
            let mut rng = match self.rng.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            posteriors
                .iter()
                .map(|p| {
                    let draw = Beta::new(p.alpha, p.beta)
                        .map(|dist| dist.sample(&mut *rng))
                        .unwrap_or_else(|_| p.mean());
                    (p.action, draw)
                })
                .collect()
        };

        let mut best = samples[0];
        for &(action, draw) in &samples[1..] {
            if draw > best.1 {
                best = (action, draw);
            }
        }
        debug!(action = %best.0, draw = best.1, "action selected");
        ActionSelection {
            action: best.0,
            samples,
        }
    }

    /// Append one outcome for the chosen action.
    pub async fn record(
        &self,
        error_type: ErrorType,
        action: RepairAction,
        success: bool,
    ) -> StorageResult<()> {
        let _guard = self.writer.lock().await;
        self.store
            .append(OutcomeRecord::new(error_type.as_str(), action.as_str(), success))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchloop_state::fakes::MemoryOutcomeStore;
    use rand::Rng;

    fn memory(seed: u64) -> (Arc<MemoryOutcomeStore>, ActionMemory) {
        let store = Arc::new(MemoryOutcomeStore::new());
        let memory = ActionMemory::new(
            store.clone(),
            BanditConfig {
                seed: Some(seed),
                ..BanditConfig::default()
            },
        );
        (store, memory)
    }

    #[tokio::test]
    async fn seeded_selection_is_deterministic() {
        let (_, a) = memory(7);
        let (_, b) = memory(7);
        for _ in 0..10 {
            let x = a.select(ErrorType::Test, &[]).await;
            let y = b.select(ErrorType::Test, &[]).await;
            assert_eq!(x, y);
        }
    }

    #[tokio::test]
    async fn record_updates_posterior() {
        let (store, memory) = memory(1);
        memory
            .record(ErrorType::Build, RepairAction::MinimalPatch, true)
            .await
            .unwrap();
        memory
            .record(ErrorType::Build, RepairAction::MinimalPatch, false)
            .await
            .unwrap();
        memory
            .record(ErrorType::Build, RepairAction::MinimalPatch, true)
            .await
            .unwrap();
        assert_eq!(store.len(), 3);

        let post = memory
            .posterior(ErrorType::Build, &[RepairAction::MinimalPatch])
            .await;
        assert_eq!(post[0].alpha, 3.0);
        assert_eq!(post[0].beta, 2.0);

        // other error types are unaffected
        let other = memory
            .posterior(ErrorType::Test, &[RepairAction::MinimalPatch])
            .await;
        assert_eq!(other[0].alpha, 1.0);
    }

    #[tokio::test]
    async fn converges_to_best_action() {
        let (_, memory) = memory(42);
        let truth = [
            (RepairAction::MinimalPatch, 0.2),
            (RepairAction::FocusOnTest, 0.5),
            (RepairAction::BroadenContext, 0.85),
        ];
        let actions: Vec<RepairAction> = truth.iter().map(|(a, _)| *a).collect();
        let mut world = StdRng::seed_from_u64(99);

        let rounds = 600;
        let mut best_late = 0;
        for round in 0..rounds {
            let choice = memory.select(ErrorType::Runtime, &actions).await.action;
            let p = truth.iter().find(|(a, _)| *a == choice).unwrap().1;
            let success = world.gen_bool(p);
            memory
                .record(ErrorType::Runtime, choice, success)
                .await
                .unwrap();
            if round >= rounds / 2 && choice == RepairAction::BroadenContext {
                best_late += 1;
            }
        }
        let share = best_late as f64 / (rounds / 2) as f64;
        assert!(share > 0.7, "best action chosen {share:.2} of late rounds");
    }
}
