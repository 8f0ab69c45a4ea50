//! Run configuration.
//!
//! `RunConfig` aggregates every component's settings. All sections default,
//! so a TOML file only needs the keys it overrides:
//!
//! ```toml
//! planner_mode = "v2"
//!
//! [budget.limits]
//! max_steps = 6
//!
//! [evaluator]
//! workers = 2
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::budget::BudgetConfig;
use crate::domain::{PatchloopError, Result};
use crate::ensemble::EnsembleConfig;
use crate::evaluator::EvaluatorConfig;
use crate::halt::HaltConfig;
use crate::memory::BanditConfig;
use crate::plan_cache::PlanCacheConfig;
use crate::planner::{DecomposerConfig, PlannerMode};
use crate::qa::QaConfig;
use crate::sandbox::SandboxConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub planner_mode: PlannerMode,
    /// Seed mixed into plan ids.
    pub seed: u64,
    pub budget: BudgetConfig,
    pub sandbox: SandboxConfig,
    pub evaluator: EvaluatorConfig,
    pub ensemble: EnsembleConfig,
    pub qa: QaConfig,
    pub halt: HaltConfig,
    pub plan_cache: PlanCacheConfig,
    pub bandit: BanditConfig,
    pub decomposer: DecomposerConfig,
}

impl RunConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| PatchloopError::InvalidConfig(e.to_string()))
    }

    /// Size the worker pool and the sandbox bound together.
    pub fn with_parallel_patches(mut self, k: usize) -> Self {
        self.evaluator.workers = k;
        self.sandbox.max_live = k;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(PatchloopError::InvalidConfig(msg.to_string()));
        if self.evaluator.workers == 0 {
            return invalid("evaluator.workers must be at least 1");
        }
        if self.sandbox.max_live < self.evaluator.workers {
            return invalid("sandbox.max_live must be at least evaluator.workers");
        }
        let threshold = self.budget.warning_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return invalid("budget.warning_threshold must be in (0, 1]");
        }
        if self.budget.exhaust_after == 0 {
            return invalid("budget.exhaust_after must be at least 1");
        }
        let similarity = self.plan_cache.similarity_threshold;
        if !(similarity > 0.0 && similarity <= 1.0) {
            return invalid("plan_cache.similarity_threshold must be in (0, 1]");
        }
        if self.halt.scope_growth_ratio < 1.0 {
            return invalid("halt.scope_growth_ratio must be at least 1.0");
        }
        // an escalated candidate is evaluated twice before it can be rejected
        if self.halt.max_flaky_repeats < 3 {
            return invalid("halt.max_flaky_repeats must be at least 3");
        }
        if self.bandit.prior_alpha <= 0.0 || self.bandit.prior_beta <= 0.0 {
            return invalid("bandit priors must be positive");
        }
        if self.decomposer.min_steps > self.decomposer.max_steps {
            return invalid("decomposer.min_steps exceeds max_steps");
        }
        self.qa.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::EnsembleMode;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = RunConfig::from_toml_str(
            r#"
            planner_mode = "v2"

            [budget.limits]
            max_steps = 6

            [ensemble]
            mode = "single"
            "#,
        )
        .unwrap();
        assert_eq!(config.planner_mode, PlannerMode::V2);
        assert_eq!(config.budget.limits.max_steps, Some(6));
        assert_eq!(config.budget.limits.max_tokens, None);
        assert!(config.budget.enforce);
        assert_eq!(config.ensemble.mode, EnsembleMode::Single);
        assert_eq!(config.evaluator.workers, 3);
        assert_eq!(config.plan_cache.similarity_threshold, 0.85);
    }

    #[test]
    fn toml_round_trip() {
        let config = RunConfig::default().with_parallel_patches(5);
        let text = config.to_toml().unwrap();
        assert_eq!(RunConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn rejects_inconsistent_values() {
        let mut config = RunConfig::default();
        config.sandbox.max_live = 1;
        assert!(matches!(
            config.validate(),
            Err(PatchloopError::InvalidConfig(_))
        ));
        assert!(RunConfig::from_toml_str("[budget]\nwarning_threshold = 1.5").is_err());
        assert!(RunConfig::from_toml_str("planner_mode = \"v9\"").is_err());
        assert!(RunConfig::from_toml_str("[halt]\nmax_flaky_repeats = 2").is_err());
    }
}
