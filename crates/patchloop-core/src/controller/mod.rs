//! Controller Loop.
//!
//! A finite state machine over
//! `DETECTING -> PLANNING -> QUERYING -> EVALUATING -> QA_REVIEW -> APPLYING -> DONE`
//! with the error exits `HALTED` and `FAILED`. Retries re-enter `QUERYING`
//! and are bounded by the budget gate's step limit and the halt checker.
//!
//! Long-lived collaborators (stores, plan cache, action memory, QA ledger,
//! metrics) belong to the [`Controller`]; everything scoped to one run
//! (budget, sandboxes, halt state) is created per [`Controller::run`].

mod run;
mod state;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use patchloop_state::fakes::{MemoryOutcomeStore, MemoryPlanStore};
use patchloop_state::{OutcomeStore, PlanStore};
use tracing::{info, Instrument};

use crate::buildpack::{detect_buildpack, BuildSpec, Buildpack};
use crate::config::RunConfig;
use crate::domain::{Goal, PatchloopError, Result};
use crate::memory::ActionMemory;
use crate::metrics::Metrics;
use crate::plan_cache::PlanCache;
use crate::planner::{Decomposer, DecomposingPlanner, PatternPlanner, Planner, PlannerMode};
use crate::provider::ModelProvider;
use crate::qa::{QaGate, StaticScanner};
use crate::report::RunReport;

pub use state::{ControllerState, RunStatus, TerminationReason};

pub struct Controller {
    repo: PathBuf,
    config: RunConfig,
    buildpack: Arc<dyn Buildpack>,
    providers: Vec<Arc<dyn ModelProvider>>,
    planner: Arc<dyn Planner>,
    plan_cache: Arc<PlanCache>,
    memory: Arc<ActionMemory>,
    qa: Arc<QaGate>,
    scanner: StaticScanner,
    metrics: Arc<Metrics>,
}

impl Controller {
    pub fn builder(repo: impl Into<PathBuf>) -> ControllerBuilder {
        ControllerBuilder::new(repo)
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn buildpack(&self) -> &dyn Buildpack {
        self.buildpack.as_ref()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn plan_cache(&self) -> &PlanCache {
        &self.plan_cache
    }

    /// Build spec for `goal`: the buildpack's commands with the goal's test
    /// command as the full suite.
    fn spec_for(&self, goal: &Goal) -> BuildSpec {
        let mut spec = self.buildpack.build_spec(&self.repo);
        spec.test_cmd = goal.test_cmd().to_vec();
        spec
    }

    /// Run the loop for `goal` to a terminal state. Never fails: every
    /// outcome, including infrastructure failure, is a report.
    pub async fn run(&self, goal: &Goal) -> RunReport {
        self.run_with_id(uuid::Uuid::new_v4().to_string(), goal).await
    }

    pub async fn run_with_id(&self, run_id: String, goal: &Goal) -> RunReport {
        let span = crate::obs::run_span(&run_id);
        run::execute(self, run_id, goal).instrument(span).await
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct ControllerBuilder {
    repo: PathBuf,
    config: RunConfig,
    buildpack: Option<Arc<dyn Buildpack>>,
    buildpack_selection: String,
    providers: Vec<Arc<dyn ModelProvider>>,
    planner: Option<Arc<dyn Planner>>,
    decomposer: Option<Box<dyn Decomposer>>,
    outcomes: Option<Arc<dyn OutcomeStore>>,
    plans: Option<Arc<dyn PlanStore>>,
    metrics: Option<Arc<Metrics>>,
}

impl ControllerBuilder {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self {
            repo: repo.into(),
            config: RunConfig::default(),
            buildpack: None,
            buildpack_selection: "auto".into(),
            providers: Vec::new(),
            planner: None,
            decomposer: None,
            outcomes: None,
            plans: None,
            metrics: None,
        }
    }

    pub fn config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    pub fn buildpack(mut self, buildpack: Arc<dyn Buildpack>) -> Self {
        self.buildpack = Some(buildpack);
        self
    }

    /// `auto` or a built-in buildpack name. Ignored when a buildpack is set.
    pub fn buildpack_selection(mut self, selection: impl Into<String>) -> Self {
        self.buildpack_selection = selection.into();
        self
    }

    /// Add a provider. The first one added is the primary.
    pub fn provider(mut self, provider: Arc<dyn ModelProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    /// Decomposer for planner mode `v2`.
    pub fn decomposer(mut self, decomposer: Box<dyn Decomposer>) -> Self {
        self.decomposer = Some(decomposer);
        self
    }

    pub fn outcome_store(mut self, store: Arc<dyn OutcomeStore>) -> Self {
        self.outcomes = Some(store);
        self
    }

    pub fn plan_store(mut self, store: Arc<dyn PlanStore>) -> Self {
        self.plans = Some(store);
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<Controller> {
        self.config.validate()?;
        if !self.repo.is_dir() {
            return Err(PatchloopError::InvalidConfig(format!(
                "repository path {} is not a directory",
                self.repo.display()
            )));
        }
        if self.providers.is_empty() {
            return Err(PatchloopError::InvalidConfig(
                "at least one model provider is required".into(),
            ));
        }

        let buildpack = match self.buildpack {
            Some(buildpack) => buildpack,
            None => detect_buildpack(&self.repo, &self.buildpack_selection).ok_or_else(|| {
                PatchloopError::InvalidConfig(format!(
                    "no buildpack '{}' for {}",
                    self.buildpack_selection,
                    self.repo.display()
                ))
            })?,
        };

        let seed = self.config.seed;
        let planner: Arc<dyn Planner> = match (self.planner, self.config.planner_mode) {
            (Some(planner), _) => planner,
            (None, PlannerMode::V1) => Arc::new(PatternPlanner::new(seed)),
            (None, PlannerMode::V2) => {
                let decomposer = self.decomposer.ok_or_else(|| {
                    PatchloopError::InvalidConfig("planner mode v2 needs a decomposer".into())
                })?;
                Arc::new(DecomposingPlanner::new(
                    decomposer,
                    self.config.decomposer.clone(),
                    seed,
                ))
            }
        };

        let metrics = self.metrics.unwrap_or_default();
        let outcomes = self
            .outcomes
            .unwrap_or_else(|| Arc::new(MemoryOutcomeStore::new()));
        let plans = self.plans.unwrap_or_else(|| Arc::new(MemoryPlanStore::new()));
        let qa = QaGate::new(self.config.qa.clone())?;
        let scanner = qa.scanner()?;

        info!(
            repo = %self.repo.display(),
            buildpack = buildpack.name(),
            providers = self.providers.len(),
            planner_mode = ?self.config.planner_mode,
            "controller ready"
        );
        Ok(Controller {
            plan_cache: Arc::new(PlanCache::new(
                plans,
                self.config.plan_cache.clone(),
                Arc::clone(&metrics),
            )),
            memory: Arc::new(ActionMemory::new(outcomes, self.config.bandit.clone())),
            repo: self.repo,
            config: self.config,
            buildpack,
            providers: self.providers,
            planner,
            qa: Arc::new(qa),
            scanner,
            metrics,
        })
    }
}
