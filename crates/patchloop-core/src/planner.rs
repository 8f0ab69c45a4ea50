//! Goal decomposition.
//!
//! [`PatternPlanner`] classifies the goal text and emits a fixed step
//! sequence per class. [`DecomposingPlanner`] asks a [`Decomposer`] for a
//! JSON step list, validates it, retries, and falls back to the pattern
//! planner when the response is unusable.

use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::domain::{
    Goal, PlanResult, PlanningError, RiskLevel, ScopeBaseline, Step, StepKind, StepPlan,
};
use crate::metrics::PlanSource;
use crate::provider::CommandProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlannerMode {
    /// Pattern planner only.
    #[default]
    V1,
    /// Decomposer first, pattern planner as fallback.
    V2,
}

impl std::str::FromStr for PlannerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "v1" => Ok(Self::V1),
            "v2" => Ok(Self::V2),
            other => Err(format!("unknown planner mode '{other}'")),
        }
    }
}

/// Facts about the project a planner may use.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanningContext {
    pub language: String,
    pub test_cmd: Vec<String>,
    pub failing_tests: Vec<String>,
    pub error_excerpt: String,
    /// Source globs from the buildpack.
    pub source_globs: Vec<String>,
    /// Globs where tests live, when known.
    pub test_globs: Vec<String>,
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn decompose(&self, goal: &Goal, context: &PlanningContext) -> PlanResult<StepPlan>;

    /// Where the most recent plan came from.
    fn last_source(&self) -> PlanSource;
}

/// `plan-` followed by the first 12 hex chars of sha256(`{goal}:{seed}`).
pub fn plan_id(goal: &str, seed: u64) -> String {
    let digest = Sha256::digest(format!("{goal}:{seed}").as_bytes());
    format!("plan-{}", &hex::encode(digest)[..12])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalKind {
    Repair,
    Feature,
    Generic,
}

impl GoalKind {
    pub fn classify(goal: &str) -> Self {
        let lowered = goal.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| lowered.contains(w));
        if has(&["fix", "repair", "failing test", "broken", "bug"]) {
            Self::Repair
        } else if has(&["add", "feature", "implement", "create", "new"]) {
            Self::Feature
        } else {
            Self::Generic
        }
    }
}

// ---------------------------------------------------------------------------
// PatternPlanner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct PatternPlanner {
    seed: u64,
}

impl PatternPlanner {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn plan(&self, goal: &Goal, context: &PlanningContext) -> StepPlan {
        let kind = GoalKind::classify(goal.intent());
        let source = globs(&context.source_globs, &["src/**"]);
        let tests = globs(&context.test_globs, &["tests/**"]);
        let steps = match kind {
            GoalKind::Repair => repair_steps(&source, &tests),
            GoalKind::Feature => feature_steps(&source, &tests),
            GoalKind::Generic => generic_steps(),
        };
        debug!(?kind, steps = steps.len(), "pattern plan");
        StepPlan {
            plan_id: plan_id(goal.intent(), self.seed),
            goal: goal.intent().to_string(),
            steps,
            assumptions: vec![format!("{kind:?} goal decomposed by pattern").to_lowercase()],
            baseline: ScopeBaseline::default(),
        }
    }
}

fn globs(found: &[String], fallback: &[&str]) -> Vec<String> {
    if found.is_empty() {
        fallback.iter().map(|s| s.to_string()).collect()
    } else {
        found.to_vec()
    }
}

fn with_files(step: Step, files: &[String]) -> Step {
    let refs: Vec<&str> = files.iter().map(String::as_str).collect();
    step.with_allowed_files(&refs)
}

fn repair_steps(source: &[String], tests: &[String]) -> Vec<Step> {
    vec![
        with_files(
            Step::new("analyze-failure", "Analyze test failure", StepKind::Analyze)
                .with_intent("Understand why the test fails and identify the root cause")
                .with_success_criteria("Failure root cause identified"),
            tests,
        ),
        with_files(
            Step::new("locate-source", "Locate bug source", StepKind::Analyze)
                .with_intent("Find the function or line causing the failure")
                .with_success_criteria("Faulty code location identified")
                .depends_on(&["analyze-failure"]),
            source,
        ),
        with_files(
            Step::new("propose-fix", "Generate fix patch", StepKind::Patch)
                .with_intent("Create minimal patch to fix the identified bug")
                .with_success_criteria("Patch applies cleanly")
                .depends_on(&["locate-source"])
                .with_risk(RiskLevel::Med),
            source,
        ),
        Step::new("verify-focused", "Verify focused test", StepKind::Verify)
            .with_intent("Confirm the failing tests now pass")
            .with_success_criteria("Target tests pass")
            .depends_on(&["propose-fix"]),
        Step::new("verify-regression", "Check for regressions", StepKind::Verify)
            .with_intent("Ensure no other tests broke")
            .with_success_criteria("No regressions introduced")
            .depends_on(&["verify-focused"]),
        Step::new("verify-full", "Full test suite", StepKind::Verify)
            .with_intent("Final verification with a complete test run")
            .with_success_criteria("All tests pass")
            .depends_on(&["verify-regression"]),
    ]
}

fn feature_steps(source: &[String], tests: &[String]) -> Vec<Step> {
    vec![
        Step::new("understand-requirements", "Parse requirements", StepKind::Analyze)
            .with_intent("Extract the fields and behaviours needed")
            .with_allowed_files(&["docs/**", "README*"])
            .with_success_criteria("Requirements documented"),
        with_files(
            Step::new("design-approach", "Design solution", StepKind::Analyze)
                .with_intent("Plan the implementation approach")
                .with_success_criteria("Design approach defined")
                .depends_on(&["understand-requirements"]),
            source,
        ),
        with_files(
            Step::new("implement-core", "Implement core logic", StepKind::Patch)
                .with_intent("Write the main implementation code")
                .with_success_criteria("Core implementation complete")
                .depends_on(&["design-approach"])
                .with_risk(RiskLevel::Med),
            source,
        ),
        with_files(
            Step::new("add-tests", "Add unit tests", StepKind::Patch)
                .with_intent("Create tests for the new functionality")
                .with_success_criteria("Tests exist for new code")
                .depends_on(&["implement-core"]),
            tests,
        ),
        Step::new("verify-new-tests", "Run new tests", StepKind::Verify)
            .with_intent("Ensure the new tests pass")
            .with_success_criteria("New tests pass")
            .depends_on(&["add-tests"]),
        Step::new("update-docs", "Update documentation", StepKind::Patch)
            .with_intent("Document the new functionality")
            .with_allowed_files(&["docs/**", "README*"])
            .with_success_criteria("Documentation updated")
            .depends_on(&["verify-new-tests"]),
        Step::new("verify-full", "Full test suite", StepKind::Verify)
            .with_intent("Final regression check")
            .with_success_criteria("All tests pass")
            .depends_on(&["update-docs"]),
    ]
}

fn generic_steps() -> Vec<Step> {
    vec![
        Step::new("analyze", "Analyze task", StepKind::Analyze)
            .with_intent("Understand what needs to be done")
            .with_allowed_files(&["**"])
            .with_success_criteria("Task understood"),
        Step::new("implement", "Implement changes", StepKind::Patch)
            .with_intent("Make the required changes")
            .with_allowed_files(&["**"])
            .with_success_criteria("Changes implemented")
            .depends_on(&["analyze"])
            .with_risk(RiskLevel::Med),
        Step::new("verify", "Verify changes", StepKind::Verify)
            .with_intent("Confirm the changes work")
            .with_success_criteria("All tests pass")
            .depends_on(&["implement"]),
    ]
}

#[async_trait]
impl Planner for PatternPlanner {
    async fn decompose(&self, goal: &Goal, context: &PlanningContext) -> PlanResult<StepPlan> {
        let plan = self.plan(goal, context);
        plan.validate()?;
        Ok(plan)
    }

    fn last_source(&self) -> PlanSource {
        PlanSource::Pattern
    }
}

// ---------------------------------------------------------------------------
// DecomposingPlanner
// ---------------------------------------------------------------------------

/// Model-backed source of a raw decomposition response.
#[async_trait]
pub trait Decomposer: Send + Sync {
    async fn decompose_raw(&self, prompt: &str) -> Result<String, String>;
}

#[async_trait]
impl Decomposer for CommandProvider {
    async fn decompose_raw(&self, prompt: &str) -> Result<String, String> {
        self.complete(prompt).await.map_err(|e| e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecomposerConfig {
    pub max_retries: u32,
    pub min_steps: usize,
    pub max_steps: usize,
}

impl Default for DecomposerConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            min_steps: 2,
            max_steps: 10,
        }
    }
}

const REQUIRED_FIELDS: [&str; 5] = ["step_id", "title", "intent", "allowed_files", "success_criteria"];
const FORBIDDEN_FILES: [&str; 4] = ["controller.py", "safety.py", ".env", "secrets/"];

const SYSTEM_PROMPT: &str = "\
You are a software engineering planner. Decompose the goal into atomic, ordered steps.
Each step names the files it may touch, its success criteria and its dependencies.
Never include .env files, secrets/ or credentials.
Reply with a JSON array of objects with the fields:
step_id, title, intent, kind (analyze|patch|verify), allowed_files, success_criteria,
dependencies, risk_level (LOW|MED|HIGH).";

pub struct DecomposingPlanner {
    decomposer: Box<dyn Decomposer>,
    fallback: PatternPlanner,
    config: DecomposerConfig,
    seed: u64,
    last_source: Mutex<PlanSource>,
}

impl DecomposingPlanner {
    pub fn new(decomposer: Box<dyn Decomposer>, config: DecomposerConfig, seed: u64) -> Self {
        Self {
            decomposer,
            fallback: PatternPlanner::new(seed),
            config,
            seed,
            last_source: Mutex::new(PlanSource::Pattern),
        }
    }

    pub fn prompt(&self, goal: &Goal, context: &PlanningContext) -> String {
        let failing = if context.failing_tests.is_empty() {
            "None".to_string()
        } else {
            context.failing_tests.join(", ")
        };
        let excerpt: String = context.error_excerpt.chars().take(200).collect();
        format!(
            "{SYSTEM_PROMPT}\n\nGoal: {}\n\nContext:\n- Language: {}\n- Test command: {}\n- Failing tests: {}\n- Error: {}\n\nDecompose this goal into {}-{} steps. Output only the JSON array.",
            goal.intent(),
            context.language,
            context.test_cmd.join(" "),
            failing,
            if excerpt.is_empty() { "None" } else { &excerpt },
            self.config.min_steps,
            self.config.max_steps,
        )
    }

    fn set_source(&self, source: PlanSource) {
        if let Ok(mut last) = self.last_source.lock() {
            *last = source;
        }
    }

    fn build(&self, goal: &Goal, raw: &str) -> PlanResult<StepPlan> {
        let items = extract_steps(raw)
            .ok_or_else(|| PlanningError::Decomposition("no JSON step array in response".into()))?;
        if items.len() < self.config.min_steps || items.len() > self.config.max_steps {
            return Err(PlanningError::Decomposition(format!(
                "{} steps outside {}..={}",
                items.len(),
                self.config.min_steps,
                self.config.max_steps
            )));
        }
        let steps = items
            .iter()
            .map(step_from_json)
            .collect::<PlanResult<Vec<_>>>()?;
        let plan = StepPlan {
            plan_id: plan_id(goal.intent(), self.seed),
            goal: goal.intent().to_string(),
            steps,
            assumptions: vec!["model-generated decomposition".into()],
            baseline: ScopeBaseline::default(),
        };
        plan.validate()?;
        Ok(plan)
    }
}

#[async_trait]
impl Planner for DecomposingPlanner {
    #[instrument(skip_all, fields(goal = %goal.intent()))]
    async fn decompose(&self, goal: &Goal, context: &PlanningContext) -> PlanResult<StepPlan> {
        let prompt = self.prompt(goal, context);
        for attempt in 1..=self.config.max_retries {
            match self.decomposer.decompose_raw(&prompt).await {
                Ok(raw) => match self.build(goal, &raw) {
                    Ok(plan) => {
                        info!(attempt, steps = plan.steps.len(), "decomposition accepted");
                        self.set_source(PlanSource::Decomposer);
                        return Ok(plan);
                    }
                    Err(e) => warn!(attempt, error = %e, "decomposition rejected"),
                },
                Err(e) => warn!(attempt, error = %e, "decomposer call failed"),
            }
        }
        info!("falling back to pattern planner");
        self.set_source(PlanSource::Pattern);
        self.fallback.decompose(goal, context).await
    }

    fn last_source(&self) -> PlanSource {
        self.last_source
            .lock()
            .map(|s| *s)
            .unwrap_or(PlanSource::Pattern)
    }
}

/// Pull the step array out of a response that may wrap it in prose.
fn extract_steps(raw: &str) -> Option<Vec<Value>> {
    static ARRAY: OnceLock<Regex> = OnceLock::new();
    let re = ARRAY.get_or_init(|| Regex::new(r"(?s)\[\s*\{.*\}\s*\]").expect("static regex"));
    if let Some(m) = re.find(raw) {
        if let Ok(Value::Array(items)) = serde_json::from_str(m.as_str()) {
            return Some(items);
        }
    }
    match serde_json::from_str(raw.trim()) {
        Ok(Value::Array(items)) => Some(items),
        _ => None,
    }
}

fn step_from_json(item: &Value) -> PlanResult<Step> {
    let invalid = |msg: String| PlanningError::Decomposition(msg);
    let obj = item
        .as_object()
        .ok_or_else(|| invalid("step is not an object".into()))?;
    for field in REQUIRED_FIELDS {
        if !obj.contains_key(field) {
            return Err(invalid(format!("step missing '{field}'")));
        }
    }
    let text = |key: &str| obj.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
    let list = |key: &str| -> Vec<String> {
        obj.get(key)
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(String::from).collect())
            .unwrap_or_default()
    };

    let files = list("allowed_files");
    if let Some(bad) = files
        .iter()
        .find(|f| FORBIDDEN_FILES.iter().any(|x| f.contains(x)))
    {
        return Err(invalid(format!("forbidden file in allowed_files: {bad}")));
    }

    let id = text("step_id");
    if id.trim().is_empty() {
        return Err(invalid("empty step_id".into()));
    }
    let title = text("title");
    let intent = text("intent");
    let kind = match text("kind").to_ascii_lowercase().as_str() {
        "analyze" => StepKind::Analyze,
        "patch" => StepKind::Patch,
        "verify" => StepKind::Verify,
        _ => infer_kind(&id, &title, &intent, &files),
    };

    let mut step = Step::new(id, title, kind)
        .with_intent(intent)
        .with_success_criteria(text("success_criteria"))
        .with_risk(RiskLevel::parse(&text("risk_level")).unwrap_or(RiskLevel::Low));
    step.allowed_files = files;
    step.dependencies = list("dependencies");
    Ok(step)
}

fn infer_kind(id: &str, title: &str, intent: &str, files: &[String]) -> StepKind {
    let words = format!("{id} {title} {intent}").to_lowercase();
    if files.is_empty() || words.contains("verify") || words.contains("run tests") {
        StepKind::Verify
    } else if ["analy", "understand", "locate", "design", "identify", "investigate"]
        .iter()
        .any(|w| words.contains(w))
    {
        StepKind::Analyze
    } else {
        StepKind::Patch
    }
}
