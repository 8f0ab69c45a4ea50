//! Steps and step plans.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use super::error::{PlanResult, PlanningError};

/// Lifecycle of a step. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// `Pending -> Running -> {Succeeded, Failed, Skipped}`. A step that never
    /// started may also be skipped directly.
    pub fn can_transition_to(self, next: StepState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Skipped)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Skipped)
        )
    }
}

/// What the controller does with a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Satisfied by failure detection.
    Analyze,
    /// Drives query/evaluate/review cycles until a candidate is accepted.
    Patch,
    /// Satisfied by the accepted candidate's evidence.
    Verify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Med,
    High,
}

impl RiskLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "med" | "medium" => Some(Self::Med),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// Atomic unit of work derived from a goal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub title: String,
    pub intent: String,
    pub kind: StepKind,
    #[serde(default)]
    pub allowed_files: Vec<String>,
    #[serde(default)]
    pub success_criteria: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub risk: RiskLevel,
    #[serde(default = "pending")]
    state: StepState,
}

fn pending() -> StepState {
    StepState::Pending
}

impl Step {
    pub fn new(id: impl Into<String>, title: impl Into<String>, kind: StepKind) -> Self {
        let title = title.into();
        Self {
            id: id.into(),
            intent: title.clone(),
            title,
            kind,
            allowed_files: Vec::new(),
            success_criteria: String::new(),
            dependencies: Vec::new(),
            risk: RiskLevel::Low,
            state: StepState::Pending,
        }
    }

    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = intent.into();
        self
    }

    pub fn with_allowed_files(mut self, files: &[&str]) -> Self {
        self.allowed_files = files.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_success_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.success_criteria = criteria.into();
        self
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk = risk;
        self
    }

    pub fn state(&self) -> StepState {
        self.state
    }

    pub fn transition(&mut self, to: StepState) -> PlanResult<()> {
        if !self.state.can_transition_to(to) {
            return Err(PlanningError::InvalidTransition {
                step_id: self.id.clone(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

/// Minimal-diff baseline used for scope checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeBaseline {
    pub files: u32,
    pub lines: u32,
}

impl Default for ScopeBaseline {
    fn default() -> Self {
        Self {
            files: 2,
            lines: 50,
        }
    }
}

/// Ordered decomposition of a goal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPlan {
    pub plan_id: String,
    pub goal: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub baseline: ScopeBaseline,
}

impl StepPlan {
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    pub fn ids_of(&self, kind: StepKind) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| s.id.clone())
            .collect()
    }

    /// Copy of this plan with every step reset to `Pending`, for reuse.
    pub fn fresh(&self) -> Self {
        let mut plan = self.clone();
        for step in &mut plan.steps {
            step.state = StepState::Pending;
        }
        plan
    }

    /// Check ids are unique, dependencies exist and form a DAG, and at least
    /// one patch step is present.
    pub fn validate(&self) -> PlanResult<()> {
        if self.steps.is_empty() {
            return Err(PlanningError::EmptyPlan);
        }
        let mut ids = BTreeSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(PlanningError::DuplicateStep(step.id.clone()));
            }
        }
        if !self.steps.iter().any(|s| s.kind == StepKind::Patch) {
            return Err(PlanningError::NoPatchStep);
        }
        for step in &self.steps {
            for dep in &step.dependencies {
                if !ids.contains(dep.as_str()) {
                    return Err(PlanningError::MissingDependency {
                        step_id: step.id.clone(),
                        missing: dep.clone(),
                    });
                }
            }
        }

        let mut indegree: BTreeMap<&str, usize> = ids.iter().map(|id| (*id, 0)).collect();
        let mut edges: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for step in &self.steps {
            for dep in &step.dependencies {
                edges.entry(dep.as_str()).or_default().push(step.id.as_str());
                if let Some(d) = indegree.get_mut(step.id.as_str()) {
                    *d += 1;
                }
            }
        }

        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(k, _)| *k)
            .collect();
        let mut visited = 0usize;
        while let Some(node) = queue.pop_front() {
            visited += 1;
            for next in edges.get(node).into_iter().flatten() {
                if let Some(d) = indegree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(*next);
                    }
                }
            }
        }

        if visited != self.steps.len() {
            return Err(PlanningError::CycleDetected);
        }
        Ok(())
    }
}
