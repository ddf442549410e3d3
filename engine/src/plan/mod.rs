//! Plan and step model
//!
//! The plan is produced once by the planning capability and validated before
//! any dispatch. Steps form a total order; `depends_on` indices are only
//! valid when they point strictly backwards in that order. After planning,
//! only a step's `status`/`result`/`error` mutate; re-planning replaces the
//! whole Plan value.

pub mod parse;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Nature of a step: whether it needs the external lookup capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// Gathers external information (web research, retrieval)
    Research,

    /// Transforms/aggregates already-gathered information
    Processing,
}

/// How much of a dependency's result the step may see
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyDetail {
    /// No prior output at all
    #[default]
    None,

    /// Bounded summary of each dependency
    Summary,

    /// Only lines matching the declared `required_info` keys
    KeyPoints,

    /// Complete dependency output (high-cost; use sparingly)
    Full,
}

/// Execution status of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Done,
    Skipped,
    Failed,
    RateLimited,
}

impl StepStatus {
    /// A terminal status will never change again
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Skipped | Self::Failed)
    }

    /// Whether this status satisfies a dependent step's scheduling guard
    pub fn satisfies_dependency(self) -> bool {
        matches!(self, Self::Done | Self::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::RateLimited => "rate_limited",
        };
        write!(f, "{}", s)
    }
}

/// One unit of plan execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Position in the plan; assigned at parse time, not trusted from wire
    #[serde(default)]
    pub index: usize,

    pub title: String,

    pub description: String,

    /// Research or processing
    #[serde(alias = "step_type")]
    pub kind: StepKind,

    /// Whether the step requires external lookup; must agree with `kind`
    #[serde(default, alias = "need_search")]
    pub need_lookup: bool,

    /// Indices of prior steps this step needs information from
    #[serde(default)]
    pub depends_on: Vec<usize>,

    /// Level of detail needed from the dependencies
    #[serde(default, alias = "dependency_type")]
    pub dependency_detail: DependencyDetail,

    /// Specific information keys, meaningful only with `KeyPoints`
    #[serde(default)]
    pub required_info: Vec<String>,

    #[serde(default)]
    pub status: StepStatus,

    /// Result text; immutable once status becomes Done
    #[serde(default)]
    pub result: Option<String>,

    /// Failure detail for observability and the report appendix
    #[serde(default)]
    pub error: Option<String>,
}

impl Step {
    /// Dependency indices in ascending order with duplicates removed
    pub fn ordered_dependencies(&self) -> Vec<usize> {
        let mut deps = self.depends_on.clone();
        deps.sort_unstable();
        deps.dedup();
        deps
    }
}

/// A validated execution plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub locale: String,

    pub title: String,

    /// The planner's reasoning for the plan shape
    #[serde(default, alias = "thought")]
    pub rationale: String,

    /// When true with zero steps, dispatch is skipped entirely
    #[serde(default)]
    pub has_enough_context: bool,

    #[serde(default)]
    pub steps: Vec<Step>,
}

/// Validation failures for a produced plan
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("plan declares {count} steps, maximum is {max}")]
    TooManySteps { count: usize, max: usize },

    #[error("step {step} depends on step {dep} (forward or self reference)")]
    ForwardDependency { step: usize, dep: usize },

    #[error("step {step} uses key_points detail but declares no required_info")]
    MissingRequiredInfo { step: usize },

    #[error("step {step} kind does not match its lookup requirement")]
    KindMismatch { step: usize },
}

impl Plan {
    /// Validate the plan before any dispatch.
    ///
    /// Checks: step count ceiling, backward-only dependencies, required_info
    /// presence for key_points steps, and kind/lookup consistency. A plan
    /// with any error is rejected; the orchestrator treats that as a
    /// planning failure, not a per-step failure.
    pub fn validate(&self, max_steps: usize) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.steps.len() > max_steps {
            errors.push(ValidationError::TooManySteps {
                count: self.steps.len(),
                max: max_steps,
            });
        }

        for (i, step) in self.steps.iter().enumerate() {
            for &dep in &step.depends_on {
                if dep >= i {
                    errors.push(ValidationError::ForwardDependency { step: i, dep });
                }
            }

            if step.dependency_detail == DependencyDetail::KeyPoints
                && step.required_info.is_empty()
            {
                errors.push(ValidationError::MissingRequiredInfo { step: i });
            }

            let lookup_expected = step.kind == StepKind::Research;
            if step.need_lookup != lookup_expected {
                errors.push(ValidationError::KindMismatch { step: i });
            }
        }

        errors
    }

    /// Lowest-index pending step whose dependencies are all done or skipped
    pub fn ready_step(&self) -> Option<usize> {
        self.steps.iter().position(|step| {
            step.status == StepStatus::Pending
                && step
                    .depends_on
                    .iter()
                    .all(|&dep| self.steps[dep].status.satisfies_dependency())
        })
    }

    /// Pending steps that can never run because a dependency ended in a
    /// terminal non-satisfying state
    pub fn blocked_steps(&self) -> Vec<usize> {
        self.steps
            .iter()
            .enumerate()
            .filter(|(_, step)| {
                step.status == StepStatus::Pending
                    && step.depends_on.iter().any(|&dep| {
                        let s = self.steps[dep].status;
                        s.is_terminal() && !s.satisfies_dependency()
                    })
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// True once no step is pending or running
    pub fn is_drained(&self) -> bool {
        self.steps
            .iter()
            .all(|s| !matches!(s.status, StepStatus::Pending | StepStatus::Running))
    }
}
