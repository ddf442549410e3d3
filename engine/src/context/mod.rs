//! Step input assembly.
//!
//! The assembler turns a step's declared dependencies plus the observation
//! store into an ordered block list. It is fully deterministic: the same
//! plan and observations always produce the same blocks. Budget enforcement
//! is not its job; the orchestrator runs assembler output through the
//! budget manager for the owning node before dispatch.

pub mod summarize;

use tracing::warn;

use sdk::ContentBlock;

use crate::config::ContextConfig;
use crate::observations::{Observation, ObservationStore};
use crate::plan::{DependencyDetail, Plan, Step};

pub use summarize::{extract_key_points, ExtractiveSummarizer, KeyPoints, Summarize};

pub struct ContextAssembler {
    summarizer: Box<dyn Summarize>,
    config: ContextConfig,
}

impl ContextAssembler {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            summarizer: Box::new(ExtractiveSummarizer),
            config,
        }
    }

    pub fn with_summarizer(config: ContextConfig, summarizer: Box<dyn Summarize>) -> Self {
        Self { summarizer, config }
    }

    /// Build the input block list for one step.
    ///
    /// Dependencies are rendered in ascending index order at the step's
    /// declared detail level; the step's own task block always comes last
    /// and is the one block trimming must preserve.
    pub fn build_input(
        &self,
        plan_title: &str,
        step: &Step,
        observations: &ObservationStore,
    ) -> Vec<ContentBlock> {
        let mut blocks = Vec::new();

        if step.dependency_detail != DependencyDetail::None {
            for dep in step.ordered_dependencies() {
                let Some(obs) = observations.by_index(dep) else {
                    warn!(
                        step = step.index,
                        dependency = dep,
                        "dependency has no recorded observation, skipping"
                    );
                    continue;
                };
                self.render_dependency(step, dep, obs, &mut blocks);
            }
        }

        blocks.push(task_block(plan_title, step));
        blocks
    }

    fn render_dependency(
        &self,
        step: &Step,
        dep: usize,
        obs: &Observation,
        blocks: &mut Vec<ContentBlock>,
    ) {
        match step.dependency_detail {
            DependencyDetail::None => {}
            DependencyDetail::Summary => {
                let summary = self
                    .summarizer
                    .summarize(&obs.content, self.config.summary_char_budget);
                blocks.push(ContentBlock::labeled(
                    format!("Prior step {}: {}", dep, obs.title),
                    summary,
                ));
            }
            DependencyDetail::KeyPoints => {
                for points in extract_key_points(&obs.content, &step.required_info) {
                    blocks.push(ContentBlock::labeled(
                        format!("Key points from step {} for '{}'", dep, points.key),
                        points.lines.join("\n"),
                    ));
                }
            }
            DependencyDetail::Full => {
                blocks.push(ContentBlock::labeled(
                    format!("Full result of step {}: {}", dep, obs.title),
                    obs.content.clone(),
                ));
            }
        }
    }

    /// Planner input: the task, optional background lookup text, capped
    /// prior observations, and any reviewer feedback, in that order.
    pub fn build_planning_input(
        &self,
        topic: &str,
        locale: &str,
        background: Option<&str>,
        prior: &[Observation],
        feedback: Option<&str>,
    ) -> Vec<ContentBlock> {
        let mut blocks = vec![ContentBlock::labeled(
            "Research topic",
            format!("{}\nLocale: {}", topic, locale),
        )
        .into_mandatory()];

        if let Some(background) = background {
            blocks.push(ContentBlock::labeled("Background lookup", background));
        }

        for obs in prior {
            blocks.push(ContentBlock::labeled(
                format!("Finding from step {}: {}", obs.step_index, obs.title),
                obs.content.clone(),
            ));
        }

        if let Some(feedback) = feedback {
            blocks.push(ContentBlock::labeled("Reviewer feedback", feedback));
        }

        blocks
    }
}

impl std::fmt::Debug for ContextAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextAssembler")
            .field("config", &self.config)
            .finish()
    }
}

/// The step's own task description, flagged mandatory so budget trimming
/// never removes it
fn task_block(plan_title: &str, step: &Step) -> ContentBlock {
    ContentBlock::labeled(
        format!("Current task (plan: {})", plan_title),
        format!("Step {}: {}\n{}", step.index, step.title, step.description),
    )
    .into_mandatory()
}

/// Warn-worthy plans: more than one dependency consumed at full detail
pub fn full_detail_dependency_count(plan: &Plan) -> Vec<(usize, usize)> {
    plan.steps
        .iter()
        .filter(|s| s.dependency_detail == DependencyDetail::Full && s.depends_on.len() > 1)
        .map(|s| (s.index, s.depends_on.len()))
        .collect()
}
