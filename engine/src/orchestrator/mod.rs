//! Session orchestration.
//!
//! Drives one research session through its phases: intake, optional
//! background lookup, planning, optional clarification, the dispatch loop,
//! and reporting. Unrecoverable errors abort the session; per-step failures
//! do not, they surface in the report instead.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sdk::{CapabilityFailure, ContentBlock, CoreError, PlanningCapability, StepCapability};

use crate::budget::BudgetManager;
use crate::config::Config;
use crate::context::{full_detail_dependency_count, ContextAssembler};
use crate::dispatch::{CapabilityDispatcher, DispatchLimits};
use crate::observations::{Observation, ObservationStore};
use crate::plan::{parse, Plan, Step, StepKind, StepStatus};
use crate::report::{build_report, ReportInputs};

/// Session life-cycle phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Intake,
    BackgroundLookup,
    Planning,
    AwaitingClarification,
    DispatchLoop,
    Reporting,
    Done,
    Aborted,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Intake => "intake",
            Self::BackgroundLookup => "background_lookup",
            Self::Planning => "planning",
            Self::AwaitingClarification => "awaiting_clarification",
            Self::DispatchLoop => "dispatch_loop",
            Self::Reporting => "reporting",
            Self::Done => "done",
            Self::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

/// Reviewer verdict on a produced plan
#[derive(Debug, Clone)]
pub enum PlanReview {
    Accepted,
    Revise(String),
}

/// Optional human-or-agent gate between planning and dispatch.
///
/// `review` may suspend for as long as it likes; session cancellation and
/// the session timeout still win.
#[async_trait]
pub trait ClarificationGate: Send + Sync {
    async fn review(&self, plan: &Plan) -> PlanReview;
}

/// What the caller asks a session to research
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub topic: String,

    /// Overrides the configured locale when set
    pub locale: Option<String>,
}

impl SessionRequest {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            locale: None,
        }
    }
}

/// Final state of a completed session
#[derive(Debug)]
pub struct SessionOutcome {
    pub phase: SessionPhase,
    pub report: String,
    pub plan: Plan,

    /// Plans replaced by revision or re-planning, oldest first
    pub superseded_plans: Vec<Plan>,
}

pub struct Orchestrator {
    config: Config,
    planner: Arc<dyn PlanningCapability>,
    dispatcher: CapabilityDispatcher,
    assembler: ContextAssembler,
    budget: BudgetManager,
    gate: Option<Arc<dyn ClarificationGate>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        planner: Arc<dyn PlanningCapability>,
        research: Arc<dyn StepCapability>,
        processing: Arc<dyn StepCapability>,
    ) -> Self {
        let dispatcher =
            CapabilityDispatcher::new(research, processing, DispatchLimits::from(&config.limits));
        let assembler = ContextAssembler::new(config.context.clone());
        let budget = BudgetManager::new(config.budget.clone());
        Self {
            config,
            planner,
            dispatcher,
            assembler,
            budget,
            gate: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_clarification_gate(mut self, gate: Arc<dyn ClarificationGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run one session to completion.
    ///
    /// Per-step failures are absorbed into the report; only session-level
    /// conditions (invalid request, planning failure after retries,
    /// cancellation, session timeout) return an error.
    pub async fn run(&self, request: SessionRequest) -> Result<SessionOutcome, CoreError> {
        let deadline = Duration::from_secs(self.config.limits.session_timeout_secs);
        match tokio::time::timeout(deadline, self.run_phases(request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_secs = deadline.as_secs(), "session timed out");
                self.log_phase(SessionPhase::Aborted);
                Err(CoreError::SessionTimeout)
            }
        }
    }

    async fn run_phases(&self, request: SessionRequest) -> Result<SessionOutcome, CoreError> {
        self.log_phase(SessionPhase::Intake);
        let topic = request.topic.trim().to_string();
        if topic.is_empty() {
            self.log_phase(SessionPhase::Aborted);
            return Err(CoreError::Validation("session topic is empty".to_string()));
        }
        let locale = request
            .locale
            .unwrap_or_else(|| self.config.core.locale.clone());
        info!(topic = %topic, locale = %locale, "session started");

        let background = if self.config.core.enable_background_lookup {
            self.log_phase(SessionPhase::BackgroundLookup);
            self.background_lookup(&topic).await
        } else {
            None
        };

        let mut prior_findings: Vec<Observation> = Vec::new();
        let mut prior_sources: Vec<String> = Vec::new();
        let mut feedback: Option<String> = None;
        let mut superseded: Vec<Plan> = Vec::new();
        let mut iteration = 0usize;

        loop {
            self.check_cancelled()?;
            self.log_phase(SessionPhase::Planning);
            let mut plan = self
                .plan_with_retries(
                    &topic,
                    &locale,
                    background.as_deref(),
                    &prior_findings,
                    feedback.take(),
                )
                .await
                .map_err(|e| {
                    self.log_phase(SessionPhase::Aborted);
                    e
                })?;

            if let Some(gate) = &self.gate {
                self.log_phase(SessionPhase::AwaitingClarification);
                let review = tokio::select! {
                    _ = self.cancel.cancelled() => {
                        self.log_phase(SessionPhase::Aborted);
                        return Err(CoreError::Cancelled);
                    }
                    review = gate.review(&plan) => review,
                };
                if let PlanReview::Revise(reason) = review {
                    info!(reason = %reason, "plan sent back for revision");
                    iteration += 1;
                    if iteration >= self.config.limits.max_plan_iterations {
                        self.log_phase(SessionPhase::Aborted);
                        return Err(CoreError::Planning(
                            "plan revision budget exhausted".to_string(),
                        ));
                    }
                    feedback = Some(reason);
                    superseded.push(plan);
                    continue;
                }
            }

            if plan.has_enough_context && plan.steps.is_empty() {
                info!("plan declares sufficient context with no steps");
                return self.report(
                    plan,
                    ObservationStore::new(),
                    BTreeMap::new(),
                    background,
                    prior_findings,
                    prior_sources,
                    superseded,
                );
            }

            for (step, deps) in full_detail_dependency_count(&plan) {
                warn!(
                    step,
                    dependencies = deps,
                    "step consumes multiple dependencies at full detail"
                );
            }

            self.log_phase(SessionPhase::DispatchLoop);
            let mut observations = ObservationStore::new();
            let mut sources: BTreeMap<usize, Vec<String>> = BTreeMap::new();
            self.drive_steps(&mut plan, &mut observations, &mut sources)
                .await?;

            iteration += 1;
            if !plan.has_enough_context && iteration < self.config.limits.max_plan_iterations {
                info!(iteration, "plan reports insufficient context, re-planning");
                // The next plan gets a fresh index space; this plan's
                // findings accumulate as capped context and surface again
                // in the final report alongside their sources.
                prior_findings.extend(observations.take_all());
                prior_findings = self.budget.cap_observations(
                    &prior_findings,
                    self.config.context.max_observations,
                    self.config.context.excerpt_chars,
                );
                prior_sources.extend(sources.into_values().flatten());
                superseded.push(plan);
                continue;
            }

            return self.report(
                plan,
                observations,
                sources,
                background,
                prior_findings,
                prior_sources,
                superseded,
            );
        }
    }

    /// One background research pass over the raw topic, clamped to the
    /// lookup node's budget. Failures degrade to "no background", never
    /// abort the session.
    async fn background_lookup(&self, topic: &str) -> Option<String> {
        let step = Step {
            index: 0,
            title: "Background lookup".to_string(),
            description: format!("Gather brief background context on: {}", topic),
            kind: StepKind::Research,
            need_lookup: true,
            depends_on: vec![],
            dependency_detail: Default::default(),
            required_info: vec![],
            status: StepStatus::Pending,
            result: None,
            error: None,
        };
        let blocks = vec![ContentBlock::labeled("Background task", &step.description)
            .into_mandatory()];
        let (fitted, _) =
            self.budget
                .fit(&blocks, &self.config.core.model, "background_lookup");

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => return None,
            outcome = self.dispatcher.execute(&step, fitted) => outcome,
        };

        match outcome.status {
            StepStatus::Done => outcome.text.map(|text| {
                self.budget
                    .clamp_text(&text, &self.config.core.model, "background_lookup")
            }),
            _ => {
                warn!(
                    status = %outcome.status,
                    error = outcome.error.as_deref().unwrap_or(""),
                    "background lookup failed, continuing without it"
                );
                None
            }
        }
    }

    async fn plan_with_retries(
        &self,
        topic: &str,
        locale: &str,
        background: Option<&str>,
        prior: &[Observation],
        mut feedback: Option<String>,
    ) -> Result<Plan, CoreError> {
        let max_attempts = self.config.limits.max_plan_retries + 1;
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            self.check_cancelled()?;
            let blocks = self.assembler.build_planning_input(
                topic,
                locale,
                background,
                prior,
                feedback.as_deref(),
            );
            let (fitted, _) = self.budget.fit(&blocks, &self.config.core.model, "planner");

            let raw = tokio::select! {
                _ = self.cancel.cancelled() => return Err(CoreError::Cancelled),
                result = self.planner.plan(&fitted) => result,
            };
            let raw = match raw {
                Ok(raw) => raw,
                Err(CapabilityFailure::Transient(reason)) => {
                    warn!(attempt, reason = %reason, "planner failed transiently");
                    last_error = reason;
                    continue;
                }
                Err(failure) => return Err(CoreError::Planning(failure.to_string())),
            };

            let plan = match parse::plan_from_text(&raw, locale) {
                Ok(plan) => plan,
                Err(e) => {
                    warn!(attempt, error = %e, "plan parse failed");
                    last_error = e.to_string();
                    feedback = Some(format!(
                        "Previous output was not a parseable plan: {}",
                        last_error
                    ));
                    continue;
                }
            };

            let errors = plan.validate(self.config.limits.max_plan_steps);
            if errors.is_empty() {
                debug!(plan_id = %plan.id, steps = plan.steps.len(), "plan accepted");
                return Ok(plan);
            }

            let joined = errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            warn!(attempt, errors = %joined, "plan failed validation");
            last_error = joined.clone();
            feedback = Some(format!("Previous plan was invalid: {}", joined));
        }

        Err(CoreError::Planning(format!(
            "no valid plan after {} attempts: {}",
            max_attempts, last_error
        )))
    }

    /// Run the dispatch loop until no step is pending
    async fn drive_steps(
        &self,
        plan: &mut Plan,
        observations: &mut ObservationStore,
        sources: &mut BTreeMap<usize, Vec<String>>,
    ) -> Result<(), CoreError> {
        while let Some(i) = plan.ready_step() {
            self.check_cancelled()?;
            plan.steps[i].status = StepStatus::Running;
            let step = plan.steps[i].clone();

            let blocks = self.assembler.build_input(&plan.title, &step, observations);
            let node = match step.kind {
                StepKind::Research => "researcher",
                StepKind::Processing => "processor",
            };
            let (fitted, stats) = self.budget.fit(&blocks, &self.config.core.model, node);

            if stats.budget_exceeded {
                plan.steps[i].status = StepStatus::Failed;
                plan.steps[i].error = Some(
                    CoreError::TokenBudgetExceeded {
                        node: node.to_string(),
                        tokens: stats.original_tokens,
                        limit: self.config.budget.model_limit(&self.config.core.model),
                    }
                    .to_string(),
                );
                self.skip_blocked(plan);
                continue;
            }

            let outcome = self.execute_with_backoff(plan, i, &step, fitted).await?;

            plan.steps[i].status = outcome.status;
            plan.steps[i].error = outcome.error;
            if outcome.status == StepStatus::Done {
                let text = outcome.text.unwrap_or_default();
                plan.steps[i].result = Some(text.clone());
                observations.append(Observation::new(i, step.title.clone(), text));
                if !outcome.sources.is_empty() {
                    sources.insert(i, outcome.sources);
                }
                info!(step = i, "step completed");
            } else {
                warn!(
                    step = i,
                    status = %outcome.status,
                    error = plan.steps[i].error.as_deref().unwrap_or(""),
                    "step did not complete"
                );
            }

            self.skip_blocked(plan);
        }
        Ok(())
    }

    /// Dispatch one step, retrying rate limits with exponential backoff.
    /// Exhausted retries demote the step to Failed.
    async fn execute_with_backoff(
        &self,
        plan: &mut Plan,
        index: usize,
        step: &Step,
        blocks: Vec<ContentBlock>,
    ) -> Result<crate::dispatch::StepOutcome, CoreError> {
        let max_attempts = self.config.limits.max_rate_limit_retries + 1;
        let mut attempt = 0;

        loop {
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return Err(CoreError::Cancelled),
                outcome = self.dispatcher.execute(step, blocks.clone()) => outcome,
            };

            if outcome.status != StepStatus::RateLimited {
                return Ok(outcome);
            }
            attempt += 1;
            if attempt == max_attempts {
                return Ok(crate::dispatch::StepOutcome {
                    status: StepStatus::Failed,
                    text: None,
                    sources: Vec::new(),
                    error: Some(format!("rate limited after {} attempts", max_attempts)),
                });
            }

            // Surface the backoff state while we wait
            plan.steps[index].status = StepStatus::RateLimited;
            let delay = backoff_delay(self.config.limits.base_backoff_secs, attempt - 1);
            warn!(
                step = index,
                attempt,
                delay_secs = delay.as_secs(),
                "rate limited, backing off"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(CoreError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Mark pending steps whose dependencies terminally failed as Skipped so
    /// the loop can drain instead of stalling
    fn skip_blocked(&self, plan: &mut Plan) {
        for i in plan.blocked_steps() {
            let failed: Vec<String> = plan.steps[i]
                .depends_on
                .iter()
                .filter(|&&d| {
                    let s = plan.steps[d].status;
                    s.is_terminal() && !s.satisfies_dependency()
                })
                .map(|d| d.to_string())
                .collect();
            plan.steps[i].status = StepStatus::Skipped;
            plan.steps[i].error = Some(format!(
                "skipped: dependency step(s) {} did not complete",
                failed.join(", ")
            ));
            warn!(step = i, "step skipped, dependency failed");
        }
    }

    fn report(
        &self,
        plan: Plan,
        observations: ObservationStore,
        sources: BTreeMap<usize, Vec<String>>,
        background: Option<String>,
        earlier_findings: Vec<Observation>,
        earlier_sources: Vec<String>,
        superseded_plans: Vec<Plan>,
    ) -> Result<SessionOutcome, CoreError> {
        self.log_phase(SessionPhase::Reporting);
        let inputs = ReportInputs {
            sources,
            background,
            earlier_findings,
            earlier_sources,
        };
        let report = build_report(&plan, &observations, &inputs);
        self.log_phase(SessionPhase::Done);
        info!(
            done = plan
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Done)
                .count(),
            total = plan.steps.len(),
            "session finished"
        );
        Ok(SessionOutcome {
            phase: SessionPhase::Done,
            report,
            plan,
            superseded_plans,
        })
    }

    fn check_cancelled(&self) -> Result<(), CoreError> {
        if self.cancel.is_cancelled() {
            self.log_phase(SessionPhase::Aborted);
            return Err(CoreError::Cancelled);
        }
        Ok(())
    }

    fn log_phase(&self, phase: SessionPhase) {
        info!(phase = %phase, "session phase");
    }
}

fn backoff_delay(base_secs: u64, attempt: usize) -> Duration {
    Duration::from_secs(base_secs.saturating_mul(1u64 << attempt.min(16)))
}
