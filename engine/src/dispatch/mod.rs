//! Capability dispatch.
//!
//! One step at a time goes through a bounded agentic loop: the capability
//! either answers or requests a tool run, whose result is appended to the
//! input blocks for the next turn. The whole loop sits under a per-step
//! timeout, and every failure leaving this module is already classified
//! into a step status.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use sdk::errors::CoreError;
use sdk::{CapabilityFailure, CapabilityOutput, CapabilityResponse, ContentBlock, StepCapability};

use crate::config::LimitsConfig;
use crate::plan::{Step, StepKind, StepStatus};

/// Per-step execution ceilings
#[derive(Debug, Clone)]
pub struct DispatchLimits {
    pub max_tool_calls: usize,
    pub max_transient_retries: usize,
    pub step_timeout: Duration,
}

impl From<&LimitsConfig> for DispatchLimits {
    fn from(limits: &LimitsConfig) -> Self {
        Self {
            max_tool_calls: limits.max_tool_calls_per_step,
            max_transient_retries: limits.max_transient_retries,
            step_timeout: Duration::from_secs(limits.step_timeout_secs),
        }
    }
}

/// Result of dispatching one step, already mapped to a status
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub status: StepStatus,
    pub text: Option<String>,
    pub sources: Vec<String>,
    pub error: Option<String>,
}

impl StepOutcome {
    fn done(output: CapabilityOutput) -> Self {
        Self {
            status: StepStatus::Done,
            text: Some(output.text),
            sources: output.sources,
            error: None,
        }
    }

    fn terminal(status: StepStatus, error: String) -> Self {
        Self {
            status,
            text: None,
            sources: Vec::new(),
            error: Some(error),
        }
    }
}

/// Routes steps to the research or processing capability and runs the
/// agentic loop to completion
pub struct CapabilityDispatcher {
    research: Arc<dyn StepCapability>,
    processing: Arc<dyn StepCapability>,
    limits: DispatchLimits,
}

impl CapabilityDispatcher {
    pub fn new(
        research: Arc<dyn StepCapability>,
        processing: Arc<dyn StepCapability>,
        limits: DispatchLimits,
    ) -> Self {
        Self {
            research,
            processing,
            limits,
        }
    }

    /// Execute one step against its capability.
    ///
    /// Never returns an error: every failure mode, including the per-step
    /// timeout, comes back as a classified [`StepOutcome`].
    pub async fn execute(&self, step: &Step, blocks: Vec<ContentBlock>) -> StepOutcome {
        let capability = match step.kind {
            StepKind::Research => Arc::clone(&self.research),
            StepKind::Processing => Arc::clone(&self.processing),
        };

        debug!(
            step = step.index,
            capability = capability.name(),
            blocks = blocks.len(),
            "dispatching step"
        );

        let run = self.run_loop(capability.as_ref(), step, blocks);
        match tokio::time::timeout(self.limits.step_timeout, run).await {
            Ok(Ok(output)) => StepOutcome::done(output),
            Ok(Err(failure)) => classify_failure(step, failure),
            Err(_) => {
                warn!(
                    step = step.index,
                    timeout_secs = self.limits.step_timeout.as_secs(),
                    "step timed out"
                );
                StepOutcome::terminal(
                    StepStatus::Failed,
                    CoreError::StepTimeout { step: step.index }.to_string(),
                )
            }
        }
    }

    async fn run_loop(
        &self,
        capability: &dyn StepCapability,
        step: &Step,
        mut blocks: Vec<ContentBlock>,
    ) -> sdk::capability::Result<CapabilityOutput> {
        let mut tool_calls_left = self.limits.max_tool_calls;
        let mut transient_left = self.limits.max_transient_retries;

        loop {
            let response = match capability.generate(&blocks).await {
                Ok(response) => response,
                Err(CapabilityFailure::Transient(reason)) if transient_left > 0 => {
                    transient_left -= 1;
                    warn!(
                        step = step.index,
                        retries_left = transient_left,
                        reason = %reason,
                        "transient failure, retrying"
                    );
                    continue;
                }
                Err(failure) => return Err(failure),
            };

            let request = match response {
                CapabilityResponse::Final(output) => return Ok(output),
                CapabilityResponse::ToolRequest(request) => request,
            };

            if tool_calls_left == 0 {
                return Err(CapabilityFailure::Fatal(
                    CoreError::ToolBudgetExhausted { step: step.index }.to_string(),
                ));
            }
            tool_calls_left -= 1;

            debug!(step = step.index, tool = %request.name, "running tool");
            let result = match capability.run_tool(&request).await {
                Ok(result) => result,
                Err(CapabilityFailure::Transient(reason)) if transient_left > 0 => {
                    transient_left -= 1;
                    warn!(
                        step = step.index,
                        tool = %request.name,
                        retries_left = transient_left,
                        reason = %reason,
                        "tool failed transiently, retrying"
                    );
                    continue;
                }
                Err(failure) => return Err(failure),
            };

            blocks.push(ContentBlock::labeled(
                format!("Tool result: {}", request.name),
                result,
            ));
        }
    }
}

/// Map a capability failure to its step status per the failure taxonomy
fn classify_failure(step: &Step, failure: CapabilityFailure) -> StepOutcome {
    match failure {
        CapabilityFailure::ContentRisk(reason) => {
            warn!(step = step.index, reason = %reason, "step skipped for content risk");
            StepOutcome::terminal(StepStatus::Skipped, format!("content risk: {}", reason))
        }
        CapabilityFailure::RateLimited => {
            StepOutcome::terminal(StepStatus::RateLimited, "rate limited".to_string())
        }
        CapabilityFailure::Transient(reason) => StepOutcome::terminal(
            StepStatus::Failed,
            format!("transient failure persisted: {}", reason),
        ),
        CapabilityFailure::Fatal(reason) => StepOutcome::terminal(StepStatus::Failed, reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use sdk::ToolRequest;

    /// Scripted capability: yields each queued response in turn
    struct ScriptedCapability {
        responses: Mutex<Vec<sdk::capability::Result<CapabilityResponse>>>,
        tool_result: sdk::capability::Result<String>,
        generate_calls: AtomicUsize,
    }

    impl ScriptedCapability {
        fn new(responses: Vec<sdk::capability::Result<CapabilityResponse>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                tool_result: Ok("tool output".to_string()),
                generate_calls: AtomicUsize::new(0),
            }
        }

        fn with_tool_result(mut self, result: sdk::capability::Result<String>) -> Self {
            self.tool_result = result;
            self
        }
    }

    #[async_trait]
    impl StepCapability for ScriptedCapability {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(
            &self,
            _blocks: &[ContentBlock],
        ) -> sdk::capability::Result<CapabilityResponse> {
            self.generate_calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(CapabilityResponse::Final(CapabilityOutput::text("done")))
            } else {
                responses.remove(0)
            }
        }

        async fn run_tool(&self, _request: &ToolRequest) -> sdk::capability::Result<String> {
            self.tool_result.clone()
        }
    }

    fn research_step() -> Step {
        Step {
            index: 0,
            title: "gather".to_string(),
            description: "gather info".to_string(),
            kind: StepKind::Research,
            need_lookup: true,
            depends_on: vec![],
            dependency_detail: crate::plan::DependencyDetail::None,
            required_info: vec![],
            status: StepStatus::Pending,
            result: None,
            error: None,
        }
    }

    fn limits() -> DispatchLimits {
        DispatchLimits {
            max_tool_calls: 3,
            max_transient_retries: 2,
            step_timeout: Duration::from_secs(5),
        }
    }

    fn dispatcher(capability: ScriptedCapability) -> CapabilityDispatcher {
        let capability: Arc<dyn StepCapability> = Arc::new(capability);
        CapabilityDispatcher::new(Arc::clone(&capability), capability, limits())
    }

    fn tool_request() -> CapabilityResponse {
        CapabilityResponse::ToolRequest(ToolRequest::new("call_1", "search", "{}"))
    }

    #[tokio::test]
    async fn test_final_answer_is_done() {
        let capability = ScriptedCapability::new(vec![Ok(CapabilityResponse::Final(
            CapabilityOutput::text("answer").with_sources(vec!["https://a".to_string()]),
        ))]);
        let outcome = dispatcher(capability).execute(&research_step(), vec![]).await;
        assert_eq!(outcome.status, StepStatus::Done);
        assert_eq!(outcome.text.as_deref(), Some("answer"));
        assert_eq!(outcome.sources, vec!["https://a".to_string()]);
    }

    #[tokio::test]
    async fn test_tool_loop_feeds_result_back() {
        let capability = ScriptedCapability::new(vec![
            Ok(tool_request()),
            Ok(CapabilityResponse::Final(CapabilityOutput::text("combined"))),
        ]);
        let outcome = dispatcher(capability).execute(&research_step(), vec![]).await;
        assert_eq!(outcome.status, StepStatus::Done);
        assert_eq!(outcome.text.as_deref(), Some("combined"));
    }

    #[tokio::test]
    async fn test_tool_budget_exhaustion_is_failed() {
        // always requests a tool, never answers
        let capability = ScriptedCapability::new(vec![
            Ok(tool_request()),
            Ok(tool_request()),
            Ok(tool_request()),
            Ok(tool_request()),
        ]);
        let outcome = dispatcher(capability).execute(&research_step(), vec![]).await;
        assert_eq!(outcome.status, StepStatus::Failed);
        // the error carries the taxonomy's own message
        assert_eq!(
            outcome.error.as_deref(),
            Some("Tool call budget exhausted for step 0")
        );
    }

    #[tokio::test]
    async fn test_transient_retried_then_succeeds() {
        let capability = ScriptedCapability::new(vec![
            Err(CapabilityFailure::Transient("flaky".to_string())),
            Ok(CapabilityResponse::Final(CapabilityOutput::text("ok"))),
        ]);
        let outcome = dispatcher(capability).execute(&research_step(), vec![]).await;
        assert_eq!(outcome.status, StepStatus::Done);
    }

    #[tokio::test]
    async fn test_transient_exhaustion_is_failed() {
        let capability = ScriptedCapability::new(vec![
            Err(CapabilityFailure::Transient("flaky".to_string())),
            Err(CapabilityFailure::Transient("flaky".to_string())),
            Err(CapabilityFailure::Transient("flaky".to_string())),
        ]);
        let outcome = dispatcher(capability).execute(&research_step(), vec![]).await;
        assert_eq!(outcome.status, StepStatus::Failed);
        assert!(outcome.error.as_deref().unwrap_or("").contains("transient"));
    }

    #[tokio::test]
    async fn test_content_risk_is_skipped() {
        let capability = ScriptedCapability::new(vec![Err(CapabilityFailure::ContentRisk(
            "flagged".to_string(),
        ))]);
        let outcome = dispatcher(capability).execute(&research_step(), vec![]).await;
        assert_eq!(outcome.status, StepStatus::Skipped);
        assert!(outcome.error.as_deref().unwrap_or("").contains("content risk"));
    }

    #[tokio::test]
    async fn test_rate_limited_classification() {
        let capability = ScriptedCapability::new(vec![Err(CapabilityFailure::RateLimited)]);
        let outcome = dispatcher(capability).execute(&research_step(), vec![]).await;
        assert_eq!(outcome.status, StepStatus::RateLimited);
    }

    #[tokio::test]
    async fn test_fatal_tool_error_is_failed() {
        let capability = ScriptedCapability::new(vec![Ok(tool_request())])
            .with_tool_result(Err(CapabilityFailure::Fatal("tool broke".to_string())));
        let outcome = dispatcher(capability).execute(&research_step(), vec![]).await;
        assert_eq!(outcome.status, StepStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some("tool broke"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout_is_failed() {
        struct HangingCapability;

        #[async_trait]
        impl StepCapability for HangingCapability {
            fn name(&self) -> &str {
                "hanging"
            }

            async fn generate(
                &self,
                _blocks: &[ContentBlock],
            ) -> sdk::capability::Result<CapabilityResponse> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(CapabilityResponse::Final(CapabilityOutput::text("late")))
            }

            async fn run_tool(&self, _request: &ToolRequest) -> sdk::capability::Result<String> {
                Ok(String::new())
            }
        }

        let capability: Arc<dyn StepCapability> = Arc::new(HangingCapability);
        let dispatcher = CapabilityDispatcher::new(Arc::clone(&capability), capability, limits());
        let outcome = dispatcher.execute(&research_step(), vec![]).await;
        assert_eq!(outcome.status, StepStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some("Step 0 timed out"));
    }
}
