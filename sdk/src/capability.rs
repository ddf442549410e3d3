//! Capability contracts
//!
//! External executors plug into the engine through these traits. The engine
//! never sees tool implementations or model transports; it hands a
//! capability an ordered list of content blocks and receives either a tool
//! request (which it routes back through `run_tool`, under its own
//! iteration cap) or a final output. Failures are pre-classified into the
//! four kinds the orchestrator knows how to handle.

use crate::types::{CapabilityOutput, ContentBlock, ToolRequest};
use async_trait::async_trait;

/// Result type for capability operations
pub type Result<T> = std::result::Result<T, CapabilityFailure>;

/// Failure kinds a capability may report
///
/// The dispatcher maps these onto step statuses: content risk skips the
/// step, rate limiting triggers orchestrator backoff, transient failures
/// are retried in place, fatal failures fail the step immediately.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CapabilityFailure {
    #[error("content risk: {0}")]
    ContentRisk(String),

    #[error("rate limited")]
    RateLimited,

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("fatal failure: {0}")]
    Fatal(String),
}

/// Response from a step capability invocation
#[derive(Debug, Clone)]
pub enum CapabilityResponse {
    /// The capability needs a tool result before it can continue
    ToolRequest(ToolRequest),

    /// The capability has produced the step's final output
    Final(CapabilityOutput),
}

/// Planning capability: turns a task description (plus optional background
/// context and prior findings) into raw plan text.
///
/// The output is the model's raw text; extracting and validating the plan
/// JSON is the engine's job, so malformed output surfaces as a
/// `PlanningError` there rather than a capability failure here.
#[async_trait]
pub trait PlanningCapability: Send + Sync {
    /// Returns the name of the capability (used in logs)
    fn name(&self) -> &str;

    /// Produce raw plan text from the assembled input blocks
    async fn plan(&self, blocks: &[ContentBlock]) -> Result<String>;
}

/// Step capability: executes one research or processing step.
///
/// Invoked iteratively: `generate` may return a tool request, whose result
/// the engine feeds back as an additional content block before invoking
/// `generate` again. The engine bounds the number of round trips.
#[async_trait]
pub trait StepCapability: Send + Sync {
    /// Returns the name of the capability (used in logs)
    fn name(&self) -> &str;

    /// Advance the step given the input blocks accumulated so far
    async fn generate(&self, blocks: &[ContentBlock]) -> Result<CapabilityResponse>;

    /// Execute a tool request issued by `generate`
    async fn run_tool(&self, request: &ToolRequest) -> Result<String>;
}
