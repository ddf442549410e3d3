//! Scout Engine Library
//!
//! The plan execution core: a step state machine, a dependency-aware
//! context assembler, and a token-budget manager that together drive
//! multi-step research/analysis sessions against external LLM-backed
//! capabilities.

/// Configuration management module
pub mod config;

/// Plan and step model, validation, plan-text parsing
pub mod plan;

/// Append-only store of completed step results
pub mod observations;

/// Token counting and input budget enforcement
pub mod budget;

/// Dependency-aware context assembly
pub mod context;

/// Capability dispatch with bounded agentic loop
pub mod dispatch;

/// Session state machine
pub mod orchestrator;

/// Final report assembly
pub mod report;

/// Telemetry and Observability
pub mod telemetry;
