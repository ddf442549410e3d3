//! Scout SDK
//!
//! Shared library providing the traits and types that external capability
//! implementations (research, processing, planning) must satisfy to plug
//! into the Scout engine. The engine only ever talks to capabilities
//! through these contracts.

/// Error types and handling
pub mod errors;

/// Capability traits and failure kinds
pub mod capability;

/// Content-block and capability payload types
pub mod types;

// Re-export commonly used types
pub use capability::{
    CapabilityFailure, CapabilityResponse, PlanningCapability, StepCapability,
};
pub use errors::{CoreError, ScoutErrorExt};
pub use types::{CapabilityOutput, ContentBlock, ToolRequest};
