//! Error types and handling
//!
//! Error taxonomy for the Scout engine. Step-scoped variants are rendered
//! into the failing step's record and never abort a session; the rest are
//! the errors that end (or degrade) a run.
//!
//! All errors implement the `ScoutErrorExt` trait which provides
//! user-friendly hints and indicates whether errors are recoverable.

use thiserror::Error;

/// Trait for Scout error extensions
///
/// Provides additional context for errors: a hint safe to display to end
/// users and a recoverability flag.
pub trait ScoutErrorExt {
    /// Returns a user-friendly hint for the error
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried or worked around. Non-recoverable
    /// errors end the session.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// # Examples
///
/// ```
/// use sdk::errors::{CoreError, ScoutErrorExt};
///
/// let error = CoreError::SessionTimeout;
/// println!("Hint: {}", error.user_hint());
/// assert!(!error.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum CoreError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Planning errors
    #[error("Planning failed: {0}")]
    Planning(String),

    #[error("Plan validation failed: {0}")]
    Validation(String),

    // Budget errors
    #[error("Token budget exceeded for node {node}: {tokens} tokens > {limit} limit")]
    TokenBudgetExceeded {
        node: String,
        tokens: usize,
        limit: usize,
    },

    // Dispatch errors
    #[error("Step {step} timed out")]
    StepTimeout { step: usize },

    #[error("Tool call budget exhausted for step {step}")]
    ToolBudgetExhausted { step: usize },

    // Session lifecycle errors
    #[error("Session exceeded its wall-clock ceiling")]
    SessionTimeout,

    #[error("Session cancelled")]
    Cancelled,

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScoutErrorExt for CoreError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check the session configuration file for errors",
            Self::Planning(_) => {
                "The planning capability did not produce a usable plan; retry with a clearer task"
            }
            Self::Validation(_) => "The produced plan referenced steps incorrectly; re-planning may help",
            Self::TokenBudgetExceeded { .. } => {
                "Input was too large for the configured budget; raise the node's max_input_tokens"
            }
            Self::StepTimeout { .. } => "The step exceeded its time limit; it can be retried",
            Self::ToolBudgetExhausted { .. } => {
                "The step used up its tool-call budget; raise max_tool_calls_per_step"
            }
            Self::SessionTimeout => "The session ran too long and was aborted",
            Self::Cancelled => "The session was cancelled",
            Self::Io(_) => "Check file permissions and paths",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Planning(_) => false,
            Self::Validation(_) => true,
            Self::TokenBudgetExceeded { .. } => true,
            Self::StepTimeout { .. } => true,
            Self::ToolBudgetExhausted { .. } => true,
            Self::SessionTimeout => false,
            Self::Cancelled => false,
            Self::Io(_) => false,
        }
    }
}
