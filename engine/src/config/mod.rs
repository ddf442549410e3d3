//! Configuration management
//!
//! This module handles loading and validation of the Scout session
//! configuration. Configuration is stored in TOML format and loaded once
//! per session; every component receives its slice of it explicitly at
//! construction (no ambient global state).
//!
//! # Configuration Sections
//!
//! - **core**: Model identifier, locale, log level, background-lookup toggle
//! - **limits**: Plan/step/iteration/timeout ceilings
//! - **budget**: Per-node trimming policies and per-model hard token limits
//! - **context**: Summarization and observation-capping knobs
//!
//! Missing sections, nodes, or model entries fall back to conservative
//! built-in defaults; an absent file is not an error.

use sdk::errors::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Core session settings
    #[serde(default)]
    pub core: CoreConfig,

    /// Execution ceilings
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Token budget configuration
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Context assembly configuration
    #[serde(default)]
    pub context: ContextConfig,
}

/// Core session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Model identifier used to resolve token limits and counters
    #[serde(default = "default_model")]
    pub model: String,

    /// Default locale for sessions that do not specify one
    #[serde(default = "default_locale")]
    pub locale: String,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Run a background lookup before planning
    #[serde(default)]
    pub enable_background_lookup: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            locale: default_locale(),
            log_level: default_log_level(),
            enable_background_lookup: false,
        }
    }
}

/// Execution ceilings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of steps a plan may declare
    #[serde(default = "default_max_plan_steps")]
    pub max_plan_steps: usize,

    /// Parse/validation retries per planning call before aborting
    #[serde(default = "default_max_plan_retries")]
    pub max_plan_retries: usize,

    /// Re-planning budget for a whole session
    #[serde(default = "default_max_plan_iterations")]
    pub max_plan_iterations: usize,

    /// Maximum tool invocations per dispatched step
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls_per_step: usize,

    /// In-place retries for transient capability failures
    #[serde(default = "default_max_transient_retries")]
    pub max_transient_retries: usize,

    /// Backoff retries after a rate-limited step
    #[serde(default = "default_max_rate_limit_retries")]
    pub max_rate_limit_retries: usize,

    /// Base backoff in seconds (doubled per retry)
    #[serde(default = "default_base_backoff_secs")]
    pub base_backoff_secs: u64,

    /// Wall-clock ceiling per dispatched step, in seconds
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,

    /// Wall-clock ceiling for the whole session, in seconds
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_plan_steps: default_max_plan_steps(),
            max_plan_retries: default_max_plan_retries(),
            max_plan_iterations: default_max_plan_iterations(),
            max_tool_calls_per_step: default_max_tool_calls(),
            max_transient_retries: default_max_transient_retries(),
            max_rate_limit_retries: default_max_rate_limit_retries(),
            base_backoff_secs: default_base_backoff_secs(),
            step_timeout_secs: default_step_timeout_secs(),
            session_timeout_secs: default_session_timeout_secs(),
        }
    }
}

/// Trimming strategy for a node's input blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrimStrategy {
    /// Accumulate blocks newest-first, drop the oldest overflow
    KeepRecent,

    /// Accumulate blocks oldest-first, drop the newest overflow
    KeepEarliest,
}

/// Per-node input budget policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetPolicy {
    /// Hard cap on input tokens for this node
    #[serde(default = "default_max_input_tokens")]
    pub max_input_tokens: usize,

    /// Tokens reserved for the model's output
    #[serde(default = "default_reserve_for_output")]
    pub reserve_for_output_tokens: usize,

    /// Which end of the block list survives trimming
    #[serde(default = "default_strategy")]
    pub strategy: TrimStrategy,

    /// Whether mandatory (system/instruction) blocks are unconditionally
    /// retained; `false` demotes them to ordinary blocks
    #[serde(default = "default_true")]
    pub keep_system: bool,
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            max_input_tokens: default_max_input_tokens(),
            reserve_for_output_tokens: default_reserve_for_output(),
            strategy: default_strategy(),
            keep_system: true,
        }
    }
}

/// Token budget configuration: per-node policies plus per-model hard limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Model identifier -> hard token limit; the `default` entry backs
    /// unknown models
    #[serde(default = "default_model_limits")]
    pub model_limits: HashMap<String, usize>,

    /// Node name -> budget policy
    #[serde(default = "default_node_policies")]
    pub nodes: HashMap<String, BudgetPolicy>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            model_limits: default_model_limits(),
            nodes: default_node_policies(),
        }
    }
}

impl BudgetConfig {
    /// Hard token limit for a model, falling back to the `default` entry,
    /// then to a conservative built-in
    pub fn model_limit(&self, model_id: &str) -> usize {
        self.model_limits
            .get(model_id)
            .or_else(|| self.model_limits.get("default"))
            .copied()
            .unwrap_or(DEFAULT_MODEL_LIMIT)
    }

    /// Budget policy for a node, falling back to the built-in default
    pub fn policy(&self, node: &str) -> BudgetPolicy {
        self.nodes.get(node).cloned().unwrap_or_default()
    }
}

/// Context assembly configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Character budget per summarized dependency entry
    #[serde(default = "default_summary_char_budget")]
    pub summary_char_budget: usize,

    /// Observation-list cap handed to `cap_observations` for planner input
    #[serde(default = "default_max_observations")]
    pub max_observations: usize,

    /// Excerpt length per entry in the synthetic earlier-findings summary
    #[serde(default = "default_excerpt_chars")]
    pub excerpt_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            summary_char_budget: default_summary_char_budget(),
            max_observations: default_max_observations(),
            excerpt_chars: default_excerpt_chars(),
        }
    }
}

/// Built-in conservative model limit when no config entry exists
pub const DEFAULT_MODEL_LIMIT: usize = 4096;

fn default_model() -> String {
    "deepseek-chat".to_string()
}

fn default_locale() -> String {
    "en-US".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_plan_steps() -> usize {
    8
}

fn default_max_plan_retries() -> usize {
    2
}

fn default_max_plan_iterations() -> usize {
    3
}

fn default_max_tool_calls() -> usize {
    10
}

fn default_max_transient_retries() -> usize {
    2
}

fn default_max_rate_limit_retries() -> usize {
    2
}

fn default_base_backoff_secs() -> u64 {
    1
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_session_timeout_secs() -> u64 {
    3600
}

fn default_max_input_tokens() -> usize {
    8000
}

fn default_reserve_for_output() -> usize {
    1000
}

fn default_strategy() -> TrimStrategy {
    TrimStrategy::KeepRecent
}

fn default_true() -> bool {
    true
}

fn default_summary_char_budget() -> usize {
    500
}

fn default_max_observations() -> usize {
    8
}

fn default_excerpt_chars() -> usize {
    200
}

fn default_model_limits() -> HashMap<String, usize> {
    let mut limits = HashMap::new();
    limits.insert("deepseek-chat".to_string(), 32_768);
    limits.insert("gemini-2.0-flash".to_string(), 1_000_000);
    limits.insert("default".to_string(), DEFAULT_MODEL_LIMIT);
    limits
}

fn default_node_policies() -> HashMap<String, BudgetPolicy> {
    let mut nodes = HashMap::new();
    nodes.insert(
        "planner".to_string(),
        BudgetPolicy {
            max_input_tokens: 25_000,
            reserve_for_output_tokens: 2_000,
            strategy: TrimStrategy::KeepRecent,
            keep_system: true,
        },
    );
    nodes.insert(
        "reporter".to_string(),
        BudgetPolicy {
            max_input_tokens: 30_000,
            reserve_for_output_tokens: 4_000,
            strategy: TrimStrategy::KeepRecent,
            keep_system: true,
        },
    );
    nodes.insert(
        "researcher".to_string(),
        BudgetPolicy {
            max_input_tokens: 20_000,
            reserve_for_output_tokens: 2_000,
            strategy: TrimStrategy::KeepRecent,
            keep_system: true,
        },
    );
    nodes.insert(
        "processor".to_string(),
        BudgetPolicy {
            max_input_tokens: 20_000,
            reserve_for_output_tokens: 2_000,
            strategy: TrimStrategy::KeepRecent,
            keep_system: true,
        },
    );
    nodes.insert(
        "background_lookup".to_string(),
        BudgetPolicy {
            max_input_tokens: 2_000,
            reserve_for_output_tokens: 0,
            strategy: TrimStrategy::KeepEarliest,
            keep_system: true,
        },
    );
    nodes
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_path(path: &Path) -> Result<Self, CoreError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| CoreError::Config(format!("failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, or fall back to built-in
    /// defaults when the file is absent or unreadable
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load_from_path(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Using default configuration: {}", e);
                Self::default()
            }
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.limits.max_plan_steps == 0 {
            return Err(CoreError::Config(
                "limits.max_plan_steps must be at least 1".to_string(),
            ));
        }
        if self.limits.step_timeout_secs == 0 || self.limits.session_timeout_secs == 0 {
            return Err(CoreError::Config(
                "timeouts must be non-zero".to_string(),
            ));
        }
        match self.core.log_level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => Ok(()),
            other => Err(CoreError::Config(format!("invalid log_level: {}", other))),
        }
    }
}
