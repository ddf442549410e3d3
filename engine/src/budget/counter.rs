//! Token counting.
//!
//! Counts are approximations calibrated per model family unless an exact
//! counter has been registered. Approximation must round up: an undercount
//! here becomes a hard request rejection downstream.

use std::sync::Arc;

use sdk::ContentBlock;

/// Structural tokens charged per block for role/label wrapping on the wire
pub const BLOCK_OVERHEAD_TOKENS: usize = 5;

/// Counts tokens for a given model's tokenizer
pub trait TokenCount: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Count a block including its label and structural overhead
pub fn count_block(counter: &dyn TokenCount, block: &ContentBlock) -> usize {
    counter.count(&block.rendered()) + BLOCK_OVERHEAD_TOKENS
}

/// Character-ratio approximation of token counts.
///
/// Ratios are calibrated per model family; unknown families get the
/// conservative default of 4.0 chars per token.
#[derive(Debug, Clone)]
pub struct ApproxCounter {
    chars_per_token: f64,
}

/// Family substring to chars-per-token ratio
const FAMILY_RATIOS: &[(&str, f64)] = &[
    ("gemini", 3.5),
    ("deepseek", 4.0),
    ("claude", 3.8),
    ("qwen", 4.2),
    ("llama", 4.0),
];

const DEFAULT_CHARS_PER_TOKEN: f64 = 4.0;

impl ApproxCounter {
    pub fn new(chars_per_token: f64) -> Self {
        Self { chars_per_token }
    }

    /// Pick the ratio for a model id by family substring match
    pub fn for_model(model: &str) -> Self {
        let lower = model.to_lowercase();
        let ratio = FAMILY_RATIOS
            .iter()
            .find(|(family, _)| lower.contains(family))
            .map(|(_, ratio)| *ratio)
            .unwrap_or(DEFAULT_CHARS_PER_TOKEN);
        Self::new(ratio)
    }
}

impl TokenCount for ApproxCounter {
    fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        // Round up so the approximation never undercounts
        (text.chars().count() as f64 / self.chars_per_token).ceil() as usize
    }
}

/// Registry of exact counters keyed by model family substring.
///
/// `for_model` prefers a registered exact counter and falls back to the
/// family-calibrated approximation.
#[derive(Clone, Default)]
pub struct CounterRegistry {
    exact: Vec<(String, Arc<dyn TokenCount>)>,
}

impl CounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, family: impl Into<String>, counter: Arc<dyn TokenCount>) {
        self.exact.push((family.into().to_lowercase(), counter));
    }

    pub fn for_model(&self, model: &str) -> Arc<dyn TokenCount> {
        let lower = model.to_lowercase();
        for (family, counter) in &self.exact {
            if lower.contains(family.as_str()) {
                return Arc::clone(counter);
            }
        }
        Arc::new(ApproxCounter::for_model(model))
    }
}

impl std::fmt::Debug for CounterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let families: Vec<&str> = self.exact.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("CounterRegistry")
            .field("exact_families", &families)
            .finish()
    }
}
