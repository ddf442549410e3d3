//! Token budget enforcement.
//!
//! Every block list headed for an external capability goes through
//! [`BudgetManager::fit`] for its owning node. Mandatory blocks survive any
//! strategy; trimming them at all is the degraded last resort and is always
//! reported in the returned stats rather than absorbed silently.

pub mod counter;

use tracing::{info, warn};

use sdk::ContentBlock;

use crate::config::{BudgetConfig, TrimStrategy};
use crate::observations::Observation;

pub use counter::{count_block, ApproxCounter, CounterRegistry, TokenCount, BLOCK_OVERHEAD_TOKENS};

/// Why a fitted block list counts more tokens than its raw text would
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpansionBreakdown {
    /// Blocks beyond the single unit a naive concatenation would be
    pub block_delta: usize,

    /// Characters added by labels relative to the raw text
    pub char_delta: usize,

    /// Tokens attributable to structure rather than content
    pub structural_tokens: usize,
}

/// Outcome of a fit pass
#[derive(Debug, Clone)]
pub struct FitStats {
    pub original_blocks: usize,
    pub original_tokens: usize,
    pub final_blocks: usize,
    pub final_tokens: usize,
    pub reduction_pct: f64,

    /// Mandatory content was truncated to make the target
    pub degraded: bool,

    /// Even the emergency pass could not get under the model limit
    pub budget_exceeded: bool,

    /// Present when structure inflated the count past the raw text
    pub expansion: Option<ExpansionBreakdown>,
}

/// Enforces per-node budget policies over content block lists
#[derive(Debug, Clone)]
pub struct BudgetManager {
    config: BudgetConfig,
    counters: CounterRegistry,
}

impl BudgetManager {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            counters: CounterRegistry::new(),
        }
    }

    pub fn with_counters(config: BudgetConfig, counters: CounterRegistry) -> Self {
        Self { config, counters }
    }

    /// Trim `blocks` to the node's budget for `model`.
    ///
    /// Mandatory blocks are always kept (truncated only as a last resort);
    /// the node's strategy decides which ordinary blocks survive. When the
    /// policy sets `keep_system = false`, mandatory blocks lose their
    /// protection and compete like any other block.
    pub fn fit(
        &self,
        blocks: &[ContentBlock],
        model: &str,
        node: &str,
    ) -> (Vec<ContentBlock>, FitStats) {
        let policy = self.config.policy(node);
        let model_limit = self.config.model_limit(model);
        let target = policy
            .max_input_tokens
            .min(model_limit)
            .saturating_sub(policy.reserve_for_output_tokens);
        let counter = self.counters.for_model(model);

        let mut working: Vec<ContentBlock> = blocks.to_vec();
        if !policy.keep_system {
            for block in &mut working {
                block.mandatory = false;
            }
        }

        let original_blocks = working.len();
        let original_tokens: usize = working.iter().map(|b| count_block(&*counter, b)).sum();
        let expansion = analyze_expansion(&working, original_tokens, &*counter);

        let mut degraded = false;
        let mut budget_exceeded = false;

        let mandatory_tokens: usize = working
            .iter()
            .filter(|b| b.mandatory)
            .map(|b| count_block(&*counter, b))
            .sum();

        let mut fitted: Vec<ContentBlock> = if mandatory_tokens > target {
            // Even the protected content overflows. Drop everything else and
            // cut each mandatory block to its token share of the target, so
            // label and per-block overhead are charged against the share.
            degraded = true;
            working
                .iter()
                .filter(|b| b.mandatory)
                .map(|b| {
                    let share = target * count_block(&*counter, b) / mandatory_tokens;
                    truncate_block_to_fit(b, share, &*counter)
                })
                .collect()
        } else {
            let budget_for_ordinary = target - mandatory_tokens;
            let keep = select_ordinary(&working, budget_for_ordinary, policy.strategy, &*counter);
            working
                .iter()
                .enumerate()
                .filter(|(i, b)| b.mandatory || keep.contains(i))
                .map(|(_, b)| b.clone())
                .collect()
        };

        let mut final_tokens: usize = fitted.iter().map(|b| count_block(&*counter, b)).sum();

        // Residual check: the structural floor (labels plus per-block
        // overhead, which survive even empty-text truncation) can still sit
        // above the model limit. Callers must not dispatch on this flag.
        if final_tokens > model_limit {
            budget_exceeded = true;
            fitted.retain(|b| b.mandatory);
            final_tokens = fitted.iter().map(|b| count_block(&*counter, b)).sum();
            warn!(
                node,
                model,
                final_tokens,
                model_limit,
                "token budget exceeded after trim, emergency pass applied"
            );
        }

        let reduction_pct = if original_tokens > 0 {
            100.0 * (original_tokens.saturating_sub(final_tokens)) as f64 / original_tokens as f64
        } else {
            0.0
        };

        let status = if final_tokens < original_tokens || degraded {
            "TRIMMED"
        } else if expansion.is_some() {
            "EXPANDED"
        } else {
            "NO_TRIM"
        };
        info!(
            node,
            model,
            status,
            original_blocks,
            original_tokens,
            final_blocks = fitted.len(),
            final_tokens,
            target,
            "budget fit"
        );

        let stats = FitStats {
            original_blocks,
            original_tokens,
            final_blocks: fitted.len(),
            final_tokens,
            reduction_pct,
            degraded,
            budget_exceeded,
            expansion,
        };

        (fitted, stats)
    }

    /// Clamp raw text to a node's token target. Used for sources that bypass
    /// block assembly, like the background lookup result.
    pub fn clamp_text(&self, text: &str, model: &str, node: &str) -> String {
        let policy = self.config.policy(node);
        let model_limit = self.config.model_limit(model);
        let target = policy
            .max_input_tokens
            .min(model_limit)
            .saturating_sub(policy.reserve_for_output_tokens);
        let counter = self.counters.for_model(model);
        truncate_to_fit(text, target, &*counter)
    }

    /// Cap an observation list at `max_count` entries.
    ///
    /// Within bounds the list passes through unchanged. Over bounds, the
    /// most recent `max_count - 1` entries survive verbatim and the dropped
    /// prefix collapses into one synthetic summary entry carrying bounded
    /// excerpts, placed first so order is preserved.
    pub fn cap_observations(
        &self,
        observations: &[Observation],
        max_count: usize,
        excerpt_chars: usize,
    ) -> Vec<Observation> {
        if max_count == 0 || observations.len() <= max_count {
            return observations.to_vec();
        }

        let split = observations.len() - (max_count - 1);
        let (dropped, kept) = observations.split_at(split);

        let excerpts: Vec<String> = dropped
            .iter()
            .map(|o| {
                format!(
                    "- {}: {}",
                    o.title,
                    truncate_chars(o.content.trim(), excerpt_chars)
                )
            })
            .collect();

        info!(
            dropped = dropped.len(),
            kept = kept.len(),
            "observation list capped"
        );

        let mut capped = Vec::with_capacity(max_count);
        capped.push(Observation::new(
            dropped[0].step_index,
            "Earlier findings (summary)",
            excerpts.join("\n"),
        ));
        capped.extend(kept.iter().cloned());
        capped
    }
}

/// Indices of ordinary blocks kept by the trim strategy
fn select_ordinary(
    blocks: &[ContentBlock],
    budget: usize,
    strategy: TrimStrategy,
    counter: &dyn TokenCount,
) -> std::collections::HashSet<usize> {
    let ordinary: Vec<usize> = blocks
        .iter()
        .enumerate()
        .filter(|(_, b)| !b.mandatory)
        .map(|(i, _)| i)
        .collect();

    let order: Vec<usize> = match strategy {
        TrimStrategy::KeepRecent => ordinary.iter().rev().copied().collect(),
        TrimStrategy::KeepEarliest => ordinary,
    };

    let mut keep = std::collections::HashSet::new();
    let mut used = 0usize;
    for i in order {
        let cost = count_block(counter, &blocks[i]);
        if used + cost > budget {
            // Greedy cutoff: once a block no longer fits, everything behind
            // it in preference order is dropped too.
            break;
        }
        used += cost;
        keep.insert(i);
    }
    keep
}

fn analyze_expansion(
    blocks: &[ContentBlock],
    counted_tokens: usize,
    counter: &dyn TokenCount,
) -> Option<ExpansionBreakdown> {
    let naive: String = blocks.iter().map(|b| b.text.as_str()).collect();
    let naive_tokens = counter.count(&naive);
    if counted_tokens <= naive_tokens {
        return None;
    }

    let raw_chars: usize = blocks.iter().map(|b| b.text.chars().count()).sum();
    let rendered_chars: usize = blocks.iter().map(|b| b.rendered().chars().count()).sum();

    Some(ExpansionBreakdown {
        block_delta: blocks.len().saturating_sub(1),
        char_delta: rendered_chars.saturating_sub(raw_chars),
        structural_tokens: counted_tokens - naive_tokens,
    })
}

/// Cut `text` to at most `max_chars` characters on a char boundary
fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

/// Cut a block's text until its full counted cost, label and per-block
/// overhead included, sits at or under `max_tokens`. The text can bottom
/// out empty while the structure still costs tokens; the caller accounts
/// for that floor.
fn truncate_block_to_fit(
    block: &ContentBlock,
    max_tokens: usize,
    counter: &dyn TokenCount,
) -> ContentBlock {
    let mut cut = block.clone();
    if count_block(counter, &cut) <= max_tokens {
        return cut;
    }

    let total = counter.count(&block.text).max(1);
    let mut keep = block.text.chars().count() * max_tokens / total;
    loop {
        cut.text = block.text.chars().take(keep).collect();
        if count_block(counter, &cut) <= max_tokens || keep == 0 {
            return cut;
        }
        keep = keep.saturating_sub(1.max(keep / 20));
    }
}

/// Cut `text` until `counter` reports at most `max_tokens`
fn truncate_to_fit(text: &str, max_tokens: usize, counter: &dyn TokenCount) -> String {
    if counter.count(text) <= max_tokens {
        return text.to_string();
    }
    if max_tokens == 0 {
        return String::new();
    }

    // Start from a proportional guess and walk down until the count fits.
    let total = counter.count(text);
    let chars = text.chars().count();
    let mut keep = chars * max_tokens / total;
    loop {
        let candidate: String = text.chars().take(keep).collect();
        if counter.count(&candidate) <= max_tokens || keep == 0 {
            return candidate;
        }
        keep = keep.saturating_sub(1.max(keep / 20));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BudgetPolicy, DEFAULT_MODEL_LIMIT};

    fn manager_with_policy(node: &str, policy: BudgetPolicy) -> BudgetManager {
        let mut config = BudgetConfig::default();
        config.nodes.insert(node.to_string(), policy);
        BudgetManager::new(config)
    }

    fn text_of(tokens: usize) -> String {
        // 4 chars/token approximation, minus overhead charged per block
        "x".repeat(tokens.saturating_sub(BLOCK_OVERHEAD_TOKENS) * 4)
    }

    #[test]
    fn test_no_trim_when_under_budget() {
        let manager = manager_with_policy(
            "researcher",
            BudgetPolicy {
                max_input_tokens: 1000,
                reserve_for_output_tokens: 100,
                ..Default::default()
            },
        );
        let blocks = vec![
            ContentBlock::labeled("system", "instructions").into_mandatory(),
            ContentBlock::new("a short finding"),
        ];
        let (fitted, stats) = manager.fit(&blocks, "deepseek-chat", "researcher");
        assert_eq!(fitted.len(), 2);
        assert!(!stats.degraded);
        assert!(!stats.budget_exceeded);
        assert_eq!(stats.original_tokens, stats.final_tokens);
    }

    #[test]
    fn test_keep_recent_drops_oldest() {
        let manager = manager_with_policy(
            "researcher",
            BudgetPolicy {
                max_input_tokens: 130,
                reserve_for_output_tokens: 0,
                strategy: TrimStrategy::KeepRecent,
                ..Default::default()
            },
        );
        let blocks = vec![
            ContentBlock::new(text_of(60)),
            ContentBlock::new(text_of(60)),
            ContentBlock::new(text_of(60)),
        ];
        let (fitted, stats) = manager.fit(&blocks, "deepseek-chat", "researcher");
        // 130-token target fits two 60-token blocks, newest first
        assert_eq!(fitted.len(), 2);
        assert_eq!(fitted[0].text, blocks[1].text);
        assert_eq!(fitted[1].text, blocks[2].text);
        assert!(stats.final_tokens <= 130);
    }

    #[test]
    fn test_keep_earliest_drops_newest() {
        let manager = manager_with_policy(
            "background_lookup",
            BudgetPolicy {
                max_input_tokens: 130,
                reserve_for_output_tokens: 0,
                strategy: TrimStrategy::KeepEarliest,
                ..Default::default()
            },
        );
        let blocks = vec![
            ContentBlock::new(text_of(60)),
            ContentBlock::new(text_of(60)),
            ContentBlock::new(text_of(60)),
        ];
        let (fitted, _) = manager.fit(&blocks, "deepseek-chat", "background_lookup");
        assert_eq!(fitted.len(), 2);
        assert_eq!(fitted[0].text, blocks[0].text);
        assert_eq!(fitted[1].text, blocks[1].text);
    }

    #[test]
    fn test_mandatory_survives_strategy() {
        let manager = manager_with_policy(
            "reporter",
            BudgetPolicy {
                max_input_tokens: 100,
                reserve_for_output_tokens: 0,
                strategy: TrimStrategy::KeepRecent,
                ..Default::default()
            },
        );
        let blocks = vec![
            ContentBlock::labeled("system", text_of(40)).into_mandatory(),
            ContentBlock::new(text_of(500)),
            ContentBlock::new(text_of(50)),
        ];
        let (fitted, stats) = manager.fit(&blocks, "deepseek-chat", "reporter");
        assert!(fitted.iter().any(|b| b.mandatory));
        // the 500-token block cannot fit next to the mandatory block
        assert_eq!(fitted.len(), 2);
        assert!(!stats.degraded);
    }

    #[test]
    fn test_oversized_non_mandatory_dropped_entirely() {
        // A 100-token ceiling with a 500-token ordinary block: the block is
        // dropped, not truncated, and the mandatory block survives.
        let manager = manager_with_policy(
            "reporter",
            BudgetPolicy {
                max_input_tokens: 100,
                reserve_for_output_tokens: 0,
                ..Default::default()
            },
        );
        let blocks = vec![
            ContentBlock::labeled("system", text_of(20)).into_mandatory(),
            ContentBlock::new(text_of(500)),
        ];
        let (fitted, stats) = manager.fit(&blocks, "deepseek-chat", "reporter");
        assert_eq!(fitted.len(), 1);
        assert!(fitted[0].mandatory);
        assert!(stats.final_tokens <= 100);
        assert!(!stats.degraded);
    }

    #[test]
    fn test_single_oversized_block_trims_to_empty() {
        let manager = manager_with_policy(
            "reporter",
            BudgetPolicy {
                max_input_tokens: 100,
                reserve_for_output_tokens: 0,
                ..Default::default()
            },
        );
        let blocks = vec![ContentBlock::new(text_of(500))];
        let (fitted, stats) = manager.fit(&blocks, "deepseek-chat", "reporter");
        assert!(fitted.is_empty());
        assert_eq!(stats.final_tokens, 0);
        assert!(!stats.degraded);
        assert!(!stats.budget_exceeded);
    }

    #[test]
    fn test_mandatory_alone_over_target_truncated() {
        let manager = manager_with_policy(
            "planner",
            BudgetPolicy {
                max_input_tokens: 50,
                reserve_for_output_tokens: 0,
                ..Default::default()
            },
        );
        let blocks = vec![ContentBlock::labeled("system", text_of(200)).into_mandatory()];
        let (fitted, stats) = manager.fit(&blocks, "deepseek-chat", "planner");
        assert_eq!(fitted.len(), 1);
        assert!(stats.degraded);
        assert!(stats.final_tokens <= 50);
        assert!(fitted[0].text.chars().count() < 200 * 4);
    }

    #[test]
    fn test_degraded_fit_stays_under_model_limit() {
        // the model limit, not the policy, is the binding constraint here;
        // the cut must charge the per-block overhead against it
        let mut config = BudgetConfig::default();
        config.model_limits.insert("tiny-model".to_string(), 100);
        config.nodes.insert(
            "planner".to_string(),
            BudgetPolicy {
                max_input_tokens: 8_000,
                reserve_for_output_tokens: 0,
                ..Default::default()
            },
        );
        let manager = BudgetManager::new(config);
        let blocks = vec![ContentBlock::new("x".repeat(2000)).into_mandatory()];
        let (fitted, stats) = manager.fit(&blocks, "tiny-model", "planner");
        assert_eq!(fitted.len(), 1);
        assert!(stats.degraded);
        assert!(stats.final_tokens <= 100);
        assert!(!stats.budget_exceeded);
    }

    #[test]
    fn test_degraded_fit_charges_labels_to_target() {
        let manager = manager_with_policy(
            "planner",
            BudgetPolicy {
                max_input_tokens: 60,
                reserve_for_output_tokens: 0,
                ..Default::default()
            },
        );
        let blocks = vec![
            ContentBlock::labeled("system", text_of(100)).into_mandatory(),
            ContentBlock::labeled("instructions", text_of(100)).into_mandatory(),
        ];
        let (fitted, stats) = manager.fit(&blocks, "deepseek-chat", "planner");
        assert_eq!(fitted.len(), 2);
        assert!(stats.degraded);
        assert!(stats.final_tokens <= 60);
    }

    #[test]
    fn test_budget_exceeded_when_structure_alone_overflows() {
        // even an empty-text mandatory block costs its label plus overhead,
        // which a 6-token limit cannot absorb
        let mut config = BudgetConfig::default();
        config.model_limits.insert("tiny-model".to_string(), 6);
        config.nodes.insert(
            "planner".to_string(),
            BudgetPolicy {
                max_input_tokens: 8_000,
                reserve_for_output_tokens: 0,
                ..Default::default()
            },
        );
        let manager = BudgetManager::new(config);
        let blocks =
            vec![ContentBlock::labeled("a label too long to ever fit", text_of(100)).into_mandatory()];
        let (fitted, stats) = manager.fit(&blocks, "tiny-model", "planner");
        assert!(stats.budget_exceeded);
        assert!(stats.degraded);
        assert!(!fitted.is_empty());
    }

    #[test]
    fn test_keep_system_false_demotes_mandatory() {
        let manager = manager_with_policy(
            "researcher",
            BudgetPolicy {
                max_input_tokens: 70,
                reserve_for_output_tokens: 0,
                strategy: TrimStrategy::KeepRecent,
                keep_system: false,
                ..Default::default()
            },
        );
        let blocks = vec![
            ContentBlock::labeled("system", text_of(60)).into_mandatory(),
            ContentBlock::new(text_of(60)),
        ];
        let (fitted, stats) = manager.fit(&blocks, "deepseek-chat", "researcher");
        // with protection off, KeepRecent prefers the newer ordinary block
        assert_eq!(fitted.len(), 1);
        assert!(!fitted[0].mandatory);
        assert!(!stats.degraded);
    }

    #[test]
    fn test_unknown_node_uses_default_policy() {
        let manager = BudgetManager::new(BudgetConfig::default());
        let blocks = vec![ContentBlock::new("hello world")];
        let (fitted, _) = manager.fit(&blocks, "deepseek-chat", "no-such-node");
        assert_eq!(fitted.len(), 1);
    }

    #[test]
    fn test_model_limit_caps_target() {
        // policy allows 1M tokens but the unlisted model's limit is 4096
        let mut config = BudgetConfig::default();
        config.model_limits.clear();
        config.nodes.insert(
            "researcher".to_string(),
            BudgetPolicy {
                max_input_tokens: 1_000_000,
                reserve_for_output_tokens: 0,
                ..Default::default()
            },
        );
        let manager = BudgetManager::new(config);
        let blocks = vec![ContentBlock::new(text_of(10_000))];
        let (_, stats) = manager.fit(&blocks, "tiny-model", "researcher");
        assert!(stats.final_tokens <= DEFAULT_MODEL_LIMIT);
    }

    #[test]
    fn test_expansion_reported() {
        let manager = manager_with_policy(
            "researcher",
            BudgetPolicy {
                max_input_tokens: 10_000,
                reserve_for_output_tokens: 0,
                ..Default::default()
            },
        );
        let blocks = vec![
            ContentBlock::labeled("Step 0 result", "tiny"),
            ContentBlock::labeled("Step 1 result", "tiny"),
        ];
        let (_, stats) = manager.fit(&blocks, "deepseek-chat", "researcher");
        let expansion = stats.expansion.expect("structure should expand tiny blocks");
        assert_eq!(expansion.block_delta, 1);
        assert!(expansion.char_delta > 0);
        assert!(expansion.structural_tokens > 0);
    }

    #[test]
    fn test_cap_observations_within_bounds_untouched() {
        let manager = BudgetManager::new(BudgetConfig::default());
        let obs: Vec<Observation> = (0..3)
            .map(|i| Observation::new(i, format!("step {}", i), "content"))
            .collect();
        let capped = manager.cap_observations(&obs, 8, 200);
        assert_eq!(capped.len(), 3);
        assert_eq!(capped[0].step_index, 0);
    }

    #[test]
    fn test_cap_observations_collapses_prefix() {
        let manager = BudgetManager::new(BudgetConfig::default());
        let obs: Vec<Observation> = (0..6)
            .map(|i| Observation::new(i, format!("step {}", i), "y".repeat(300)))
            .collect();
        let capped = manager.cap_observations(&obs, 4, 200);
        assert_eq!(capped.len(), 4);
        assert_eq!(capped[0].title, "Earlier findings (summary)");
        // synthetic entry carries the first dropped step's index
        assert_eq!(capped[0].step_index, 0);
        // excerpts bounded, three dropped entries summarized
        assert_eq!(capped[0].content.lines().count(), 3);
        for line in capped[0].content.lines() {
            assert!(line.chars().count() <= 200 + "- step 0: ".len());
        }
        assert_eq!(capped[1].step_index, 3);
        assert_eq!(capped[3].step_index, 5);
    }

    #[test]
    fn test_clamp_text_bounds_tokens() {
        let manager = BudgetManager::new(BudgetConfig::default());
        let long = "z".repeat(100_000);
        // default background_lookup policy is 2000 tokens with no reserve
        let clamped = manager.clamp_text(&long, "deepseek-chat", "background_lookup");
        let counter = ApproxCounter::for_model("deepseek-chat");
        assert!(counter.count(&clamped) <= 2000);
        assert!(!clamped.is_empty());
    }
}
