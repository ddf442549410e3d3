//! Deterministic condensation of step results.
//!
//! Summarization is pluggable; the default is extractive so repeated runs
//! over the same observations produce identical context. A model-assisted
//! summarizer can be swapped in through the trait without touching the
//! assembler.

/// Condenses text to a character budget
pub trait Summarize: Send + Sync {
    fn summarize(&self, text: &str, char_budget: usize) -> String;
}

/// Extractive summarizer preferring structured lines.
///
/// Headings, bullets, and numbered lines carry the most information density
/// in research output, so they are taken first. When the text has no
/// structure at all, the leading prose is truncated instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractiveSummarizer;

impl ExtractiveSummarizer {
    fn is_structured(line: &str) -> bool {
        let trimmed = line.trim_start();
        trimmed.starts_with('#')
            || trimmed.starts_with("- ")
            || trimmed.starts_with("* ")
            || trimmed
                .split_once('.')
                .map(|(head, _)| !head.is_empty() && head.chars().all(|c| c.is_ascii_digit()))
                .unwrap_or(false)
    }
}

impl Summarize for ExtractiveSummarizer {
    fn summarize(&self, text: &str, char_budget: usize) -> String {
        let trimmed = text.trim();
        if trimmed.chars().count() <= char_budget {
            return trimmed.to_string();
        }

        let mut out = String::new();
        let mut used = 0usize;
        for line in trimmed.lines().filter(|l| Self::is_structured(l)) {
            let line = line.trim();
            let cost = line.chars().count() + 1;
            if used + cost > char_budget {
                break;
            }
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(line);
            used += cost;
        }

        if out.is_empty() {
            out = trimmed.chars().take(char_budget.saturating_sub(3)).collect();
            out.push_str("...");
        }
        out
    }
}

/// Matches a key's extracted lines, or records that nothing matched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPoints {
    pub key: String,
    pub lines: Vec<String>,
    pub found: bool,
}

const MAX_MATCHES_PER_KEY: usize = 3;

/// Scan `content` for lines relevant to each requested information key.
///
/// A key like `market_size` is split on underscores and a line matches when
/// it contains any term case-insensitively, capped at three matches per key.
/// Keys with no matching line still produce an entry so the gap is visible
/// downstream instead of silently absent.
pub fn extract_key_points(content: &str, keys: &[String]) -> Vec<KeyPoints> {
    keys.iter()
        .map(|key| {
            let terms: Vec<String> = key
                .split('_')
                .filter(|t| !t.is_empty())
                .map(|t| t.to_lowercase())
                .collect();

            let lines: Vec<String> = content
                .lines()
                .filter(|line| {
                    let lower = line.to_lowercase();
                    !line.trim().is_empty() && terms.iter().any(|t| lower.contains(t.as_str()))
                })
                .take(MAX_MATCHES_PER_KEY)
                .map(|l| l.trim().to_string())
                .collect();

            let found = !lines.is_empty();
            let lines = if found {
                lines
            } else {
                vec![format!("no data found for {}", key)]
            };

            KeyPoints {
                key: key.clone(),
                lines,
                found,
            }
        })
        .collect()
}
