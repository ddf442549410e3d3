//! Plan extraction from planner capability output.
//!
//! Planners are prompted to emit a single JSON object but routinely wrap it
//! in markdown fences or surround it with prose. Parsing tries, in order:
//! 1. Raw JSON (entire trimmed content)
//! 2. The body of the first markdown code fence
//! 3. A balanced `{...}` object scanned from the first `{` in the text

use sdk::CoreError;

use super::{Plan, StepKind};

/// Parse a plan from raw planner output.
///
/// Assigns sequential step indices, fills a fresh plan id when the planner
/// omitted one, and defaults the locale. Research steps that omit the lookup
/// flag get it set from their kind rather than failing validation later.
pub fn plan_from_text(content: &str, default_locale: &str) -> Result<Plan, CoreError> {
    let trimmed = content.trim();

    let mut plan = parse_candidate(trimmed)
        .or_else(|| extract_fenced(trimmed).and_then(|inner| parse_candidate(inner.trim())))
        .or_else(|| {
            trimmed.find('{').and_then(|pos| {
                extract_balanced(&trimmed[pos..]).and_then(parse_candidate)
            })
        })
        .ok_or_else(|| {
            CoreError::Planning(format!(
                "no parseable plan object in planner output ({} chars)",
                trimmed.len()
            ))
        })?;

    if plan.id.is_empty() {
        plan.id = format!("plan_{}", uuid::Uuid::new_v4());
    }
    if plan.locale.is_empty() {
        plan.locale = default_locale.to_string();
    }

    for (i, step) in plan.steps.iter_mut().enumerate() {
        step.index = i;
        // Planners frequently omit the flag; derive it so a merely sloppy
        // plan is not rejected for a field we can infer.
        if step.kind == StepKind::Research && !step.need_lookup {
            step.need_lookup = true;
        }
    }

    Ok(plan)
}

fn parse_candidate(s: &str) -> Option<Plan> {
    serde_json::from_str::<Plan>(s).ok()
}

/// Extract the body of the first markdown code fence in the text.
///
/// Works even when there is trailing prose after the closing ```.
fn extract_fenced(content: &str) -> Option<&str> {
    let fence_start = content.find("```")?;
    let after_opening = &content[fence_start + 3..];

    // Skip the language tag line (e.g. "json\n")
    let body_start_rel = after_opening.find('\n')? + 1;
    let body_start = fence_start + 3 + body_start_rel;

    let closing = content[body_start..].find("```")?;
    let body_end = body_start + closing;

    if body_start >= body_end {
        return None;
    }

    Some(&content[body_start..body_end])
}

/// Extract a balanced JSON object starting at position 0 of `s`.
///
/// Counts `{` / `}` depth, respecting string literals, to find the
/// matching close brace.
fn extract_balanced(s: &str) -> Option<&str> {
    if !s.starts_with('{') {
        return None;
    }
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
