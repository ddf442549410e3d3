//! Final report assembly.
//!
//! The report is deterministic local Markdown built from the plan and the
//! observation store. No model call is involved: whatever the session
//! managed to collect is what the report shows, with failures named in an
//! appendix instead of hidden.

use std::collections::BTreeMap;

use chrono::Utc;

use crate::observations::{Observation, ObservationStore};
use crate::plan::{Plan, StepStatus};

/// Everything the report needs beyond the plan itself
#[derive(Debug, Default)]
pub struct ReportInputs {
    /// Sources collected per step index
    pub sources: BTreeMap<usize, Vec<String>>,

    /// Background lookup text, used as the sole finding when the plan
    /// declared it already had enough context
    pub background: Option<String>,

    /// Findings carried over from superseded plans, already capped
    pub earlier_findings: Vec<Observation>,

    /// Sources collected under superseded plans
    pub earlier_sources: Vec<String>,
}

/// Render the final Markdown report.
///
/// Findings appear in step-index order regardless of completion order.
/// Steps that did not finish `Done` are listed in an appendix with their
/// recorded errors, so a partial run reads as partial rather than complete.
pub fn build_report(plan: &Plan, observations: &ObservationStore, inputs: &ReportInputs) -> String {
    let mut out = String::new();

    out.push_str(&format!("# {}\n\n", plan.title));
    out.push_str(&format!(
        "_Generated {}_\n\n",
        Utc::now().format("%Y-%m-%d %H:%M UTC")
    ));

    if !plan.rationale.is_empty() {
        out.push_str("## Overview\n\n");
        out.push_str(plan.rationale.trim());
        out.push_str("\n\n");
    }

    let findings = observations.sorted_by_index();
    if findings.is_empty() {
        if let Some(background) = &inputs.background {
            out.push_str("## Findings\n\n");
            out.push_str(background.trim());
            out.push_str("\n\n");
        } else if inputs.earlier_findings.is_empty() {
            out.push_str("## Findings\n\nNo findings were collected.\n\n");
        }
    } else {
        out.push_str("## Findings\n\n");
        for obs in &findings {
            out.push_str(&format!("### {}. {}\n\n", obs.step_index + 1, obs.title));
            out.push_str(obs.content.trim());
            out.push_str("\n\n");
        }
    }

    // Step indices in carried findings belong to superseded plans, so the
    // entries are titled rather than numbered.
    if !inputs.earlier_findings.is_empty() {
        out.push_str("## Findings from earlier plans\n\n");
        for obs in &inputs.earlier_findings {
            out.push_str(&format!("### {}\n\n", obs.title));
            out.push_str(obs.content.trim());
            out.push_str("\n\n");
        }
    }

    let sources = dedup_sources(&inputs.earlier_sources, &inputs.sources);
    if !sources.is_empty() {
        out.push_str("## Sources\n\n");
        for source in sources {
            out.push_str(&format!("- {}\n", source));
        }
        out.push('\n');
    }

    let incomplete: Vec<_> = plan
        .steps
        .iter()
        .filter(|s| s.status != StepStatus::Done)
        .collect();
    if !incomplete.is_empty() {
        out.push_str("## Incomplete steps\n\n");
        for step in incomplete {
            let detail = step.error.as_deref().unwrap_or("no detail recorded");
            out.push_str(&format!(
                "- Step {} ({}): {} ({})\n",
                step.index + 1,
                step.status,
                step.title,
                detail
            ));
        }
        out.push('\n');
    }

    out
}

/// All sources in collection order, earlier plans first, first occurrence
/// wins
fn dedup_sources(earlier: &[String], sources: &BTreeMap<usize, Vec<String>>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for source in earlier.iter().chain(sources.values().flatten()) {
        if seen.insert(source.as_str()) {
            out.push(source.clone());
        }
    }
    out
}
