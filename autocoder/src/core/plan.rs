//! Plan-injection risk policy and fallback plan rendering.

use crate::core::types::PlannerMode;

/// Categories whose features are presumed low-risk when small and untried.
const SIMPLE_CATEGORIES: &[&str] = &["docs", "documentation", "chore"];

/// Inputs the risk policy looks at; a deliberately small slice of a feature.
#[derive(Debug, Clone)]
pub struct PlanRiskInput<'a> {
    pub category: &'a str,
    pub step_count: usize,
    pub attempts: i64,
}

/// Whether a dispatch needs a plan artifact in its worktree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanDecision {
    Skip,
    Generate,
}

/// Decide whether to ensure a plan before dispatching a feature.
///
/// A prior failed attempt always escalates to planning, regardless of
/// category: the cheap path already failed once.
pub fn plan_decision(mode: PlannerMode, input: &PlanRiskInput<'_>) -> PlanDecision {
    match mode {
        PlannerMode::RequiredAlways => PlanDecision::Generate,
        PlannerMode::RequiredSmart => {
            if input.attempts > 0 {
                return PlanDecision::Generate;
            }
            let simple_category = SIMPLE_CATEGORIES
                .iter()
                .any(|c| input.category.eq_ignore_ascii_case(c));
            if simple_category && input.step_count <= 2 {
                PlanDecision::Skip
            } else {
                PlanDecision::Generate
            }
        }
    }
}

/// Render the synthesized plan written when real plan generation is
/// unavailable or errored. Planning failures are fail-open: dispatch
/// proceeds with this artifact instead of blocking.
pub fn render_fallback_plan(
    name: &str,
    description: &str,
    steps: &[String],
    reason: &str,
) -> String {
    let mut out = String::new();
    out.push_str("# Feature plan (fallback)\n\n");
    out.push_str(&format!("Feature: {name}\n\n"));
    out.push_str(&format!("Reason: {reason}\n\n"));
    out.push_str("## Goal\n\n");
    out.push_str(description);
    out.push_str("\n\n## Steps\n\n");
    if steps.is_empty() {
        out.push_str("1. Implement the feature as described above.\n");
        out.push_str("2. Add or update tests covering the change.\n");
    } else {
        for (idx, step) in steps.iter().enumerate() {
            out.push_str(&format!("{}. {step}\n", idx + 1));
        }
    }
    out
}
