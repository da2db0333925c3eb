//! Prompt assembly for worker sessions.
//!
//! The wire contract with every provider is the same: implement (or verify)
//! against the worktree, then leave an outcome JSON at the given path. The
//! plan artifact, when present, is embedded verbatim.

use std::fs;
use std::path::Path;

use anyhow::Result;

use crate::paths::ProjectPaths;
use crate::store::Feature;

const OUTCOME_CONTRACT: &str = "\
When you are finished, write a JSON file to the output path given above with:\n\
- \"status\": \"done\" or \"failed\"\n\
- \"summary\": one paragraph describing what you did or what went wrong\n\
- \"patch\" (optional): your change as a unified diff (`diff --git` style) if\n\
  you did not edit files directly. Never use `*** Begin Patch` blocks.\n";

/// Build the implement-one-feature prompt for a worker session.
///
/// Embeds the worktree's plan artifact under `Feature plan (generated):`
/// when one exists.
pub fn build_feature_prompt(
    feature: &Feature,
    worktree: &Path,
    outcome_path: &Path,
    attempt: i64,
) -> Result<String> {
    let mut out = String::new();
    out.push_str("You are an autonomous coding agent working in an isolated git worktree.\n");
    out.push_str("Implement exactly one feature, then report your outcome.\n\n");
    out.push_str(&format!("Output path: {}\n\n", outcome_path.display()));

    out.push_str(&format!("Feature #{}: {}\n", feature.id, feature.name));
    out.push_str(&format!("Category: {}\n", feature.category));
    if attempt > 0 {
        out.push_str(&format!(
            "This is retry attempt {attempt}; the previous attempt failed",
        ));
        if let Some(err) = &feature.last_error {
            out.push_str(&format!(" with:\n{err}\n"));
        } else {
            out.push('\n');
        }
    }
    out.push_str("\nDescription:\n");
    out.push_str(&feature.description);
    out.push('\n');

    if !feature.steps.is_empty() {
        out.push_str("\nSteps:\n");
        for (idx, step) in feature.steps.iter().enumerate() {
            out.push_str(&format!("{}. {step}\n", idx + 1));
        }
    }

    let plan_path = ProjectPaths::feature_plan_path(worktree);
    if plan_path.is_file() {
        let plan = fs::read_to_string(&plan_path)?;
        out.push_str("\nFeature plan (generated):\n");
        out.push_str(&plan);
        if !plan.ends_with('\n') {
            out.push('\n');
        }
    }

    out.push('\n');
    out.push_str(OUTCOME_CONTRACT);
    Ok(out)
}

/// Build the post-merge verification prompt for a regression sweep session.
pub fn build_regression_prompt(passing: &[Feature], outcome_path: &Path) -> String {
    let mut out = String::new();
    out.push_str("You are an autonomous verification agent working in an isolated git worktree.\n");
    out.push_str(
        "Re-verify the previously passing features listed below against the current code.\n",
    );
    out.push_str("Do not implement new functionality; only check for regressions.\n\n");
    out.push_str(&format!("Output path: {}\n\n", outcome_path.display()));

    out.push_str("Previously passing features:\n");
    for feature in passing {
        out.push_str(&format!("- #{}: {}\n", feature.id, feature.name));
    }

    out.push('\n');
    out.push_str(OUTCOME_CONTRACT);
    out.push_str(
        "Additionally include a \"regressions\" array with one entry per broken feature:\n\
         {\"regression_of_id\": <feature id>, \"summary\": \"...\", \"details\": \"...\",\n\
         \"artifact_path\": null}\n",
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FeatureStatus;

    fn feature_fixture() -> Feature {
        Feature {
            id: 1,
            name: "feat".to_string(),
            description: "desc".to_string(),
            category: "demo".to_string(),
            priority: 0,
            status: FeatureStatus::InProgress,
            assigned_agent_id: Some("agent-1".to_string()),
            depends_on: Vec::new(),
            steps: vec!["do x".to_string()],
            attempts: 0,
            last_error: None,
            failure_kind: None,
            last_artifact_path: None,
            regression_of_id: None,
            preserve_branch: false,
            created_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn prompt_includes_feature_plan_when_present() {
        let temp = tempfile::tempdir().expect("tempdir");
        let worktree = temp.path();
        let plan_path = ProjectPaths::feature_plan_path(worktree);
        fs::create_dir_all(plan_path.parent().expect("parent")).expect("mkdir");
        fs::write(&plan_path, "PLAN CONTENT\n").expect("write plan");

        let prompt = build_feature_prompt(
            &feature_fixture(),
            worktree,
            &worktree.join("outcome.json"),
            0,
        )
        .expect("prompt");

        assert!(prompt.contains("Feature plan (generated):"));
        assert!(prompt.contains("PLAN CONTENT"));
        assert!(prompt.contains("1. do x"));
    }

    #[test]
    fn prompt_omits_plan_section_without_artifact() {
        let temp = tempfile::tempdir().expect("tempdir");
        let prompt = build_feature_prompt(
            &feature_fixture(),
            temp.path(),
            &temp.path().join("outcome.json"),
            0,
        )
        .expect("prompt");
        assert!(!prompt.contains("Feature plan (generated):"));
    }

    #[test]
    fn retry_prompts_carry_the_previous_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut feature = feature_fixture();
        feature.last_error = Some("tests failed".to_string());
        let prompt = build_feature_prompt(
            &feature,
            temp.path(),
            &temp.path().join("outcome.json"),
            2,
        )
        .expect("prompt");
        assert!(prompt.contains("retry attempt 2"));
        assert!(prompt.contains("tests failed"));
    }
}
