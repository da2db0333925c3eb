//! End-to-end orchestrator lifecycle tests with scripted worker sessions.
//!
//! These drive `run_until_idle` through dispatch, supervision, and
//! finalization: clean results merge into trunk and pass, failures block
//! with the worker's error, and the Gatekeeper refuses dirty worktrees.

use std::fs;

use autocoder::config::CoordinatorConfig;
use autocoder::core::types::{FeatureStatus, WorkerOutcome, WorkerStatus};
use autocoder::io::git::Git;
use autocoder::orchestrator::Orchestrator;
use autocoder::store::NewFeature;
use autocoder::test_support::{ScriptedLauncher, ScriptedSessionPlan, TestRepo, commit_all};

fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        max_agents: 1,
        poll_interval_ms: 10,
        ..CoordinatorConfig::default()
    }
}

fn done_outcome(summary: &str) -> WorkerOutcome {
    WorkerOutcome {
        status: WorkerStatus::Done,
        summary: summary.to_string(),
        patch: None,
        regressions: Vec::new(),
    }
}

fn failed_outcome(summary: &str) -> WorkerOutcome {
    WorkerOutcome {
        status: WorkerStatus::Failed,
        summary: summary.to_string(),
        patch: None,
        regressions: Vec::new(),
    }
}

fn create_feature(repo: &TestRepo, name: &str) -> i64 {
    repo.db()
        .create_feature(&NewFeature {
            name: name.to_string(),
            description: "implement it".to_string(),
            category: "backend".to_string(),
            steps: vec!["step one".to_string(), "step two".to_string(), "step three".to_string()],
            ..NewFeature::default()
        })
        .expect("create feature")
}

/// Happy path: the worker commits its change, the Gatekeeper finds the
/// worktree clean, the branch merges into trunk, and the feature passes.
#[test]
fn successful_worker_merges_and_passes() {
    let repo = TestRepo::new().expect("repo");
    let feature_id = create_feature(&repo, "Add endpoint");

    let launcher = ScriptedLauncher::new(vec![
        ScriptedSessionPlan::exit_success()
            .with_outcome(done_outcome("implemented the endpoint"))
            .with_hook(|request| {
                fs::write(request.worktree_path.join("endpoint.rs"), "pub fn handler() {}\n")?;
                commit_all(&request.worktree_path, "add endpoint")
            }),
    ]);

    let orchestrator = Orchestrator::new(repo.path(), fast_config()).expect("orchestrator");
    let summary = orchestrator.run_until_idle(&launcher).expect("run");

    assert_eq!(summary.dispatched, 1);
    assert_eq!(summary.passed, vec![feature_id]);
    assert!(summary.blocked.is_empty());

    let feature = repo
        .db()
        .get_feature(feature_id)
        .expect("get")
        .expect("present");
    assert_eq!(feature.status, FeatureStatus::Passing);
    assert!(feature.assigned_agent_id.is_none());

    // The worker's commit landed on trunk and the worktree is gone.
    assert!(repo.path().join("endpoint.rs").exists());
    assert!(!repo.path().join("worktrees").join(&format!(
        "agent-{}-0",
        std::process::id()
    )).exists());
}

/// A failing worker blocks the feature with its reported error, and a
/// worker-side failure preserves the branch for inspection.
#[test]
fn failing_worker_blocks_feature_and_preserves_branch() {
    let repo = TestRepo::new().expect("repo");
    let feature_id = create_feature(&repo, "Flaky feature");

    let launcher = ScriptedLauncher::new(vec![
        ScriptedSessionPlan::exit_failure().with_outcome(failed_outcome(
            "Worker failed to produce/apply a patch.\nLast error: Patch did not look like a unified diff",
        )),
    ]);

    let orchestrator = Orchestrator::new(repo.path(), fast_config()).expect("orchestrator");
    let summary = orchestrator.run_until_idle(&launcher).expect("run");

    assert_eq!(summary.blocked, vec![feature_id]);
    assert!(summary.passed.is_empty());

    let feature = repo
        .db()
        .get_feature(feature_id)
        .expect("get")
        .expect("present");
    assert_eq!(feature.status, FeatureStatus::Blocked);
    assert!(feature.preserve_branch);
    assert!(
        feature
            .last_error
            .as_deref()
            .is_some_and(|err| err.contains("unified diff"))
    );

    // The branch survived for forensics; the checkout did not.
    let git = Git::new(repo.path());
    let agent_branch = format!("agent/agent-{}-0", std::process::id());
    assert!(git.branch_exists(&agent_branch).expect("branch exists"));
    assert!(
        !repo.path().join("worktrees").join(&format!(
            "agent-{}-0",
            std::process::id()
        )).exists()
    );
}

/// A worker that claims success but leaves non-ignorable dirt in its
/// worktree is refused by the Gatekeeper and surfaced for manual resolution.
#[test]
fn dirty_worktree_blocks_deterministic_merge() {
    let repo = TestRepo::new().expect("repo");
    let feature_id = create_feature(&repo, "Messy feature");

    let launcher = ScriptedLauncher::new(vec![
        ScriptedSessionPlan::exit_success()
            .with_outcome(done_outcome("done, I promise"))
            .with_hook(|request| {
                // Uncommitted, non-ignorable file left behind.
                fs::write(request.worktree_path.join("junk.txt"), "leftover\n")?;
                Ok(())
            }),
    ]);

    let orchestrator = Orchestrator::new(repo.path(), fast_config()).expect("orchestrator");
    let summary = orchestrator.run_until_idle(&launcher).expect("run");

    assert_eq!(summary.blocked, vec![feature_id]);
    let feature = repo
        .db()
        .get_feature(feature_id)
        .expect("get")
        .expect("present");
    assert_eq!(feature.status, FeatureStatus::Blocked);
    assert!(
        feature
            .last_error
            .as_deref()
            .is_some_and(|err| err.contains("manual resolution"))
    );
    assert!(
        feature
            .last_error
            .as_deref()
            .is_some_and(|err| err.contains("junk.txt"))
    );
}

/// A worker that dies without writing a result file is blocked with a
/// descriptive reason rather than silently retried or passed.
#[test]
fn missing_result_file_blocks_with_descriptive_reason() {
    let repo = TestRepo::new().expect("repo");
    let feature_id = create_feature(&repo, "Ghost feature");

    let launcher = ScriptedLauncher::new(vec![ScriptedSessionPlan::exit_failure()]);

    let orchestrator = Orchestrator::new(repo.path(), fast_config()).expect("orchestrator");
    let summary = orchestrator.run_until_idle(&launcher).expect("run");

    assert_eq!(summary.blocked, vec![feature_id]);
    let feature = repo
        .db()
        .get_feature(feature_id)
        .expect("get")
        .expect("present");
    assert!(
        feature
            .last_error
            .as_deref()
            .is_some_and(|err| err.contains("without a result file"))
    );
}

/// With regression sweeps enabled, a verification session is dispatched
/// after the configured number of merges and cleaned up like any worker.
#[test]
fn regression_sweep_runs_after_merges() {
    let repo = TestRepo::new().expect("repo");
    create_feature(&repo, "Swept feature");

    let config = CoordinatorConfig {
        regression: autocoder::config::RegressionConfig {
            enabled: true,
            merge_interval: 1,
        },
        ..fast_config()
    };

    let launcher = ScriptedLauncher::new(vec![
        ScriptedSessionPlan::exit_success()
            .with_outcome(done_outcome("implemented"))
            .with_hook(|request| {
                fs::write(request.worktree_path.join("done.txt"), "x\n")?;
                commit_all(&request.worktree_path, "work")
            }),
        // The sweep session itself: verifies and exits clean.
        ScriptedSessionPlan::exit_success().with_outcome(done_outcome("no regressions found")),
    ]);

    let orchestrator = Orchestrator::new(repo.path(), config).expect("orchestrator");
    let summary = orchestrator.run_until_idle(&launcher).expect("run");

    assert_eq!(summary.passed.len(), 1);
    assert_eq!(summary.sweeps, 1);
    assert_eq!(launcher.launched(), 2);
}

/// Two eligible features drain through a single worker slot in priority
/// order, each through its own worktree.
#[test]
fn backlog_drains_through_limited_capacity() {
    let repo = TestRepo::new().expect("repo");
    let low = create_feature(&repo, "Low priority");
    let high = repo
        .db()
        .create_feature(&NewFeature {
            name: "High priority".to_string(),
            description: "urgent".to_string(),
            category: "backend".to_string(),
            priority: 5,
            ..NewFeature::default()
        })
        .expect("create feature");

    let make_plan = |marker: &'static str| {
        ScriptedSessionPlan::exit_success()
            .with_outcome(done_outcome("done"))
            .with_hook(move |request| {
                fs::write(request.worktree_path.join(marker), "x\n")?;
                commit_all(&request.worktree_path, marker)
            })
    };
    let launcher = ScriptedLauncher::new(vec![make_plan("first.txt"), make_plan("second.txt")]);

    let orchestrator = Orchestrator::new(repo.path(), fast_config()).expect("orchestrator");
    let summary = orchestrator.run_until_idle(&launcher).expect("run");

    assert_eq!(summary.dispatched, 2);
    assert_eq!(summary.passed, vec![high, low], "priority order");
    assert!(repo.path().join("first.txt").exists());
    assert!(repo.path().join("second.txt").exists());
}
