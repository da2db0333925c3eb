//! Worker-side session lifecycle.
//!
//! Runs inside the spawned worker subprocess: registers its agent row,
//! heartbeats, drives the configured provider against the worktree, pushes
//! any returned patch through the patch validator, commits, and leaves a
//! `result.json` for the orchestrator to finalize on.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::config::{CoordinatorConfig, load_config};
use crate::core::types::{ProviderKind, WorkerOutcome, WorkerStatus};
use crate::io::git::Git;
use crate::io::patch::apply_patch;
use crate::io::process::current_pid;
use crate::paths::ProjectPaths;
use crate::prompt::{build_feature_prompt, build_regression_prompt};
use crate::providers::{ProviderRequest, provider_for, run_and_load};
use crate::store::{Database, Feature};

/// Exit code for a session that finished but did not succeed, so the
/// supervising process can distinguish "worker said failed" from a crash.
pub const FAILURE_EXIT_CODE: i32 = 3;

/// Arguments for one worker session (mirrors the `worker` subcommand).
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub project_dir: PathBuf,
    pub worktree: PathBuf,
    pub agent_id: String,
    /// `None` runs a regression verification sweep instead of one feature.
    pub feature_id: Option<i64>,
    pub provider: ProviderKind,
    pub heartbeat_seconds: u64,
}

/// Run one worker session to completion.
///
/// Always writes `result.json` into the agent directory (success or
/// failure) and marks the agent row completed before returning; the exit
/// status signals the outcome to the supervising process.
#[instrument(skip_all, fields(agent_id = %args.agent_id, feature_id = args.feature_id))]
pub fn run_worker(args: &WorkerArgs) -> Result<WorkerOutcome> {
    let paths = ProjectPaths::new(&args.project_dir);
    let config = load_config(&paths.config_path)?;
    if !args.worktree.exists() {
        return Err(anyhow!(
            "worktree does not exist: {}",
            args.worktree.display()
        ));
    }

    let db = Database::open(&paths.db_path)?;
    db.register_agent(&args.agent_id, Some(current_pid()))?;

    let heartbeat = HeartbeatHandle::start(db.clone(), &args.agent_id, args.heartbeat_seconds);

    let outcome = run_session(args, &paths, &config, &db);

    heartbeat.stop();

    // Teardown bookkeeping is best-effort: the result file is the contract,
    // a failed row update must not turn a finished session into an error.
    if let Err(err) = db.mark_agent_completed(&args.agent_id) {
        warn!(err = %err, "failed to mark agent completed");
    }

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => WorkerOutcome {
            status: WorkerStatus::Failed,
            summary: format!("{err:#}"),
            patch: None,
            regressions: Vec::new(),
        },
    };
    write_result(&paths.agent_dir(&args.agent_id), &outcome)?;
    info!(status = ?outcome.status, "worker session finished");
    Ok(outcome)
}

fn run_session(
    args: &WorkerArgs,
    paths: &ProjectPaths,
    config: &CoordinatorConfig,
    db: &Database,
) -> Result<WorkerOutcome> {
    let agent_dir = paths.agent_dir(&args.agent_id);
    let outcome_path = agent_dir.join("provider_outcome.json");

    let (prompt, feature) = match args.feature_id {
        Some(feature_id) => {
            let feature = db
                .get_feature(feature_id)?
                .ok_or_else(|| anyhow!("unknown feature #{feature_id}"))?;
            let prompt =
                build_feature_prompt(&feature, &args.worktree, &outcome_path, feature.attempts)?;
            (prompt, Some(feature))
        }
        None => {
            let passing = db.list_features(Some(crate::core::types::FeatureStatus::Passing))?;
            (build_regression_prompt(&passing, &outcome_path), None)
        }
    };

    let provider = provider_for(args.provider);
    let request = ProviderRequest {
        workdir: args.worktree.clone(),
        prompt,
        output_schema_path: agent_dir.join("outcome.schema.json"),
        output_path: outcome_path,
        provider_log_path: agent_dir.join("provider.log"),
        timeout: Duration::from_secs(config.worker_timeout_secs),
        output_limit_bytes: config.worker_output_limit_bytes,
    };

    let mut outcome = run_and_load(provider.as_ref(), &request)?;

    if outcome.status == WorkerStatus::Done
        && let Some(patch) = outcome.patch.take()
        && let Err(err) = apply_patch(&args.worktree, &patch)
    {
        return Ok(WorkerOutcome {
            status: WorkerStatus::Failed,
            summary: format!(
                "Worker failed to produce/apply a patch.\nLast error: {err:#}"
            ),
            patch: None,
            regressions: outcome.regressions,
        });
    }

    if outcome.status == WorkerStatus::Done
        && let Some(feature) = &feature
    {
        commit_worktree(&args.worktree, feature)?;
    }

    file_regressions(db, &outcome);
    Ok(outcome)
}

fn commit_worktree(worktree: &Path, feature: &Feature) -> Result<()> {
    let git = Git::new(worktree);
    git.add_all()?;
    let committed = git.commit_staged(&format!("feat: {} (#{})", feature.name, feature.id))?;
    debug!(committed, "worktree commit attempted");
    Ok(())
}

/// File reported regressions into the task store. Individual failures are
/// logged and skipped so one malformed report cannot sink the session.
fn file_regressions(db: &Database, outcome: &WorkerOutcome) {
    for report in &outcome.regressions {
        match db.create_regression_issue(
            report.regression_of_id,
            &report.summary,
            &report.details,
            report.artifact_path.as_deref(),
        ) {
            Ok(result) => info!(
                feature_id = result.feature_id,
                created = result.created,
                "regression reported"
            ),
            Err(err) => warn!(
                regression_of_id = report.regression_of_id,
                err = %err,
                "failed to file regression report"
            ),
        }
    }
}

fn write_result(agent_dir: &Path, outcome: &WorkerOutcome) -> Result<()> {
    fs::create_dir_all(agent_dir)
        .with_context(|| format!("create agent dir {}", agent_dir.display()))?;
    let mut buf = serde_json::to_string_pretty(outcome)?;
    buf.push('\n');
    let path = agent_dir.join("result.json");
    fs::write(&path, buf).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Background heartbeat writer. Failures are swallowed after a debug line:
/// heartbeats are best-effort and never fatal.
struct HeartbeatHandle {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl HeartbeatHandle {
    fn start(db: Database, agent_id: &str, interval_seconds: u64) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let agent_id = agent_id.to_string();
        let interval = Duration::from_secs(interval_seconds.max(5));

        let spawned = thread::Builder::new().name("heartbeat".to_string()).spawn(move || {
            loop {
                if let Err(err) = db.update_heartbeat(&agent_id) {
                    debug!(err = %err, "heartbeat write failed");
                }
                // Sleep in short slices so shutdown stays prompt.
                let mut remaining = interval;
                while !remaining.is_zero() {
                    if thread_stop.load(Ordering::SeqCst) {
                        return;
                    }
                    let slice = remaining.min(Duration::from_millis(200));
                    thread::sleep(slice);
                    remaining -= slice;
                }
            }
        });
        let thread = match spawned {
            Ok(thread) => Some(thread),
            Err(err) => {
                // A session without heartbeats still runs; the supervisor
                // will treat it as stale if it hangs.
                warn!(err = %err, "failed to start heartbeat thread");
                None
            }
        };

        Self { stop, thread }
    }

    fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("heartbeat thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FeatureStatus;
    use crate::io::worktree::provision;
    use crate::store::NewFeature;
    use crate::test_support::TestRepo;

    fn heartbeat_of(db: &Database, agent_id: &str) -> Option<String> {
        db.get_agent(agent_id)
            .expect("get agent")
            .and_then(|session| session.last_heartbeat)
    }

    #[test]
    fn heartbeat_thread_writes_and_stops() {
        let repo = TestRepo::new().expect("repo");
        let db = repo.db();
        db.register_agent("agent-1", None).expect("register");

        let handle = HeartbeatHandle::start(db.clone(), "agent-1", 5);
        thread::sleep(Duration::from_millis(100));
        handle.stop();

        assert!(heartbeat_of(&db, "agent-1").is_some());
    }

    #[test]
    fn heartbeat_failures_are_swallowed() {
        let repo = TestRepo::new().expect("repo");
        // No registered row: updates hit zero rows but never error the loop.
        let handle = HeartbeatHandle::start(repo.db(), "ghost", 5);
        thread::sleep(Duration::from_millis(50));
        handle.stop();
    }

    #[test]
    fn result_file_round_trips_through_schema_validation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outcome = WorkerOutcome {
            status: WorkerStatus::Failed,
            summary: "broke".to_string(),
            patch: None,
            regressions: Vec::new(),
        };
        write_result(temp.path(), &outcome).expect("write");

        let loaded =
            crate::providers::load_outcome(&temp.path().join("result.json")).expect("load");
        assert_eq!(loaded, outcome);
    }

    #[test]
    fn commit_worktree_commits_agent_changes() {
        let repo = TestRepo::new().expect("repo");
        let worktree = provision(repo.path(), "agent-1").expect("provision");
        let feature_id = repo
            .db()
            .create_feature(&NewFeature {
                name: "demo".to_string(),
                description: "demo".to_string(),
                category: "core".to_string(),
                ..NewFeature::default()
            })
            .expect("create");
        let feature = repo
            .db()
            .get_feature(feature_id)
            .expect("get")
            .expect("present");

        fs::write(worktree.path.join("new_file.txt"), "content\n").expect("write");
        commit_worktree(&worktree.path, &feature).expect("commit");

        assert_eq!(feature.status, FeatureStatus::Pending);
        let git = Git::new(&worktree.path);
        assert!(git.status_porcelain_lines().expect("status").is_empty());
    }
}
