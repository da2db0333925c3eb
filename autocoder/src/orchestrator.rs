//! Top-level dispatch loop.
//!
//! Claims eligible features, provisions isolated worktrees, injects plans,
//! launches workers through the process manager, and finalizes each session
//! through the Gatekeeper: clean results merge into trunk and pass, anything
//! else blocks the feature with the worker's error.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::CoordinatorConfig;
use crate::core::classify::classify_error;
use crate::core::plan::{PlanDecision, PlanRiskInput, plan_decision, render_fallback_plan};
use crate::core::types::{AgentRunStatus, WorkerStatus};
use crate::io::gatekeeper;
use crate::io::git::Git;
use crate::io::lock::LockFile;
use crate::io::process::current_pid;
use crate::io::worktree::{self, Worktree};
use crate::paths::ProjectPaths;
use crate::process_manager::{AgentProcessManager, WorkerLaunchRequest, WorkerLauncher};
use crate::providers::load_outcome;
use crate::store::{Database, Feature};

/// Outcome of one `run_until_idle` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrchestratorSummary {
    pub dispatched: usize,
    pub passed: Vec<i64>,
    pub blocked: Vec<i64>,
    pub sweeps: usize,
}

struct ActiveWorker {
    manager: AgentProcessManager,
    /// `None` for regression sweep sessions.
    feature: Option<Feature>,
    worktree: Worktree,
    started: Instant,
}

enum Supervision {
    Running,
    Exited {
        clean: bool,
        forced_reason: Option<String>,
    },
}

enum Finalized {
    Passed(i64),
    Blocked(i64),
    Sweep,
}

pub struct Orchestrator {
    project_dir: PathBuf,
    paths: ProjectPaths,
    config: CoordinatorConfig,
    db: Database,
    seq: AtomicU32,
}

impl Orchestrator {
    pub fn new(project_dir: &Path, config: CoordinatorConfig) -> Result<Self> {
        let paths = ProjectPaths::new(project_dir);
        let db = Database::open(&paths.db_path)?;
        Ok(Self {
            project_dir: project_dir.to_path_buf(),
            paths,
            config,
            db,
            seq: AtomicU32::new(0),
        })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Ensure a plan artifact exists in the worktree when policy demands one.
    ///
    /// With no planning collaborator wired in, the clearly-labeled fallback
    /// plan is synthesized instead of blocking dispatch: planning failures
    /// are fail-open.
    #[instrument(skip_all, fields(feature_id = feature.id))]
    pub fn ensure_feature_plan(
        &self,
        feature: &Feature,
        worktree_path: &Path,
    ) -> Result<Option<PathBuf>> {
        let input = PlanRiskInput {
            category: &feature.category,
            step_count: feature.steps.len(),
            attempts: feature.attempts,
        };
        if plan_decision(self.config.planner.mode, &input) == PlanDecision::Skip {
            debug!("plan skipped for low-risk feature");
            return Ok(None);
        }

        let plan_path = ProjectPaths::feature_plan_path(worktree_path);
        if plan_path.is_file() {
            return Ok(Some(plan_path));
        }

        let plan = render_fallback_plan(
            &feature.name,
            &feature.description,
            &feature.steps,
            "plan generation unavailable; synthesized fallback",
        );
        if let Some(parent) = plan_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create plan dir {}", parent.display()))?;
        }
        std::fs::write(&plan_path, plan)
            .with_context(|| format!("write plan {}", plan_path.display()))?;
        info!(path = %plan_path.display(), "fallback plan written");
        Ok(Some(plan_path))
    }

    /// Dispatch and supervise workers until the claimable backlog drains.
    ///
    /// Holds the per-project run lock for the duration; a second concurrent
    /// run (or a scheduled fire) is refused instead of double-dispatching.
    #[instrument(skip_all)]
    pub fn run_until_idle(&self, launcher: &dyn WorkerLauncher) -> Result<OrchestratorSummary> {
        let run_lock = LockFile::new(self.paths.run_lock_path.clone());
        if !run_lock.create(current_pid())? {
            return Err(anyhow!("another orchestrator run is active for this project"));
        }
        let result = self.run_inner(launcher);
        run_lock.release();
        result
    }

    fn run_inner(&self, launcher: &dyn WorkerLauncher) -> Result<OrchestratorSummary> {
        gatekeeper::require_clean(&self.project_dir)
            .context("trunk is not clean; refusing to fan out worktrees")?;

        let mut summary = OrchestratorSummary::default();
        let mut active: Vec<ActiveWorker> = Vec::new();
        let mut merges_since_sweep = 0u32;
        let poll = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            while active.len() < self.config.max_agents as usize {
                let agent_id = self.next_agent_id("agent");
                let Some(feature) = self.db.claim_next_pending_feature(&agent_id)? else {
                    break;
                };
                match self.dispatch(launcher, Some(&feature), &agent_id) {
                    Ok(worker) => {
                        summary.dispatched += 1;
                        active.push(worker);
                    }
                    Err(err) => {
                        warn!(feature_id = feature.id, err = %err, "dispatch failed");
                        self.db.block_feature(
                            feature.id,
                            &format!("worker dispatch failed: {err:#}"),
                            false,
                        )?;
                        summary.blocked.push(feature.id);
                    }
                }
            }

            if active.is_empty() {
                break;
            }
            thread::sleep(poll);

            let mut still_running = Vec::new();
            for mut worker in active {
                match self.supervise(&mut worker)? {
                    Supervision::Running => still_running.push(worker),
                    Supervision::Exited {
                        clean,
                        forced_reason,
                    } => match self.finalize(worker, clean, forced_reason)? {
                        Finalized::Passed(id) => {
                            summary.passed.push(id);
                            merges_since_sweep += 1;
                        }
                        Finalized::Blocked(id) => summary.blocked.push(id),
                        Finalized::Sweep => {}
                    },
                }
            }
            active = still_running;

            if self.config.regression.enabled
                && merges_since_sweep >= self.config.regression.merge_interval
                && active.len() < self.config.max_agents as usize
            {
                merges_since_sweep = 0;
                let agent_id = self.next_agent_id("sweep");
                match self.dispatch(launcher, None, &agent_id) {
                    Ok(worker) => {
                        summary.sweeps += 1;
                        active.push(worker);
                    }
                    Err(err) => warn!(err = %err, "regression sweep dispatch failed"),
                }
            }
        }

        info!(
            dispatched = summary.dispatched,
            passed = summary.passed.len(),
            blocked = summary.blocked.len(),
            "orchestrator idle"
        );
        Ok(summary)
    }

    fn next_agent_id(&self, role: &str) -> String {
        format!(
            "{role}-{}-{}",
            current_pid(),
            self.seq.fetch_add(1, Ordering::SeqCst)
        )
    }

    fn dispatch(
        &self,
        launcher: &dyn WorkerLauncher,
        feature: Option<&Feature>,
        agent_id: &str,
    ) -> Result<ActiveWorker> {
        let worktree = worktree::provision(&self.project_dir, agent_id)?;

        if let Some(feature) = feature
            && let Err(err) = self.ensure_feature_plan(feature, &worktree.path)
        {
            // Fail-open: a broken planning path never blocks dispatch.
            warn!(err = %err, "plan injection failed; dispatching without plan");
        }

        let request = WorkerLaunchRequest {
            project_dir: self.project_dir.clone(),
            agent_id: agent_id.to_string(),
            worktree_path: worktree.path.clone(),
            feature_id: feature.map(|f| f.id),
            provider: self.config.provider,
            heartbeat_seconds: self.config.heartbeat_seconds,
            log_path: self.paths.agent_dir(agent_id).join("worker.log"),
        };

        let mut manager = AgentProcessManager::new(&self.project_dir, agent_id, self.db.clone());
        if !manager.start(launcher, &request)? {
            worktree::teardown(&self.project_dir, &worktree, false);
            return Err(anyhow!("agent lock contended for '{agent_id}'"));
        }

        info!(agent_id, feature_id = feature.map(|f| f.id), "worker dispatched");
        Ok(ActiveWorker {
            manager,
            feature: feature.cloned(),
            worktree,
            started: Instant::now(),
        })
    }

    fn supervise(&self, worker: &mut ActiveWorker) -> Result<Supervision> {
        match worker.manager.healthcheck()? {
            AgentRunStatus::Running | AgentRunStatus::Paused => {
                let budget = Duration::from_secs(self.config.worker_timeout_secs + 60);
                if worker.started.elapsed() > budget {
                    warn!(agent_id = worker.manager.agent_id(), "worker timed out");
                    worker.manager.stop()?;
                    return Ok(Supervision::Exited {
                        clean: false,
                        forced_reason: Some(format!(
                            "worker timed out after {}s",
                            budget.as_secs()
                        )),
                    });
                }

                let stale_after = (self.config.heartbeat_seconds * 3) as i64;
                if let Some(age) = worker.manager.heartbeat_age_secs()?
                    && age > stale_after
                {
                    warn!(
                        agent_id = worker.manager.agent_id(),
                        age, "worker heartbeat lost"
                    );
                    worker.manager.stop()?;
                    return Ok(Supervision::Exited {
                        clean: false,
                        forced_reason: Some(format!(
                            "worker heartbeat lost ({age}s since last beat)"
                        )),
                    });
                }
                Ok(Supervision::Running)
            }
            AgentRunStatus::Stopped => Ok(Supervision::Exited {
                clean: true,
                forced_reason: None,
            }),
            AgentRunStatus::Crashed => Ok(Supervision::Exited {
                clean: false,
                forced_reason: None,
            }),
            AgentRunStatus::Completed => Ok(Supervision::Exited {
                clean: true,
                forced_reason: None,
            }),
        }
    }

    fn finalize(
        &self,
        worker: ActiveWorker,
        clean_exit: bool,
        forced_reason: Option<String>,
    ) -> Result<Finalized> {
        let agent_id = worker.manager.agent_id().to_string();
        let result_path = self.paths.agent_dir(&agent_id).join("result.json");
        let outcome = if result_path.is_file() {
            match load_outcome(&result_path) {
                Ok(outcome) => Some(outcome),
                Err(err) => {
                    warn!(agent_id, err = %err, "worker result failed validation");
                    None
                }
            }
        } else {
            None
        };

        let Some(feature) = worker.feature else {
            // Regression sweeps have no feature to finalize; reported
            // regressions were already filed by the worker itself.
            worktree::teardown(&self.project_dir, &worker.worktree, false);
            info!(agent_id, "regression sweep finished");
            return Ok(Finalized::Sweep);
        };

        let succeeded = clean_exit
            && forced_reason.is_none()
            && outcome
                .as_ref()
                .is_some_and(|o| o.status == WorkerStatus::Done);

        if succeeded {
            return self.reconcile(&agent_id, &feature, &worker.worktree);
        }

        let reason = forced_reason
            .or_else(|| outcome.map(|o| o.summary))
            .unwrap_or_else(|| {
                "worker exited without a result file (see worker.log)".to_string()
            });
        let preserve = classify_error(&reason).retry_recommended();
        self.db.block_feature(feature.id, &reason, preserve)?;
        worktree::teardown(&self.project_dir, &worker.worktree, preserve);
        info!(feature_id = feature.id, preserve, "feature blocked");
        Ok(Finalized::Blocked(feature.id))
    }

    /// Gatekeeper-checked reconciliation of a successful worker result into
    /// trunk.
    fn reconcile(
        &self,
        agent_id: &str,
        feature: &Feature,
        worktree: &Worktree,
    ) -> Result<Finalized> {
        let dirt = gatekeeper::dirty_status(&worktree.path)?;
        if !dirt.is_clean() {
            let reason = format!(
                "worktree left non-ignorable changes; manual resolution required:\n{}",
                dirt.remaining.join("\n")
            );
            self.db.block_feature(feature.id, &reason, true)?;
            worktree::teardown(&self.project_dir, worktree, true);
            info!(feature_id = feature.id, "merge refused by gatekeeper");
            return Ok(Finalized::Blocked(feature.id));
        }

        let merge_message = format!("merge {}: {} (#{})", worktree.branch, feature.name, feature.id);
        if let Err(err) = Git::new(&self.project_dir).merge_branch(&worktree.branch, &merge_message)
        {
            let reason = format!("merge of '{}' failed: {err:#}", worktree.branch);
            self.db.block_feature(feature.id, &reason, true)?;
            worktree::teardown(&self.project_dir, worktree, true);
            return Ok(Finalized::Blocked(feature.id));
        }

        // mark_feature_passing is idempotent; a false here means someone
        // else already finalized the feature, which is fine.
        self.db.mark_feature_passing(feature.id)?;
        worktree::teardown(&self.project_dir, worktree, false);
        info!(agent_id, feature_id = feature.id, "feature merged and passing");
        Ok(Finalized::Passed(feature.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::PlannerMode;
    use crate::store::NewFeature;
    use crate::test_support::TestRepo;
    use std::fs;

    fn orchestrator_with(repo: &TestRepo, config: CoordinatorConfig) -> Orchestrator {
        Orchestrator::new(repo.path(), config).expect("orchestrator")
    }

    fn feature_with(
        repo: &TestRepo,
        category: &str,
        steps: Vec<String>,
        attempts_seed: Option<&str>,
    ) -> Feature {
        let db = repo.db();
        let id = db
            .create_feature(&NewFeature {
                name: "Add auth middleware".to_string(),
                description: "Protect API routes with auth".to_string(),
                category: category.to_string(),
                steps,
                ..NewFeature::default()
            })
            .expect("create");
        if let Some(reason) = attempts_seed {
            // One failed round: claim, block, retry, reclaim.
            db.claim_next_pending_feature("agent-seed").expect("claim");
            db.block_feature(id, reason, false).expect("block");
            db.retry_blocked_features(&[id]).expect("retry");
            db.claim_next_pending_feature("agent-seed-2").expect("reclaim");
        }
        db.get_feature(id).expect("get").expect("present")
    }

    #[test]
    fn required_mode_writes_fallback_plan_for_risky_feature() {
        let repo = TestRepo::new().expect("repo");
        let orch = orchestrator_with(&repo, CoordinatorConfig::default());
        let worktree = repo.path().join("worktrees").join("agent-1");
        fs::create_dir_all(&worktree).expect("mkdir");

        let feature = feature_with(
            &repo,
            "backend",
            vec![
                "Find current auth pattern".to_string(),
                "Add middleware".to_string(),
                "Add tests".to_string(),
            ],
            None,
        );

        let plan_path = orch
            .ensure_feature_plan(&feature, &worktree)
            .expect("ensure plan")
            .expect("plan path");
        let text = fs::read_to_string(&plan_path).expect("read plan");
        assert!(text.contains("Feature plan (fallback)"));
        assert!(text.contains("Reason:"));
    }

    #[test]
    fn smart_mode_skips_low_risk_feature() {
        let repo = TestRepo::new().expect("repo");
        let mut config = CoordinatorConfig::default();
        config.planner.mode = PlannerMode::RequiredSmart;
        let orch = orchestrator_with(&repo, config);
        let worktree = repo.path().join("worktrees").join("agent-1");
        fs::create_dir_all(&worktree).expect("mkdir");

        let feature = feature_with(&repo, "docs", vec!["Edit README".to_string()], None);
        assert!(
            orch.ensure_feature_plan(&feature, &worktree)
                .expect("ensure plan")
                .is_none()
        );
    }

    #[test]
    fn smart_mode_plans_after_a_prior_failure() {
        let repo = TestRepo::new().expect("repo");
        let mut config = CoordinatorConfig::default();
        config.planner.mode = PlannerMode::RequiredSmart;
        let orch = orchestrator_with(&repo, config);
        let worktree = repo.path().join("worktrees").join("agent-1");
        fs::create_dir_all(&worktree).expect("mkdir");

        let feature = feature_with(
            &repo,
            "docs",
            vec!["Edit README".to_string()],
            Some("worker timed out"),
        );
        assert!(feature.attempts > 0);
        assert!(
            orch.ensure_feature_plan(&feature, &worktree)
                .expect("ensure plan")
                .is_some()
        );
    }

    #[test]
    fn existing_plan_artifact_is_reused() {
        let repo = TestRepo::new().expect("repo");
        let orch = orchestrator_with(&repo, CoordinatorConfig::default());
        let worktree = repo.path().join("worktrees").join("agent-1");
        let plan_path = ProjectPaths::feature_plan_path(&worktree);
        fs::create_dir_all(plan_path.parent().expect("parent")).expect("mkdir");
        fs::write(&plan_path, "handwritten plan\n").expect("write");

        let feature = feature_with(&repo, "backend", vec!["a".to_string()], None);
        let returned = orch
            .ensure_feature_plan(&feature, &worktree)
            .expect("ensure plan")
            .expect("path");
        assert_eq!(returned, plan_path);
        assert_eq!(
            fs::read_to_string(&plan_path).expect("read"),
            "handwritten plan\n"
        );
    }

    #[test]
    fn run_refuses_dirty_trunk() {
        let repo = TestRepo::new().expect("repo");
        fs::write(repo.path().join("uncommitted.rs"), "fn x() {}").expect("write");
        let orch = orchestrator_with(&repo, CoordinatorConfig::default());
        let launcher = crate::test_support::ScriptedLauncher::new(Vec::new());

        let err = orch.run_until_idle(&launcher).unwrap_err();
        assert!(format!("{err:#}").contains("trunk is not clean"));
    }
}
