//! Process-wide daemon context.
//!
//! Owns the per-agent manager registry and the scheduler as an explicit
//! object with documented init/teardown, injected into whatever needs them.
//! Created once at daemon start (under the daemon lock) and torn down on
//! shutdown.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use anyhow::{Context as _, Result, anyhow};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::config::{CoordinatorConfig, load_config};
use crate::io::lock::{LockCheck, LockFile};
use crate::io::process::{current_pid, spawn_supervised};
use crate::paths::ProjectPaths;
use crate::process_manager::AgentProcessManager;
use crate::scheduler::{RunStarter, Scheduler};
use crate::store::Database;

pub struct DaemonContext {
    paths: ProjectPaths,
    config: CoordinatorConfig,
    db: Database,
    daemon_lock: LockFile,
    managers: Mutex<HashMap<String, Arc<Mutex<AgentProcessManager>>>>,
    scheduler: Option<Scheduler>,
}

impl std::fmt::Debug for DaemonContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonContext")
            .field("paths", &self.paths)
            .finish_non_exhaustive()
    }
}

impl DaemonContext {
    /// Acquire the daemon lock, open the store, start the scheduler, and
    /// restore persisted schedules. Exactly one context exists per project
    /// at a time; a second caller gets an error, not a second daemon.
    #[instrument(skip_all, fields(project = %project_dir.display()))]
    pub fn init(project_dir: &Path) -> Result<Self> {
        let paths = ProjectPaths::new(project_dir);
        fs::create_dir_all(&paths.state_dir)
            .with_context(|| format!("create state dir {}", paths.state_dir.display()))?;
        let config = load_config(&paths.config_path)?;

        let daemon_lock = LockFile::new(paths.daemon_lock_path.clone());
        if !daemon_lock.create(current_pid())? {
            return Err(anyhow!(
                "another coordination daemon owns {}",
                paths.daemon_lock_path.display()
            ));
        }

        let db = Database::open(&paths.db_path)?;
        let starter: Arc<dyn RunStarter> = Arc::new(SpawnRunStarter {
            project_dir: project_dir.to_path_buf(),
            paths: paths.clone(),
        });
        let scheduler = Scheduler::new(db.clone(), starter)?;

        let context = Self {
            paths,
            config,
            db,
            daemon_lock,
            managers: Mutex::new(HashMap::new()),
            scheduler: Some(scheduler),
        };
        let restored = context.scheduler().restore()?;
        info!(restored, "daemon context initialized");
        Ok(context)
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn scheduler(&self) -> &Scheduler {
        self.scheduler
            .as_ref()
            .expect("scheduler torn down while context in use")
    }

    /// Get or create the manager for one agent identity.
    pub fn manager_for(&self, agent_id: &str) -> Arc<Mutex<AgentProcessManager>> {
        self.managers
            .lock()
            .entry(agent_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(AgentProcessManager::new(
                    &self.paths.root,
                    agent_id,
                    self.db.clone(),
                )))
            })
            .clone()
    }

    /// Reconcile every registered manager against OS reality. Individual
    /// failures are logged; the sweep itself never fails.
    pub fn healthcheck_all(&self) {
        let managers: Vec<_> = self.managers.lock().values().cloned().collect();
        for manager in managers {
            let mut manager = manager.lock();
            if let Err(err) = manager.healthcheck() {
                warn!(agent_id = manager.agent_id(), err = %err, "healthcheck failed");
            }
        }
    }

    /// Shut down: stop the scheduler timer (joining its thread), reconcile
    /// managers one last time, and release the daemon lock via Drop.
    #[instrument(skip_all)]
    pub fn teardown(mut self) {
        self.scheduler.take();
        self.healthcheck_all();
        info!("daemon context torn down");
    }
}

impl Drop for DaemonContext {
    fn drop(&mut self) {
        self.daemon_lock.release();
    }
}

/// Starter used by scheduled fires: launches a detached `run` pass and
/// treats a held run lock as "already active".
struct SpawnRunStarter {
    project_dir: PathBuf,
    paths: ProjectPaths,
}

impl RunStarter for SpawnRunStarter {
    fn is_active(&self, _project: &str) -> bool {
        LockFile::new(self.paths.run_lock_path.clone())
            .check()
            .map(|check| check == LockCheck::Blocked)
            .unwrap_or(false)
    }

    fn start_run(&self, _project: &str, _request: &Value) -> Result<()> {
        let exe = std::env::current_exe().context("locate coordinator binary")?;
        let mut cmd = Command::new(exe);
        cmd.arg("run").arg("--project-dir").arg(&self.project_dir);
        spawn_supervised(cmd, &self.paths.state_dir.join("scheduled_run.log"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn init_is_exclusive_per_project() {
        let repo = TestRepo::new().expect("repo");
        let context = DaemonContext::init(repo.path()).expect("init");

        let err = DaemonContext::init(repo.path()).unwrap_err();
        assert!(err.to_string().contains("another coordination daemon"));

        context.teardown();
        // Lock released: a fresh context can start.
        let again = DaemonContext::init(repo.path()).expect("re-init");
        again.teardown();
    }

    #[test]
    fn manager_registry_returns_one_instance_per_agent() {
        let repo = TestRepo::new().expect("repo");
        let context = DaemonContext::init(repo.path()).expect("init");

        let a = context.manager_for("agent-1");
        let b = context.manager_for("agent-1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_ne!(
            Arc::as_ptr(&a),
            Arc::as_ptr(&context.manager_for("agent-2"))
        );
        context.teardown();
    }
}
