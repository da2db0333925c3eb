//! Lifecycle of one spawned worker subprocess: start, crash detection, stop,
//! and lock acquisition/release.
//!
//! The [`WorkerLauncher`] / [`WorkerSession`] seam decouples supervision
//! from actual process spawning so tests can script sessions without forking.

use std::path::PathBuf;
use std::process::{Child, Command};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{AgentRunStatus, ProviderKind};
use crate::io::lock::{LockCheck, LockFile};
use crate::io::process::{current_pid, spawn_supervised};
use crate::paths::ProjectPaths;
use crate::store::Database;

/// Everything needed to launch one worker subprocess.
#[derive(Debug, Clone)]
pub struct WorkerLaunchRequest {
    pub project_dir: PathBuf,
    pub agent_id: String,
    pub worktree_path: PathBuf,
    pub feature_id: Option<i64>,
    pub provider: ProviderKind,
    pub heartbeat_seconds: u64,
    pub log_path: PathBuf,
}

/// How a finished session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionExit {
    pub success: bool,
}

/// A running (or finished) worker session.
pub trait WorkerSession {
    /// OS pid backing the session, when one exists.
    fn pid(&self) -> Option<u32>;
    /// Non-blocking exit probe. `Ok(None)` while still running.
    fn poll(&mut self) -> Result<Option<SessionExit>>;
    /// Terminate the session.
    fn kill(&mut self) -> Result<()>;
}

/// Spawns worker sessions.
pub trait WorkerLauncher {
    fn launch(&self, request: &WorkerLaunchRequest) -> Result<Box<dyn WorkerSession>>;
}

/// Production launcher: re-invokes this binary's `worker` subcommand as a
/// detached subprocess logging to the agent directory.
pub struct ProcessWorkerLauncher;

impl WorkerLauncher for ProcessWorkerLauncher {
    #[instrument(skip_all, fields(agent_id = %request.agent_id))]
    fn launch(&self, request: &WorkerLaunchRequest) -> Result<Box<dyn WorkerSession>> {
        let exe = std::env::current_exe().context("locate coordinator binary")?;
        let mut cmd = Command::new(exe);
        cmd.arg("worker")
            .arg("--project-dir")
            .arg(&request.project_dir)
            .arg("--agent-id")
            .arg(&request.agent_id)
            .arg("--worktree")
            .arg(&request.worktree_path)
            .arg("--provider")
            .arg(request.provider.as_str())
            .arg("--heartbeat-seconds")
            .arg(request.heartbeat_seconds.to_string());
        if let Some(feature_id) = request.feature_id {
            cmd.arg("--feature-id").arg(feature_id.to_string());
        }

        let child = spawn_supervised(cmd, &request.log_path)?;
        Ok(Box::new(ProcessSession { child }))
    }
}

struct ProcessSession {
    child: Child,
}

impl WorkerSession for ProcessSession {
    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn poll(&mut self) -> Result<Option<SessionExit>> {
        match self.child.try_wait().context("poll worker process")? {
            Some(status) => Ok(Some(SessionExit {
                success: status.success(),
            })),
            None => Ok(None),
        }
    }

    fn kill(&mut self) -> Result<()> {
        self.child.kill().context("kill worker process")?;
        self.child.wait().context("wait worker process")?;
        Ok(())
    }
}

/// Supervisor for one worker session, owning its lock and status bookkeeping.
pub struct AgentProcessManager {
    agent_id: String,
    db: Database,
    lock: LockFile,
    status: AgentRunStatus,
    session: Option<Box<dyn WorkerSession>>,
}

impl AgentProcessManager {
    pub fn new(project_dir: &std::path::Path, agent_id: &str, db: Database) -> Self {
        let paths = ProjectPaths::new(project_dir);
        Self {
            agent_id: agent_id.to_string(),
            db,
            lock: LockFile::new(paths.agent_lock_path(agent_id)),
            status: AgentRunStatus::Stopped,
            session: None,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn status(&self) -> AgentRunStatus {
        self.status
    }

    pub fn lock(&self) -> &LockFile {
        &self.lock
    }

    /// Launch the worker and acquire its lock.
    ///
    /// Returns `Ok(false)` without side effects when the session is already
    /// active, and kills the fresh spawn when the lock is contended (another
    /// process owns this agent identity).
    #[instrument(skip_all, fields(agent_id = %self.agent_id))]
    pub fn start(
        &mut self,
        launcher: &dyn WorkerLauncher,
        request: &WorkerLaunchRequest,
    ) -> Result<bool> {
        if self.status.is_active() {
            debug!("session already active, refusing start");
            return Ok(false);
        }

        let mut session = launcher.launch(request)?;
        let pid = session.pid().unwrap_or_else(current_pid);

        if !self.lock.create(pid)? {
            warn!("agent lock contended, killing fresh spawn");
            if let Err(err) = session.kill() {
                warn!(err = %err, "failed to kill contended spawn");
            }
            return Ok(false);
        }

        self.db.register_agent(&self.agent_id, Some(pid))?;
        self.status = AgentRunStatus::Running;
        self.session = Some(session);
        info!(pid, "worker session started");
        Ok(true)
    }

    /// Reconcile recorded status against OS reality.
    ///
    /// A session recorded as running whose backing process has exited
    /// transitions to `crashed` (non-zero or unknown exit) or `stopped`
    /// (clean exit); the lock is always released once death is detected,
    /// never left dangling.
    #[instrument(skip_all, fields(agent_id = %self.agent_id))]
    pub fn healthcheck(&mut self) -> Result<AgentRunStatus> {
        if self.status != AgentRunStatus::Running {
            return Ok(self.status);
        }

        let next = match &mut self.session {
            Some(session) => session.poll()?.map(|exit| {
                if exit.success {
                    AgentRunStatus::Stopped
                } else {
                    AgentRunStatus::Crashed
                }
            }),
            // No in-process handle (e.g. after a daemon restart): trust the
            // lock's pid + start-time probe. An exit code is not recoverable
            // here, so death reads as a crash.
            None => (self.lock.check()? == LockCheck::Available).then_some(AgentRunStatus::Crashed),
        };

        if let Some(next) = next {
            info!(status = next.as_db_str(), "worker exited");
            self.transition_dead(next);
        }
        Ok(self.status)
    }

    /// Age of the session's last heartbeat, in seconds.
    pub fn heartbeat_age_secs(&self) -> Result<Option<i64>> {
        Ok(self
            .db
            .get_agent(&self.agent_id)?
            .and_then(|session| session.heartbeat_age_secs(Utc::now())))
    }

    /// Terminate the session and release its lock.
    #[instrument(skip_all, fields(agent_id = %self.agent_id))]
    pub fn stop(&mut self) -> Result<()> {
        if let Some(session) = &mut self.session
            && let Err(err) = session.kill()
        {
            warn!(err = %err, "failed to kill worker session");
        }
        self.transition_dead(AgentRunStatus::Stopped);
        Ok(())
    }

    fn transition_dead(&mut self, next: AgentRunStatus) {
        self.status = next;
        self.session = None;
        // The agent row may predate this manager (daemon restart); status
        // sync is best-effort bookkeeping, the lock removal is not.
        if let Err(err) = self.db.set_agent_status(&self.agent_id, next) {
            debug!(err = %err, "agent row status sync skipped");
        }
        self.lock.release();
    }
}
