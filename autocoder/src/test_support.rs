//! Test-only helpers: scratch git repos, scripted worker sessions, and
//! scripted providers. Compiled under `cfg(test)` or the `test-support`
//! feature.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::types::WorkerOutcome;
use crate::io::git::Git;
use crate::io::process::current_pid;
use crate::paths::ProjectPaths;
use crate::process_manager::{SessionExit, WorkerLaunchRequest, WorkerLauncher, WorkerSession};
use crate::providers::{ProviderRequest, WorkerProvider};
use crate::store::Database;

/// Open a fresh database in a temp directory.
pub fn open_test_db() -> (TempDir, Database) {
    let temp = TempDir::new().expect("tempdir");
    let db = Database::open(&temp.path().join("agent_system.db")).expect("open database");
    (temp, db)
}

/// A scratch git repository with one initial commit and an open database,
/// acting as the coordinated project.
pub struct TestRepo {
    temp: TempDir,
    db: Database,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = TempDir::new().context("create tempdir")?;
        let root = temp.path();

        run_git(root, &["init", "-q", "-b", "main"])?;
        run_git(root, &["config", "user.email", "test@example.com"])?;
        run_git(root, &["config", "user.name", "Test"])?;

        fs::write(root.join("README.md"), "# Test Repo\n").context("write README")?;
        run_git(root, &["add", "-A"])?;
        run_git(root, &["commit", "-q", "-m", "initial commit"])?;

        let db = Database::open(&ProjectPaths::new(root).db_path)?;
        Ok(Self { temp, db })
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn db(&self) -> Database {
        self.db.clone()
    }

    pub fn git(&self) -> Git {
        Git::new(self.path())
    }

    /// Write a file and commit it on the current branch.
    pub fn write_and_commit(&self, rel_path: &str, contents: &str) -> Result<()> {
        let path = self.path().join(rel_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("create parent dir")?;
        }
        fs::write(&path, contents).with_context(|| format!("write {rel_path}"))?;
        run_git(self.path(), &["add", "-A"])?;
        run_git(self.path(), &["commit", "-q", "-m", &format!("add {rel_path}")])?;
        Ok(())
    }
}

/// Stage and commit everything in a directory (worktree hooks in tests).
pub fn commit_all(dir: &Path, message: &str) -> Result<()> {
    run_git(dir, &["add", "-A"])?;
    run_git(dir, &["commit", "-q", "-m", message])?;
    Ok(())
}

fn run_git(dir: &Path, args: &[&str]) -> Result<()> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        return Err(anyhow!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(())
}

/// Default launch request for a repo-backed agent.
pub fn launch_request(repo: &TestRepo, agent_id: &str) -> WorkerLaunchRequest {
    let paths = ProjectPaths::new(repo.path());
    WorkerLaunchRequest {
        project_dir: repo.path().to_path_buf(),
        agent_id: agent_id.to_string(),
        worktree_path: paths.worktree_path(agent_id),
        feature_id: None,
        provider: crate::core::types::ProviderKind::Claude,
        heartbeat_seconds: 60,
        log_path: paths.agent_dir(agent_id).join("worker.log"),
    }
}

type LaunchHook = Box<dyn Fn(&WorkerLaunchRequest) -> Result<()> + Send + Sync>;

/// One scripted session: how it behaves after launch.
pub struct ScriptedSessionPlan {
    /// `Some(success)` exits on the first poll; `None` runs until killed.
    pub exit: Option<bool>,
    /// Result file written to the agent directory at launch time.
    pub outcome: Option<WorkerOutcome>,
    /// Arbitrary work performed at launch (e.g. committing in the worktree).
    pub on_launch: Option<LaunchHook>,
}

impl ScriptedSessionPlan {
    pub fn run_forever() -> Self {
        Self {
            exit: None,
            outcome: None,
            on_launch: None,
        }
    }

    pub fn exit_success() -> Self {
        Self {
            exit: Some(true),
            outcome: None,
            on_launch: None,
        }
    }

    pub fn exit_failure() -> Self {
        Self {
            exit: Some(false),
            outcome: None,
            on_launch: None,
        }
    }

    pub fn with_outcome(mut self, outcome: WorkerOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn with_hook(
        mut self,
        hook: impl Fn(&WorkerLaunchRequest) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_launch = Some(Box::new(hook));
        self
    }
}

#[derive(Default)]
struct SessionState {
    killed: AtomicBool,
}

/// Launcher that hands out scripted sessions in order.
pub struct ScriptedLauncher {
    plans: Mutex<VecDeque<ScriptedSessionPlan>>,
    sessions: Mutex<Vec<Arc<SessionState>>>,
}

impl ScriptedLauncher {
    pub fn new(plans: Vec<ScriptedSessionPlan>) -> Self {
        Self {
            plans: Mutex::new(plans.into_iter().collect()),
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// True when the nth launched session was killed.
    pub fn killed(&self, index: usize) -> bool {
        self.sessions
            .lock()
            .expect("sessions lock")
            .get(index)
            .is_some_and(|state| state.killed.load(Ordering::SeqCst))
    }

    pub fn launched(&self) -> usize {
        self.sessions.lock().expect("sessions lock").len()
    }
}

impl WorkerLauncher for ScriptedLauncher {
    fn launch(&self, request: &WorkerLaunchRequest) -> Result<Box<dyn WorkerSession>> {
        let plan = self
            .plans
            .lock()
            .expect("plans lock")
            .pop_front()
            .ok_or_else(|| anyhow!("scripted launcher exhausted"))?;

        if let Some(outcome) = &plan.outcome {
            let agent_dir = ProjectPaths::new(&request.project_dir).agent_dir(&request.agent_id);
            fs::create_dir_all(&agent_dir).context("create agent dir")?;
            let mut buf = serde_json::to_string_pretty(outcome)?;
            buf.push('\n');
            fs::write(agent_dir.join("result.json"), buf).context("write scripted result")?;
        }
        if let Some(hook) = &plan.on_launch {
            hook(request)?;
        }

        let state = Arc::new(SessionState::default());
        self.sessions
            .lock()
            .expect("sessions lock")
            .push(state.clone());
        Ok(Box::new(ScriptedSession {
            exit: plan.exit,
            state,
        }))
    }
}

struct ScriptedSession {
    exit: Option<bool>,
    state: Arc<SessionState>,
}

impl WorkerSession for ScriptedSession {
    fn pid(&self) -> Option<u32> {
        Some(current_pid())
    }

    fn poll(&mut self) -> Result<Option<SessionExit>> {
        if self.state.killed.load(Ordering::SeqCst) {
            return Ok(Some(SessionExit { success: false }));
        }
        Ok(self.exit.map(|success| SessionExit { success }))
    }

    fn kill(&mut self) -> Result<()> {
        self.state.killed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Provider returning queued outcomes without spawning processes.
pub struct ScriptedProvider {
    outcomes: Mutex<VecDeque<WorkerOutcome>>,
}

impl ScriptedProvider {
    pub fn new(outcomes: Vec<WorkerOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
        }
    }
}

impl WorkerProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn run(&self, request: &ProviderRequest) -> Result<()> {
        let outcome = self
            .outcomes
            .lock()
            .expect("outcomes lock")
            .pop_front()
            .ok_or_else(|| anyhow!("scripted provider exhausted"))?;
        if let Some(parent) = request.output_path.parent() {
            fs::create_dir_all(parent).context("create output dir")?;
        }
        let mut buf = serde_json::to_string_pretty(&outcome)?;
        buf.push('\n');
        fs::write(&request.output_path, buf).context("write scripted outcome")?;
        Ok(())
    }
}
