//! Canonical filesystem layout for coordinator state within a project.

use std::path::{Path, PathBuf};

/// All coordinator-owned paths for a project root.
///
/// The feature database lives at the project root (next to the code the
/// agents work on) so that worker processes in linked worktrees share it;
/// everything else lives under `.autocoder/`.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub daemon_lock_path: PathBuf,
    pub run_lock_path: PathBuf,
    pub locks_dir: PathBuf,
    pub agents_dir: PathBuf,
    pub worktrees_dir: PathBuf,
    pub regressions_dir: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(".autocoder");
        Self {
            db_path: root.join("agent_system.db"),
            config_path: state_dir.join("config.toml"),
            daemon_lock_path: state_dir.join("daemon.lock"),
            run_lock_path: state_dir.join("run.lock"),
            locks_dir: state_dir.join("locks"),
            agents_dir: state_dir.join("agents"),
            worktrees_dir: root.join("worktrees"),
            regressions_dir: state_dir.join("regressions"),
            state_dir,
            root,
        }
    }

    /// Directory holding one worker's logs and result file.
    pub fn agent_dir(&self, agent_id: &str) -> PathBuf {
        self.agents_dir.join(agent_id)
    }

    /// Lock file for one worker session.
    pub fn agent_lock_path(&self, agent_id: &str) -> PathBuf {
        self.locks_dir.join(format!("{agent_id}.lock"))
    }

    /// Worktree checkout directory for one worker session.
    pub fn worktree_path(&self, agent_id: &str) -> PathBuf {
        self.worktrees_dir.join(agent_id)
    }

    /// Plan artifact path inside a worktree (or the main checkout).
    pub fn feature_plan_path(worktree: &Path) -> PathBuf {
        worktree.join(".autocoder").join("feature_plan.md")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_rooted_under_project() {
        let paths = ProjectPaths::new("/tmp/proj");
        assert_eq!(paths.db_path, PathBuf::from("/tmp/proj/agent_system.db"));
        assert_eq!(
            paths.agent_lock_path("agent-1"),
            PathBuf::from("/tmp/proj/.autocoder/locks/agent-1.lock")
        );
        assert_eq!(
            paths.worktree_path("agent-1"),
            PathBuf::from("/tmp/proj/worktrees/agent-1")
        );
    }
}
