//! Per-worker worktree provisioning and teardown.
//!
//! Each dispatched feature gets one isolated checkout plus branch, owned
//! exclusively by its worker for the feature's IN_PROGRESS lifetime.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::io::git::Git;
use crate::paths::ProjectPaths;

/// Handle to one provisioned worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worktree {
    pub agent_id: String,
    pub path: PathBuf,
    pub branch: String,
}

/// Branch name for one worker session.
pub fn branch_for(agent_id: &str) -> String {
    format!("agent/{agent_id}")
}

/// Create the worktree and branch for a worker session at current trunk HEAD.
///
/// Fails when the branch or checkout already exists: worktrees are owned
/// exclusively and never shared or recycled across sessions.
#[instrument(skip_all, fields(agent_id))]
pub fn provision(project_dir: &Path, agent_id: &str) -> Result<Worktree> {
    let paths = ProjectPaths::new(project_dir);
    let git = Git::new(project_dir);
    let branch = branch_for(agent_id);
    let path = paths.worktree_path(agent_id);

    if path.exists() {
        return Err(anyhow!(
            "worktree path already exists: {} (previous session not torn down?)",
            path.display()
        ));
    }
    if git.branch_exists(&branch)? {
        return Err(anyhow!("branch '{branch}' already exists"));
    }

    fs::create_dir_all(&paths.worktrees_dir).with_context(|| {
        format!("create worktrees dir {}", paths.worktrees_dir.display())
    })?;
    git.worktree_add(&path, &branch)?;
    info!(path = %path.display(), branch, "worktree provisioned");

    Ok(Worktree {
        agent_id: agent_id.to_string(),
        path,
        branch,
    })
}

/// Remove a session's worktree, deleting its branch unless it is preserved
/// for forensic inspection.
///
/// Teardown is best-effort cleanup at the end of a session: individual git
/// failures are logged and do not propagate.
#[instrument(skip_all, fields(agent_id = %worktree.agent_id, preserve_branch))]
pub fn teardown(project_dir: &Path, worktree: &Worktree, preserve_branch: bool) {
    let git = Git::new(project_dir);

    if worktree.path.exists()
        && let Err(err) = git.worktree_remove(&worktree.path, true)
    {
        warn!(err = %err, "failed to remove worktree checkout");
    }
    if let Err(err) = git.worktree_prune() {
        warn!(err = %err, "failed to prune worktrees");
    }
    if !preserve_branch {
        match git.branch_exists(&worktree.branch) {
            Ok(true) => {
                if let Err(err) = git.delete_branch(&worktree.branch) {
                    warn!(err = %err, branch = %worktree.branch, "failed to delete branch");
                }
            }
            Ok(false) => {}
            Err(err) => warn!(err = %err, "failed to check branch existence"),
        }
    } else {
        info!(branch = %worktree.branch, "branch preserved for inspection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn provision_creates_isolated_checkout_and_branch() {
        let repo = TestRepo::new().expect("repo");
        let worktree = provision(repo.path(), "agent-1").expect("provision");

        assert!(worktree.path.join("README.md").exists());
        assert_eq!(worktree.branch, "agent/agent-1");
        assert!(
            Git::new(repo.path())
                .branch_exists("agent/agent-1")
                .expect("exists")
        );

        // Exclusive ownership: a second provision for the same id fails.
        assert!(provision(repo.path(), "agent-1").is_err());
    }

    #[test]
    fn teardown_removes_checkout_and_branch() {
        let repo = TestRepo::new().expect("repo");
        let worktree = provision(repo.path(), "agent-1").expect("provision");

        teardown(repo.path(), &worktree, false);
        assert!(!worktree.path.exists());
        assert!(
            !Git::new(repo.path())
                .branch_exists("agent/agent-1")
                .expect("exists")
        );
    }

    #[test]
    fn teardown_preserves_branch_on_request() {
        let repo = TestRepo::new().expect("repo");
        let worktree = provision(repo.path(), "agent-1").expect("provision");

        teardown(repo.path(), &worktree, true);
        assert!(!worktree.path.exists());
        assert!(
            Git::new(repo.path())
                .branch_exists("agent/agent-1")
                .expect("exists")
        );
    }
}
