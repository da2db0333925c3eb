//! Git adapter for the coordinator.
//!
//! Worktree fan-out and deterministic merges depend on exact git behavior,
//! so we keep a small, explicit wrapper around `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to run)"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Raw `git status --porcelain` lines (including untracked), for the
    /// Gatekeeper's dirt classification.
    pub fn status_porcelain_lines(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&["status", "--porcelain", "-uall"])?;
        Ok(out
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Merge a branch into the current checkout, keeping a merge commit so
    /// worker branches stay visible in history.
    #[instrument(skip_all, fields(branch))]
    pub fn merge_branch(&self, branch: &str, message: &str) -> Result<()> {
        self.run_checked(&["merge", "--no-ff", "-m", message, branch])?;
        Ok(())
    }

    /// Create a linked worktree on a new branch at current HEAD.
    #[instrument(skip_all, fields(branch, path = %path.display()))]
    pub fn worktree_add(&self, path: &Path, branch: &str) -> Result<()> {
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("worktree path is not valid UTF-8: {}", path.display()))?;
        self.run_checked(&["worktree", "add", "-b", branch, path_str])?;
        Ok(())
    }

    /// Remove a linked worktree checkout.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn worktree_remove(&self, path: &Path, force: bool) -> Result<()> {
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("worktree path is not valid UTF-8: {}", path.display()))?;
        if force {
            self.run_checked(&["worktree", "remove", "--force", path_str])?;
        } else {
            self.run_checked(&["worktree", "remove", path_str])?;
        }
        Ok(())
    }

    /// Drop stale worktree registrations.
    pub fn worktree_prune(&self) -> Result<()> {
        self.run_checked(&["worktree", "prune"])?;
        Ok(())
    }

    /// Delete a local branch (even if unmerged).
    #[instrument(skip_all, fields(branch))]
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["branch", "-D", branch])?;
        Ok(())
    }

    /// Apply a unified diff file to the working tree.
    ///
    /// Failure output (non-applicable hunk, ambiguous context) is included in
    /// the error verbatim; callers surface it to the task store.
    #[instrument(skip_all, fields(patch = %patch_file.display()))]
    pub fn apply_patch_file(&self, patch_file: &Path) -> Result<()> {
        let patch_str = patch_file
            .to_str()
            .ok_or_else(|| anyhow!("patch path is not valid UTF-8: {}", patch_file.display()))?;
        self.run_checked(&["apply", "--whitespace=nowarn", patch_str])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;
    use std::fs;

    #[test]
    fn status_lines_include_untracked_files() {
        let repo = TestRepo::new().expect("repo");
        fs::write(repo.path().join("new.txt"), "hi\n").expect("write");

        let lines = Git::new(repo.path()).status_porcelain_lines().expect("status");
        assert!(lines.iter().any(|l| l == "?? new.txt"));
    }

    #[test]
    fn commit_staged_skips_when_nothing_staged() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        assert!(!git.commit_staged("noop").expect("commit"));

        fs::write(repo.path().join("a.txt"), "one\n").expect("write");
        git.add_all().expect("add");
        assert!(git.commit_staged("add a").expect("commit"));
    }

    #[test]
    fn worktree_add_and_remove_round_trip() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        let wt = repo.path().join("worktrees").join("agent-1");

        git.worktree_add(&wt, "agent/agent-1").expect("worktree add");
        assert!(wt.join(".git").exists());
        assert!(git.branch_exists("agent/agent-1").expect("exists"));

        git.worktree_remove(&wt, true).expect("worktree remove");
        git.delete_branch("agent/agent-1").expect("delete branch");
        assert!(!git.branch_exists("agent/agent-1").expect("exists"));
    }
}
