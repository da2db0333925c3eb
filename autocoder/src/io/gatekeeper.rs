//! Merge-eligibility gate over a checkout's working tree.

use std::path::Path;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument};

use crate::core::dirty::{DirtyContext, GitDirtyStatus, split_dirty};
use crate::io::git::Git;

/// Classify a checkout's working-tree drift into ignorable runtime noise and
/// real changes. Used both for per-worktree merge eligibility and for the
/// orchestrator's trunk fan-out gate.
#[instrument(skip_all, fields(dir = %checkout_dir.display()))]
pub fn dirty_status(checkout_dir: &Path) -> Result<GitDirtyStatus> {
    let lines = Git::new(checkout_dir).status_porcelain_lines()?;
    let ctx = DirtyContext {
        has_prompt_spec: checkout_dir.join("prompts").join("app_spec.txt").is_file(),
    };
    let status = split_dirty(&lines, &ctx);
    debug!(
        ignored = status.ignored.len(),
        remaining = status.remaining.len(),
        "dirty status classified"
    );
    Ok(status)
}

/// Error when real (non-ignorable) changes are present, listing them so they
/// can be surfaced for manual resolution rather than silently merged.
pub fn require_clean(checkout_dir: &Path) -> Result<()> {
    let status = dirty_status(checkout_dir)?;
    if status.is_clean() {
        return Ok(());
    }
    let mut msg = String::from("working tree not clean (disallowed changes):\n");
    for line in &status.remaining {
        msg.push_str(line);
        msg.push('\n');
    }
    Err(anyhow!(msg.trim_end().to_string()))
}
