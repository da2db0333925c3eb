//! Patch ingestion: normalize raw worker output and apply it to a checkout.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument};

use crate::core::patch::normalize_patch;
use crate::io::git::Git;

/// Validate and apply raw worker output as a unified diff against `repo`.
///
/// Rejections are synchronous and named (unsupported format, no diff
/// marker); application failures carry git's description (non-applicable
/// hunk, ambiguous context). The normalized diff is kept at
/// `.autocoder/last_patch.diff` as a forensic artifact either way.
#[instrument(skip_all, fields(repo = %repo.display()))]
pub fn apply_patch(repo: &Path, raw: &str) -> Result<()> {
    let patch = normalize_patch(raw).map_err(|reason| anyhow!(reason))?;

    let patch_dir = repo.join(".autocoder");
    fs::create_dir_all(&patch_dir)
        .with_context(|| format!("create directory {}", patch_dir.display()))?;
    let patch_file = patch_dir.join("last_patch.diff");
    fs::write(&patch_file, &patch)
        .with_context(|| format!("write patch file {}", patch_file.display()))?;

    Git::new(repo).apply_patch_file(&patch_file)?;
    info!(bytes = patch.len(), "patch applied");
    Ok(())
}
