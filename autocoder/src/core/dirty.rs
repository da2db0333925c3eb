//! Working-tree dirt classification for merge gating.
//!
//! Partitions `git status --porcelain` lines into runtime noise the
//! coordinator is allowed to ignore and real changes that must block a
//! deterministic merge. Shared by the Gatekeeper (per-worktree merge
//! eligibility) and the orchestrator's trunk fan-out gate.

/// Substrings ignored at any status: coordinator state, worker scratch
/// checkouts, and the shared database with its WAL/SHM siblings.
const IGNORE_ANY_STATUS_SUBSTRINGS: &[&str] = &[
    ".autocoder/",
    "worktrees/",
    "agent_system.db",
    "assistant.db",
    ".progress_cache",
    ".eslintrc.json",
];

/// Untracked-only path substrings: browser-automation screenshot caches.
const IGNORE_UNTRACKED_SUBSTRINGS: &[&str] = &[".playwright-mcp/"];

/// Untracked-only exact filenames: known agent-CLI leftovers at repo root.
const IGNORE_UNTRACKED_FILENAMES: &[&str] = &[".claude_settings.json", "claude-progress.txt"];

/// Untracked-only filename suffixes (stale pid files).
const IGNORE_UNTRACKED_SUFFIXES: &[&str] = &[".pid"];

/// Facts about the project the classification needs but cannot observe
/// itself (keeps this module free of I/O).
#[derive(Debug, Clone, Copy, Default)]
pub struct DirtyContext {
    /// True when `prompts/app_spec.txt` exists, i.e. the real spec lives in
    /// the scaffold directory and a stray root-level copy is redundant.
    pub has_prompt_spec: bool,
}

/// Result of classifying a status listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitDirtyStatus {
    pub ignored: Vec<String>,
    pub remaining: Vec<String>,
}

impl GitDirtyStatus {
    /// Merge-eligible: nothing but runtime noise in the tree.
    pub fn is_clean(&self) -> bool {
        self.remaining.is_empty()
    }
}

/// Split porcelain status lines into (ignored, remaining).
pub fn split_dirty(lines: &[String], ctx: &DirtyContext) -> GitDirtyStatus {
    let mut ignored = Vec::new();
    let mut remaining = Vec::new();

    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        if is_ignorable(line, ctx) {
            ignored.push(line.clone());
        } else {
            remaining.push(line.clone());
        }
    }

    GitDirtyStatus { ignored, remaining }
}

fn is_ignorable(line: &str, ctx: &DirtyContext) -> bool {
    let target = line.replace('\\', "/");
    let status: String = line.chars().take(2).collect();
    let path_part = if line.len() > 3 { &line[3..] } else { "" };
    // Renames are reported as "R  old -> new"; classify the new path.
    let rel = match path_part.split_once("->") {
        Some((_, new)) => new.trim(),
        None => path_part.trim(),
    }
    .replace('\\', "/");
    let filename = rel.rsplit('/').next().unwrap_or("");

    if IGNORE_ANY_STATUS_SUBSTRINGS
        .iter()
        .any(|s| target.contains(s))
    {
        return true;
    }

    if status == "??" {
        if IGNORE_UNTRACKED_SUBSTRINGS.iter().any(|s| rel.contains(s)) {
            return true;
        }
        if IGNORE_UNTRACKED_FILENAMES.contains(&filename) {
            return true;
        }
        if IGNORE_UNTRACKED_SUFFIXES
            .iter()
            .any(|suffix| filename.ends_with(suffix))
        {
            return true;
        }

        // Agent CLIs sometimes drop a redundant root-level app_spec.txt even
        // when prompts/app_spec.txt is the real spec.
        if filename == "app_spec.txt" && rel == "app_spec.txt" && ctx.has_prompt_spec {
            return true;
        }

        // Prompt scaffolding left untracked in the target project.
        if rel == "prompts/" || rel == "prompts" {
            return true;
        }
        if let Some(name) = rel.strip_prefix("prompts/")
            && (name == "app_spec.txt" || name.ends_with("_prompt.txt"))
        {
            return true;
        }
    }

    false
}
