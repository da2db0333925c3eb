//! Side-effecting operations: git, worktrees, locks, processes, patches.

pub mod gatekeeper;
pub mod git;
pub mod lock;
pub mod patch;
pub mod process;
pub mod worktree;
