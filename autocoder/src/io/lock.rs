//! File-based mutual exclusion bound to one live OS process.
//!
//! The token stores `pid:process_start_time`. Comparing the recorded start
//! time against what the kernel reports for that pid today defeats pid-reuse
//! races: a different process that happens to reuse the pid is correctly
//! treated as "not the same process" and the stale lock is deleted.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::io::process::{pid_alive, pid_start_time};

/// Result of validating an existing lock file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockCheck {
    /// A live process holds the lock.
    Blocked,
    /// No valid lock exists (stale files have been deleted).
    Available,
}

/// One lock file, owned by at most one live process.
#[derive(Debug, Clone)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically create the lock for `pid`.
    ///
    /// Only the first caller wins: if a valid lock already exists, this
    /// returns `Ok(false)` rather than overwriting. A stale lock is cleared
    /// and creation retried once.
    #[instrument(skip_all, fields(path = %self.path.display(), pid))]
    pub fn create(&self, pid: u32) -> Result<bool> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create lock dir {}", parent.display()))?;
        }
        let token = format!("{pid}:{}", pid_start_time(pid).unwrap_or(0));

        for _ in 0..2 {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(mut file) => {
                    use std::io::Write;
                    file.write_all(token.as_bytes())
                        .with_context(|| format!("write lock {}", self.path.display()))?;
                    debug!("lock created");
                    return Ok(true);
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if self.check()? == LockCheck::Blocked {
                        debug!("lock held by a live process");
                        return Ok(false);
                    }
                    // Stale lock was cleared; retry the exclusive create.
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("create lock {}", self.path.display()));
                }
            }
        }
        Ok(false)
    }

    /// Validate an existing lock against the live process table.
    ///
    /// Stale or malformed lock files are deleted as a side effect; a lock is
    /// never left dangling once its process is known dead.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn check(&self) -> Result<LockCheck> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(LockCheck::Available),
            Err(err) => {
                return Err(err).with_context(|| format!("read lock {}", self.path.display()));
            }
        };

        if let Some((pid, recorded_start)) = parse_token(&contents)
            && pid_alive(pid)
            && pid_start_time(pid) == Some(recorded_start)
        {
            return Ok(LockCheck::Blocked);
        }

        warn!("clearing stale lock");
        self.release();
        Ok(LockCheck::Available)
    }

    /// Best-effort removal; missing files are fine.
    pub fn release(&self) {
        if let Err(err) = fs::remove_file(&self.path)
            && err.kind() != ErrorKind::NotFound
        {
            warn!(err = %err, path = %self.path.display(), "failed to remove lock");
        }
    }
}

fn parse_token(contents: &str) -> Option<(u32, u64)> {
    let (pid_raw, start_raw) = contents.trim().split_once(':')?;
    // Older writers recorded fractional start times; take the integer part.
    let start = start_raw.split('.').next()?;
    Some((pid_raw.parse().ok()?, start.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::process::current_pid;

    fn lock_in(dir: &Path) -> LockFile {
        LockFile::new(dir.join("agent.lock"))
    }

    #[test]
    fn lock_blocks_when_pid_and_start_time_match() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lock = lock_in(temp.path());
        let pid = current_pid();
        let start = pid_start_time(pid).expect("start time");
        fs::write(lock.path(), format!("{pid}:{start}")).expect("write");

        assert_eq!(lock.check().expect("check"), LockCheck::Blocked);
        assert!(lock.path().exists());
    }

    #[test]
    fn lock_clears_when_start_time_mismatches() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lock = lock_in(temp.path());
        let pid = current_pid();
        let start = pid_start_time(pid).expect("start time");
        fs::write(lock.path(), format!("{pid}:{}", start.saturating_sub(10_000))).expect("write");

        assert_eq!(lock.check().expect("check"), LockCheck::Available);
        assert!(!lock.path().exists());
    }

    #[test]
    fn lock_clears_for_dead_pid_and_malformed_tokens() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lock = lock_in(temp.path());

        fs::write(lock.path(), "999999999:0").expect("write");
        assert_eq!(lock.check().expect("check"), LockCheck::Available);
        assert!(!lock.path().exists());

        fs::write(lock.path(), "not-a-lock").expect("write");
        assert_eq!(lock.check().expect("check"), LockCheck::Available);
        assert!(!lock.path().exists());
    }

    #[test]
    fn create_is_exclusive() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lock = lock_in(temp.path());
        let pid = current_pid();

        assert!(lock.create(pid).expect("first create"));
        let contents = fs::read_to_string(lock.path()).expect("read");
        assert!(contents.starts_with(&format!("{pid}:")));
        assert!(!lock.create(pid).expect("second create"));
    }

    #[test]
    fn create_reclaims_a_stale_lock() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lock = lock_in(temp.path());
        fs::write(lock.path(), "999999999:0").expect("write stale");

        assert!(lock.create(current_pid()).expect("create over stale"));
        assert_eq!(lock.check().expect("check"), LockCheck::Blocked);
    }

    #[test]
    fn missing_lock_is_available() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lock = lock_in(temp.path());
        assert_eq!(lock.check().expect("check"), LockCheck::Available);
    }
}
