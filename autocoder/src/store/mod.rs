//! Persisted task store and agent-session registry (SQLite).
//!
//! One database file per project, shared by the coordination process, worker
//! subprocesses, and CLI invocations. Atomicity across process boundaries
//! rests on SQLite itself: WAL journal mode plus immediate (write-locked)
//! transactions around every selection-and-transition.

mod agents;
mod features;
mod settings;

pub use agents::AgentSession;
pub use features::{
    BlockerGroup, BlockersSummary, Feature, NewFeature, RegressionIssueOutcome,
};

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use tracing::debug;

/// Env var overriding the SQLite journal mode (e.g. `DELETE` for filesystems
/// where WAL misbehaves).
pub const JOURNAL_MODE_ENV: &str = "AUTOCODER_SQLITE_JOURNAL_MODE";

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

pub type DbPool = Pool<SqliteConnectionManager>;

/// Handle to the project database. Cheap to clone; connections are pooled.
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
    path: PathBuf,
}

impl Database {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// The journal mode honors [`JOURNAL_MODE_ENV`] when set.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_journal_override(path, std::env::var(JOURNAL_MODE_ENV).ok().as_deref())
    }

    /// Open with an explicit journal-mode override (what [`Self::open`] reads
    /// from the environment). Invalid overrides fall back to the default
    /// resolution.
    pub fn open_with_journal_override(path: &Path, journal_override: Option<&str>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }

        let journal_mode = resolve_journal_mode(journal_override, is_network_filesystem(path));
        debug!(path = %path.display(), journal_mode, "opening database");

        let mode = journal_mode.to_string();
        let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
            conn.execute_batch(&format!("PRAGMA journal_mode={mode};"))?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            Ok(())
        });
        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .context("create connection pool")?;

        let db = Self {
            pool,
            path: path.to_path_buf(),
        };
        db.init_schema()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().context("get pooled connection")
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS features (
                id                 INTEGER PRIMARY KEY AUTOINCREMENT,
                name               TEXT NOT NULL,
                description        TEXT NOT NULL,
                category           TEXT NOT NULL,
                priority           INTEGER NOT NULL DEFAULT 0,
                status             TEXT NOT NULL DEFAULT 'PENDING',
                assigned_agent_id  TEXT,
                depends_on         TEXT NOT NULL DEFAULT '[]',
                steps              TEXT NOT NULL DEFAULT '[]',
                attempts           INTEGER NOT NULL DEFAULT 0,
                last_error         TEXT,
                failure_kind       TEXT,
                last_artifact_path TEXT,
                regression_of_id   INTEGER,
                preserve_branch    INTEGER NOT NULL DEFAULT 0,
                created_at         TEXT NOT NULL,
                updated_at         TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_features_status ON features(status);
            CREATE INDEX IF NOT EXISTS idx_features_regression_of
                ON features(regression_of_id);

            CREATE TABLE IF NOT EXISTS agents (
                id             TEXT PRIMARY KEY,
                status         TEXT NOT NULL,
                pid            INTEGER,
                started_at     TEXT NOT NULL,
                last_heartbeat TEXT,
                completed_at   TEXT
            );

            CREATE TABLE IF NOT EXISTS settings (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )
        .context("initialize schema")?;
        Ok(())
    }

    /// Current journal mode as reported by SQLite (diagnostics/tests).
    pub fn journal_mode(&self) -> Result<String> {
        let conn = self.conn()?;
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .context("query journal_mode")?;
        Ok(mode)
    }
}

/// Current UTC timestamp in the stored RFC 3339 format.
pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Pick the journal mode: explicit override wins, network filesystems fall
/// back to `DELETE` (WAL requires shared memory on the same host), otherwise
/// WAL.
fn resolve_journal_mode(env_override: Option<&str>, on_network_fs: bool) -> &'static str {
    const ALLOWED: &[&str] = &["DELETE", "TRUNCATE", "PERSIST", "MEMORY", "WAL", "OFF"];
    if let Some(raw) = env_override {
        let upper = raw.trim().to_uppercase();
        if let Some(mode) = ALLOWED.iter().find(|m| **m == upper) {
            return *mode;
        }
        tracing::warn!(value = raw, "ignoring invalid {JOURNAL_MODE_ENV}");
    }
    if on_network_fs { "DELETE" } else { "WAL" }
}

/// Best-effort detection of a network filesystem under `path` via
/// `/proc/mounts`. Errors read as "local".
fn is_network_filesystem(path: &Path) -> bool {
    const NETWORK_FS: &[&str] = &["nfs", "nfs4", "cifs", "smb3", "9p", "fuse.sshfs"];

    let Ok(mounts) = fs::read_to_string("/proc/mounts") else {
        return false;
    };
    let target = path
        .parent()
        .and_then(|p| p.canonicalize().ok())
        .unwrap_or_else(|| path.to_path_buf());

    let mut best: Option<(usize, &str)> = None;
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_dev), Some(mount_point), Some(fs_type)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if target.starts_with(mount_point)
            && best.is_none_or(|(len, _)| mount_point.len() > len)
        {
            best = Some((mount_point.len(), fs_type));
        }
    }
    best.is_some_and(|(_, fs_type)| NETWORK_FS.contains(&fs_type))
}
