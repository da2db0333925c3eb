//! Agent-session rows: one row per worker subprocess lifetime.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Row, params};
use tracing::debug;

use super::{Database, now_rfc3339};
use crate::core::types::AgentRunStatus;

/// Persisted view of one worker session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSession {
    pub id: String,
    pub status: AgentRunStatus,
    pub pid: Option<u32>,
    pub started_at: String,
    pub last_heartbeat: Option<String>,
    pub completed_at: Option<String>,
}

impl AgentSession {
    /// Seconds since the last heartbeat, if one was ever recorded and parses.
    pub fn heartbeat_age_secs(&self, now: DateTime<Utc>) -> Option<i64> {
        let raw = self.last_heartbeat.as_deref()?;
        let parsed = DateTime::parse_from_rfc3339(raw).ok()?;
        Some((now - parsed.with_timezone(&Utc)).num_seconds())
    }
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<AgentSession> {
    let status_raw: String = row.get("status")?;
    let status = AgentRunStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown agent status: '{status_raw}'").into(),
        )
    })?;
    Ok(AgentSession {
        id: row.get("id")?,
        status,
        pid: row.get::<_, Option<i64>>("pid")?.map(|pid| pid as u32),
        started_at: row.get("started_at")?,
        last_heartbeat: row.get("last_heartbeat")?,
        completed_at: row.get("completed_at")?,
    })
}

impl Database {
    /// Register (or re-register) a worker session as running.
    pub fn register_agent(&self, agent_id: &str, pid: Option<u32>) -> Result<()> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO agents (id, status, pid, started_at, last_heartbeat)
             VALUES (?1, 'running', ?2, ?3, ?3)
             ON CONFLICT(id) DO UPDATE SET
                 status = 'running', pid = ?2, started_at = ?3,
                 last_heartbeat = ?3, completed_at = NULL",
            params![agent_id, pid.map(|p| p as i64), now],
        )
        .context("register agent")?;
        debug!(agent_id, ?pid, "agent registered");
        Ok(())
    }

    /// Record a heartbeat. Callers treat failures as best-effort.
    pub fn update_heartbeat(&self, agent_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE agents SET last_heartbeat = ?1 WHERE id = ?2",
            params![now_rfc3339(), agent_id],
        )
        .context("update heartbeat")?;
        Ok(())
    }

    pub fn set_agent_status(&self, agent_id: &str, status: AgentRunStatus) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE agents SET status = ?1 WHERE id = ?2",
                params![status.as_db_str(), agent_id],
            )
            .context("update agent status")?;
        if updated == 0 {
            return Err(anyhow!("unknown agent '{agent_id}'"));
        }
        Ok(())
    }

    /// Terminal bookkeeping for a finished session.
    pub fn mark_agent_completed(&self, agent_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE agents SET status = 'completed', completed_at = ?1 WHERE id = ?2",
            params![now_rfc3339(), agent_id],
        )
        .context("mark agent completed")?;
        Ok(())
    }

    pub fn get_agent(&self, agent_id: &str) -> Result<Option<AgentSession>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, status, pid, started_at, last_heartbeat, completed_at
                 FROM agents WHERE id = ?1",
            )
            .context("prepare agent select")?;
        let mut rows = stmt
            .query_map(params![agent_id], session_from_row)
            .context("query agent")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("read agent row")?)),
            None => Ok(None),
        }
    }
}
