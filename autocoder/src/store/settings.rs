//! Small JSON key/value settings store, shared with the scheduler for
//! restart-safe persistence.

use anyhow::{Context, Result};
use rusqlite::params;
use serde_json::Value;

use super::{Database, now_rfc3339};

impl Database {
    pub fn get_setting_json(&self, key: &str) -> Result<Option<Value>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("query setting")?;
        match raw {
            Some(raw) => {
                let value =
                    serde_json::from_str(&raw).with_context(|| format!("parse setting '{key}'"))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub fn set_setting_json(&self, key: &str, value: &Value) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            params![key, serde_json::to_string(value)?, now_rfc3339()],
        )
        .context("write setting")?;
        Ok(())
    }
}
