//! Coordinator configuration stored under `.autocoder/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::{PlannerMode, ProviderKind};

/// Coordinator configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Maximum number of worker sessions dispatched in parallel.
    /// Zero disables dispatch (useful for inspection-only invocations).
    pub max_agents: u32,

    /// Interval between worker heartbeat writes, in seconds.
    pub heartbeat_seconds: u64,

    /// Per-worker wall-clock budget in seconds.
    pub worker_timeout_secs: u64,

    /// Orchestrator supervision poll interval in milliseconds.
    pub poll_interval_ms: u64,

    /// Truncate worker/provider logs beyond this many bytes.
    pub worker_output_limit_bytes: usize,

    /// Worker provider backend.
    pub provider: ProviderKind,

    pub planner: PlannerConfig,

    pub regression: RegressionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlannerConfig {
    /// Plan-injection policy applied before each dispatch.
    pub mode: PlannerMode,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            mode: PlannerMode::RequiredSmart,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RegressionConfig {
    /// Launch a post-merge verification sweep when enabled.
    pub enabled: bool,

    /// Run a sweep after this many successful merges.
    pub merge_interval: u32,
}

impl Default for RegressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            merge_interval: 5,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_agents: 3,
            heartbeat_seconds: 60,
            worker_timeout_secs: 30 * 60,
            poll_interval_ms: 500,
            worker_output_limit_bytes: 100_000,
            provider: ProviderKind::Claude,
            planner: PlannerConfig::default(),
            regression: RegressionConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_seconds == 0 {
            return Err(anyhow!("heartbeat_seconds must be > 0"));
        }
        if self.worker_timeout_secs == 0 {
            return Err(anyhow!("worker_timeout_secs must be > 0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be > 0"));
        }
        if self.worker_output_limit_bytes == 0 {
            return Err(anyhow!("worker_output_limit_bytes must be > 0"));
        }
        if self.regression.merge_interval == 0 {
            return Err(anyhow!("regression.merge_interval must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `CoordinatorConfig::default()`.
pub fn load_config(path: &Path) -> Result<CoordinatorConfig> {
    if !path.exists() {
        let cfg = CoordinatorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: CoordinatorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &CoordinatorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, CoordinatorConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = CoordinatorConfig {
            max_agents: 5,
            provider: ProviderKind::Codex,
            ..CoordinatorConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn unknown_provider_is_rejected_at_parse() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "provider = \"copilot\"\n").expect("write");
        assert!(load_config(&path).is_err());
    }
}
