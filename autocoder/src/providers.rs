//! Worker provider abstraction.
//!
//! The [`WorkerProvider`] trait decouples the worker lifecycle from the
//! actual agent backend (claude / codex / gemini CLIs). Exactly one
//! implementation exists per provider, selected by configuration, so nothing
//! upstream ever branches on provider identity. Tests use scripted providers
//! that return predetermined outcomes without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::Draft;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{ProviderKind, WorkerOutcome};
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// JSON Schema every provider outcome must conform to.
pub const OUTCOME_SCHEMA: &str = include_str!("../schemas/worker_outcome.schema.json");

/// Parameters for one provider invocation.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// Working directory for the agent process (the session's worktree).
    pub workdir: PathBuf,
    /// Prompt text to feed to the agent.
    pub prompt: String,
    /// Path to the JSON Schema constraining the outcome.
    pub output_schema_path: PathBuf,
    /// Path where the outcome JSON must end up.
    pub output_path: PathBuf,
    /// Path to write provider stdout/stderr log.
    pub provider_log_path: PathBuf,
    /// Maximum time to wait for the agent to complete.
    pub timeout: Duration,
    /// Truncate provider output logs beyond this many bytes.
    pub output_limit_bytes: usize,
}

/// Abstraction over agent execution backends.
///
/// Contract: run one agent session against the request's worktree and leave
/// an outcome JSON at `request.output_path`.
pub trait WorkerProvider {
    fn name(&self) -> &'static str;
    fn run(&self, request: &ProviderRequest) -> Result<()>;
}

/// Select the provider implementation for a configured kind.
pub fn provider_for(kind: ProviderKind) -> Box<dyn WorkerProvider> {
    match kind {
        ProviderKind::Claude => Box::new(ClaudeProvider),
        ProviderKind::Codex => Box::new(CodexProvider),
        ProviderKind::Gemini => Box::new(GeminiProvider),
    }
}

/// Provider that spawns `codex exec`; the CLI writes the outcome itself via
/// `--output-last-message`.
pub struct CodexProvider;

impl WorkerProvider for CodexProvider {
    fn name(&self) -> &'static str {
        "codex"
    }

    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &ProviderRequest) -> Result<()> {
        info!(workdir = %request.workdir.display(), "starting codex exec");

        let mut cmd = Command::new("codex");
        cmd.arg("exec")
            .arg("-c")
            .arg("model_reasoning_effort=medium")
            .arg("--sandbox")
            .arg("danger-full-access")
            // Worktrees are linked checkouts; skip the repo-root heuristics.
            .arg("--skip-git-repo-check")
            .arg("--output-schema")
            .arg(&request.output_schema_path)
            .arg("--output-last-message")
            .arg(&request.output_path)
            .arg("-")
            .current_dir(&request.workdir);

        run_and_log(self.name(), cmd, request)
    }
}

/// Provider that spawns the `claude` CLI in non-interactive mode. The prompt
/// instructs the agent to write the outcome file itself.
pub struct ClaudeProvider;

impl WorkerProvider for ClaudeProvider {
    fn name(&self) -> &'static str {
        "claude"
    }

    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &ProviderRequest) -> Result<()> {
        info!(workdir = %request.workdir.display(), "starting claude session");

        let mut cmd = Command::new("claude");
        cmd.arg("-p")
            .arg("--output-format")
            .arg("text")
            .arg("--dangerously-skip-permissions")
            .current_dir(&request.workdir);

        run_and_log(self.name(), cmd, request)
    }
}

/// Provider that spawns the `gemini` CLI in autonomous mode. The prompt
/// instructs the agent to write the outcome file itself.
pub struct GeminiProvider;

impl WorkerProvider for GeminiProvider {
    fn name(&self) -> &'static str {
        "gemini"
    }

    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &ProviderRequest) -> Result<()> {
        info!(workdir = %request.workdir.display(), "starting gemini session");

        let mut cmd = Command::new("gemini");
        cmd.arg("--yolo").current_dir(&request.workdir);

        run_and_log(self.name(), cmd, request)
    }
}

fn run_and_log(name: &str, cmd: Command, request: &ProviderRequest) -> Result<()> {
    write_outcome_schema(&request.output_schema_path)?;
    if let Some(parent) = request.output_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create output dir {}", parent.display()))?;
    }

    let output = run_command_with_timeout(
        cmd,
        Some(request.prompt.as_bytes()),
        request.timeout,
        request.output_limit_bytes,
    )
    .with_context(|| format!("run {name} agent"))?;

    write_provider_log(&request.provider_log_path, &output, request.output_limit_bytes)?;

    if output.timed_out {
        warn!(timeout_secs = request.timeout.as_secs(), "{name} timed out");
        return Err(anyhow!("{name} timed out after {:?}", request.timeout));
    }
    if !output.status.success() {
        warn!(exit_code = ?output.status.code(), "{name} failed");
        return Err(anyhow!(
            "{name} failed with status {:?}",
            output.status.code()
        ));
    }

    debug!("{name} completed successfully");
    Ok(())
}

/// Run the provider and load its schema-validated outcome.
#[instrument(skip_all, fields(output_path = %request.output_path.display()))]
pub fn run_and_load<P: WorkerProvider + ?Sized>(
    provider: &P,
    request: &ProviderRequest,
) -> Result<WorkerOutcome> {
    provider.run(request)?;
    if !request.output_path.exists() {
        return Err(anyhow!(
            "missing provider outcome {}",
            request.output_path.display()
        ));
    }
    let outcome = load_outcome(&request.output_path)?;
    debug!(status = ?outcome.status, "parsed provider outcome");
    Ok(outcome)
}

/// Read and validate an outcome JSON file against [`OUTCOME_SCHEMA`].
///
/// Validation happens before deserialization so malformed worker output is
/// rejected at the boundary with the schema's error messages.
pub fn load_outcome(path: &Path) -> Result<WorkerOutcome> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read outcome {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;

    let schema: Value = serde_json::from_str(OUTCOME_SCHEMA).context("parse outcome schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile outcome schema")?;
    let messages: Vec<String> = compiled.iter_errors(&value).map(|e| e.to_string()).collect();
    if !messages.is_empty() {
        return Err(anyhow!(
            "worker outcome failed schema validation:\n- {}",
            messages.join("\n- ")
        ));
    }

    let outcome: WorkerOutcome =
        serde_json::from_value(value).with_context(|| format!("parse {}", path.display()))?;
    Ok(outcome)
}

fn write_outcome_schema(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create schema dir {}", parent.display()))?;
    }
    fs::write(path, OUTCOME_SCHEMA).with_context(|| format!("write schema {}", path.display()))
}

fn write_provider_log(path: &Path, output: &CommandOutput, output_limit: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create provider log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stdout));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stderr));
    if output.timed_out {
        buf.push_str("\n[provider timed out]\n");
    }

    if buf.len() > output_limit {
        let truncated = format!(
            "{}\n[truncated {} bytes]\n",
            &buf[..output_limit],
            buf.len() - output_limit
        );
        fs::write(path, truncated)
            .with_context(|| format!("write provider log {}", path.display()))?;
        return Ok(());
    }

    fs::write(path, buf).with_context(|| format!("write provider log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::WorkerStatus;

    struct FakeProvider {
        outcome: Option<WorkerOutcome>,
    }

    impl WorkerProvider for FakeProvider {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn run(&self, request: &ProviderRequest) -> Result<()> {
            if let Some(outcome) = &self.outcome {
                let mut buf = serde_json::to_string_pretty(outcome)?;
                buf.push('\n');
                fs::write(&request.output_path, buf)?;
            }
            Ok(())
        }
    }

    fn request_in(dir: &Path) -> ProviderRequest {
        ProviderRequest {
            workdir: dir.to_path_buf(),
            prompt: "prompt".to_string(),
            output_schema_path: dir.join("schema.json"),
            output_path: dir.join("outcome.json"),
            provider_log_path: dir.join("provider.log"),
            timeout: Duration::from_secs(1),
            output_limit_bytes: 1000,
        }
    }

    #[test]
    fn run_and_load_reads_valid_outcome() {
        let temp = tempfile::tempdir().expect("tempdir");
        let request = request_in(temp.path());
        let fake = FakeProvider {
            outcome: Some(WorkerOutcome {
                status: WorkerStatus::Done,
                summary: "ok".to_string(),
                patch: None,
                regressions: Vec::new(),
            }),
        };

        let outcome = run_and_load(&fake, &request).expect("load");
        assert_eq!(outcome.summary, "ok");
        assert_eq!(outcome.status, WorkerStatus::Done);
    }

    #[test]
    fn run_and_load_errors_on_missing_outcome() {
        let temp = tempfile::tempdir().expect("tempdir");
        let request = request_in(temp.path());
        let fake = FakeProvider { outcome: None };

        let err = run_and_load(&fake, &request).unwrap_err();
        assert!(err.to_string().contains("missing provider outcome"));
    }

    #[test]
    fn load_outcome_rejects_schema_violations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("outcome.json");
        fs::write(&path, "{\"status\": \"maybe\", \"summary\": \"hm\"}").expect("write");

        let err = load_outcome(&path).unwrap_err();
        assert!(err.to_string().contains("schema validation"));
    }

    #[test]
    fn provider_selection_covers_every_kind() {
        assert_eq!(provider_for(ProviderKind::Claude).name(), "claude");
        assert_eq!(provider_for(ProviderKind::Codex).name(), "codex");
        assert_eq!(provider_for(ProviderKind::Gemini).name(), "gemini");
    }
}
