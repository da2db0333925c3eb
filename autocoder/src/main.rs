//! Coordination daemon and CLI for parallel coding-agent workers.
//!
//! All coordination logic lives in the library; this binary is thin argument
//! plumbing over it.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use autocoder::config::{CoordinatorConfig, load_config, write_config};
use autocoder::context::DaemonContext;
use autocoder::core::types::{BlockedIdsMode, ProviderKind, WorkerStatus};
use autocoder::orchestrator::Orchestrator;
use autocoder::paths::ProjectPaths;
use autocoder::process_manager::ProcessWorkerLauncher;
use autocoder::scheduler::{persist_schedule_entry, remove_persisted_schedule};
use autocoder::store::{Database, NewFeature};
use autocoder::worker::{WorkerArgs, run_worker};
use autocoder::{logging, worker};

#[derive(Parser)]
#[command(
    name = "autocoder",
    version,
    about = "Coordinates parallel autonomous coding-agent workers against one repository"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.autocoder/` scaffolding and the feature database.
    Init {
        #[arg(long, default_value = ".")]
        project_dir: PathBuf,
        /// Overwrite an existing config file.
        #[arg(short, long)]
        force: bool,
    },
    /// Run one orchestrator pass: claim, dispatch, reconcile until idle.
    Run {
        #[arg(long, default_value = ".")]
        project_dir: PathBuf,
        /// Override the configured parallel worker count.
        #[arg(long)]
        max_agents: Option<u32>,
    },
    /// Run the long-lived coordination daemon (scheduler host).
    Daemon {
        #[arg(long, default_value = ".")]
        project_dir: PathBuf,
    },
    /// Internal: run one worker session (spawned by the orchestrator).
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        project_dir: PathBuf,
        #[arg(long)]
        agent_id: String,
        #[arg(long)]
        worktree: PathBuf,
        #[arg(long)]
        feature_id: Option<i64>,
        #[arg(long, default_value = "claude")]
        provider: String,
        #[arg(long, default_value_t = 60)]
        heartbeat_seconds: u64,
    },
    /// Create a feature in the task store.
    AddFeature {
        #[arg(long, default_value = ".")]
        project_dir: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: String,
        #[arg(long)]
        category: String,
        #[arg(long, default_value_t = 0)]
        priority: i64,
        /// Feature ids this feature depends on (repeatable).
        #[arg(long = "depends-on")]
        depends_on: Vec<i64>,
        /// Implementation steps (repeatable).
        #[arg(long = "step")]
        steps: Vec<String>,
    },
    /// Print the blockers summary as JSON.
    Blockers {
        #[arg(long, default_value = ".")]
        project_dir: PathBuf,
    },
    /// Re-queue blocked features (retry-recommended only, or all).
    Retry {
        #[arg(long, default_value = ".")]
        project_dir: PathBuf,
        /// Retry every blocked feature, not just recommended ones.
        #[arg(long)]
        all: bool,
    },
    /// Persist a delayed run for the daemon to fire.
    Schedule {
        #[arg(long, default_value = ".")]
        project_dir: PathBuf,
        /// RFC 3339 timestamp for the run.
        #[arg(long)]
        at: String,
        /// JSON payload passed to the run.
        #[arg(long, default_value = "{}")]
        request: String,
    },
    /// Remove the project's persisted scheduled run.
    CancelSchedule {
        #[arg(long, default_value = ".")]
        project_dir: PathBuf,
    },
}

fn main() {
    logging::init();
    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { project_dir, force } => cmd_init(&project_dir, force),
        Command::Run {
            project_dir,
            max_agents,
        } => cmd_run(&project_dir, max_agents),
        Command::Daemon { project_dir } => cmd_daemon(&project_dir),
        Command::Worker {
            project_dir,
            agent_id,
            worktree,
            feature_id,
            provider,
            heartbeat_seconds,
        } => cmd_worker(
            project_dir,
            agent_id,
            worktree,
            feature_id,
            &provider,
            heartbeat_seconds,
        ),
        Command::AddFeature {
            project_dir,
            name,
            description,
            category,
            priority,
            depends_on,
            steps,
        } => cmd_add_feature(&project_dir, NewFeature {
            name,
            description,
            category,
            priority,
            depends_on,
            steps,
        }),
        Command::Blockers { project_dir } => cmd_blockers(&project_dir),
        Command::Retry { project_dir, all } => cmd_retry(&project_dir, all),
        Command::Schedule {
            project_dir,
            at,
            request,
        } => cmd_schedule(&project_dir, &at, &request),
        Command::CancelSchedule { project_dir } => cmd_cancel_schedule(&project_dir),
    }
}

fn open_db(project_dir: &Path) -> Result<Database> {
    Database::open(&ProjectPaths::new(project_dir).db_path)
}

fn project_name(project_dir: &Path) -> Result<String> {
    let canonical = project_dir
        .canonicalize()
        .with_context(|| format!("resolve {}", project_dir.display()))?;
    canonical
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| anyhow!("project dir has no name: {}", project_dir.display()))
}

fn cmd_init(project_dir: &Path, force: bool) -> Result<()> {
    let paths = ProjectPaths::new(project_dir);
    std::fs::create_dir_all(&paths.state_dir).context("create .autocoder")?;
    std::fs::create_dir_all(&paths.locks_dir).context("create locks dir")?;
    std::fs::create_dir_all(&paths.agents_dir).context("create agents dir")?;
    std::fs::create_dir_all(&paths.regressions_dir).context("create regressions dir")?;

    if force || !paths.config_path.exists() {
        write_config(&paths.config_path, &CoordinatorConfig::default())?;
    }
    Database::open(&paths.db_path)?;
    println!("initialized {}", paths.state_dir.display());
    Ok(())
}

fn cmd_run(project_dir: &Path, max_agents: Option<u32>) -> Result<()> {
    let paths = ProjectPaths::new(project_dir);
    let mut config = load_config(&paths.config_path)?;
    if let Some(max_agents) = max_agents {
        config.max_agents = max_agents;
    }

    let orchestrator = Orchestrator::new(project_dir, config)?;
    let summary = orchestrator.run_until_idle(&ProcessWorkerLauncher)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn cmd_daemon(project_dir: &Path) -> Result<()> {
    let context = DaemonContext::init(project_dir)?;
    loop {
        thread::sleep(Duration::from_secs(60));
        context.healthcheck_all();
        // Pick up schedules persisted by CLI invocations since the last tick.
        if let Err(err) = context.scheduler().restore() {
            tracing::warn!(err = %err, "schedule refresh failed");
        }
    }
}

fn cmd_worker(
    project_dir: PathBuf,
    agent_id: String,
    worktree: PathBuf,
    feature_id: Option<i64>,
    provider: &str,
    heartbeat_seconds: u64,
) -> Result<()> {
    let provider = ProviderKind::parse(provider)
        .ok_or_else(|| anyhow!("unknown provider '{provider}' (claude|codex|gemini)"))?;
    let outcome = run_worker(&WorkerArgs {
        project_dir,
        worktree,
        agent_id,
        feature_id,
        provider,
        heartbeat_seconds,
    })?;
    if outcome.status != WorkerStatus::Done {
        std::process::exit(worker::FAILURE_EXIT_CODE);
    }
    Ok(())
}

fn cmd_add_feature(project_dir: &Path, new: NewFeature) -> Result<()> {
    let id = open_db(project_dir)?.create_feature(&new)?;
    println!("{id}");
    Ok(())
}

fn cmd_blockers(project_dir: &Path) -> Result<()> {
    let summary = open_db(project_dir)?.get_blockers_summary()?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn cmd_retry(project_dir: &Path, all: bool) -> Result<()> {
    let db = open_db(project_dir)?;
    let mode = if all {
        BlockedIdsMode::All
    } else {
        BlockedIdsMode::Recommended
    };
    let ids = db.get_blocked_feature_ids(mode)?;
    let retried = db.retry_blocked_features(&ids)?;
    println!("re-queued {retried} feature(s)");
    Ok(())
}

fn cmd_schedule(project_dir: &Path, at: &str, request: &str) -> Result<()> {
    let run_at: DateTime<Utc> = DateTime::parse_from_rfc3339(at)
        .with_context(|| format!("parse --at '{at}' as RFC 3339"))?
        .with_timezone(&Utc);
    let request: serde_json::Value =
        serde_json::from_str(request).context("parse --request as JSON")?;

    let db = open_db(project_dir)?;
    persist_schedule_entry(&db, &project_name(project_dir)?, run_at, request)?;
    println!("scheduled run at {run_at}");
    Ok(())
}

fn cmd_cancel_schedule(project_dir: &Path) -> Result<()> {
    let db = open_db(project_dir)?;
    if remove_persisted_schedule(&db, &project_name(project_dir)?)? {
        println!("schedule cancelled");
    } else {
        println!("no schedule found");
    }
    Ok(())
}
