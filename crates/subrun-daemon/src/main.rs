//! `subrun` - run one subagent task through the orchestrator.
//!
//! `subrun run` spawns a run, waits for it and prints its result as JSON.
//! `subrun resolve` prints the configuration a run would get.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use subrun_core::config::{Config, load_config};
use subrun_core::permissions::PermissionEngine;
use subrun_daemon::engine::{ClaudeCliEngine, ExecutionEngine, FailoverEngine};
use subrun_daemon::orchestration::{RequestMeta, RunRequest, SubagentManager};
use subrun_daemon::permission::RuleDecider;
use subrun_daemon::resolver;

#[derive(Parser, Debug)]
#[command(name = "subrun")]
#[command(version, about = "subrun - subagent runs over the claude CLI")]
struct Cli {
    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, global = true, default_value = "info", env = "SUBRUN_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true, env = "SUBRUN_LOG_JSON")]
    log_json: bool,

    /// OpenTelemetry OTLP endpoint for traces and metrics export
    /// (e.g. `http://localhost:4317`). Requires the `metrics` feature.
    #[cfg(feature = "metrics")]
    #[arg(long, global = true, env = "SUBRUN_METRICS_ENDPOINT")]
    metrics_endpoint: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a task and print its result.
    Run(RunArgs),
    /// Print the effective tool servers and skills for a run.
    Resolve(LayerArgs),
}

#[derive(Args, Debug)]
struct LayerArgs {
    /// Project directory the run works in.
    #[arg(long, env = "SUBRUN_REPO_DIR")]
    repo_dir: Option<PathBuf>,

    /// Used as the project when `--repo-dir` is unset. Defaults to the
    /// current directory.
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Role pack directory (used when it has `.agents/`).
    #[arg(long)]
    role_dir: Option<PathBuf>,

    /// Host agent home. Defaults to the user's home directory.
    #[arg(long, env = "SUBRUN_HOST_DIR")]
    host_dir: Option<PathBuf>,

    /// Parent workspace, used when neither role pack nor host apply.
    #[arg(long)]
    workspace_dir: Option<PathBuf>,

    /// Explicit agents config; replaces layered tool-server resolution.
    #[arg(long)]
    config_path: Option<PathBuf>,

    /// Role for the run; a `[role]` task prefix is used when unset.
    #[arg(long, default_value = "")]
    role: String,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    layers: LayerArgs,

    /// Task text; a leading `[role]` marker selects the role.
    #[arg(long)]
    task: String,

    /// Run id. A random one is generated when unset.
    #[arg(long)]
    run_id: Option<String>,

    /// Run budget in seconds (0 uses the configured default).
    #[arg(long, default_value_t = 0)]
    timeout_secs: u64,

    /// Extra system prompt for the engine.
    #[arg(long)]
    system_prompt: Option<String>,

    /// Path to the `claude` CLI binary (overrides settings).
    #[arg(long, env = "SUBRUN_CLAUDE_BIN")]
    claude_bin: Option<PathBuf>,

    /// Model for the primary engine (overrides settings).
    #[arg(long)]
    model: Option<String>,

    /// Fallback engine binary, used on auth, rate-limit and billing failures.
    #[arg(long, env = "SUBRUN_FALLBACK_BIN")]
    fallback_bin: Option<PathBuf>,

    /// Model for the fallback engine.
    #[arg(long)]
    fallback_model: Option<String>,

    /// Skip the permission rules; tool calls needing approval are denied.
    #[arg(long)]
    no_permissions: bool,
}

impl LayerArgs {
    fn request(&self, run_id: String, task: String) -> RunRequest {
        RunRequest {
            role: self.role.clone(),
            host_dir: self.host_dir.clone().or_else(dirs::home_dir),
            role_dir: self.role_dir.clone(),
            repo_dir: self.repo_dir.clone(),
            work_dir: self
                .work_dir
                .clone()
                .or_else(|| std::env::current_dir().ok()),
            workspace_dir: self.workspace_dir.clone(),
            config_path: self.config_path.clone(),
            ..RunRequest::new(run_id, task)
        }
    }
}

#[tokio::main]
#[allow(clippy::print_stdout)]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let log_filter = format!("subrun_daemon={0},subrun_core={0},subrun={0}", cli.log_level);
    // Hold the guard so the OTel pipeline stays alive for the process lifetime.
    #[cfg(feature = "metrics")]
    let metrics_guard = subrun_core::tracing_init::init_tracing_with_metrics(
        &log_filter,
        cli.log_json,
        cli.metrics_endpoint.as_deref(),
    );
    #[cfg(not(feature = "metrics"))]
    subrun_core::tracing_init::init_tracing(&log_filter, cli.log_json);

    let code = match cli.command {
        Command::Run(args) => run(args).await?,
        Command::Resolve(args) => {
            let request = args.request(String::new(), String::new());
            println!("{}", serde_json::to_string_pretty(&resolver::resolve(&request))?);
            ExitCode::SUCCESS
        }
    };

    #[cfg(feature = "metrics")]
    if let Some(guard) = metrics_guard {
        guard.shutdown()?;
    }
    Ok(code)
}

#[allow(clippy::print_stdout)]
async fn run(args: RunArgs) -> anyhow::Result<ExitCode> {
    let run_id = args
        .run_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut request = args.layers.request(run_id, args.task.clone());
    request.system_prompt = args.system_prompt.clone();
    if args.timeout_secs > 0 {
        request.timeout = Some(Duration::from_secs(args.timeout_secs));
    }
    request.meta = RequestMeta {
        channel: "cli".to_string(),
        ..RequestMeta::default()
    };

    let config = load_config(request.project_dir())?;
    let engine = build_engine(&config, &args);
    let manager = SubagentManager::from_config(engine, &config.orchestrator);
    if !args.no_permissions {
        let mut rules = PermissionEngine::new();
        rules.add_rules(config.permissions.clone());
        manager.set_permission_decider(Some(Arc::new(RuleDecider::new(rules))));
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        run_id = %request.run_id,
        "Starting subagent run"
    );

    let cancel = CancellationToken::new();
    let run_id = manager.spawn(&cancel, request).await?;

    let waiter = CancellationToken::new();
    let result = tokio::select! {
        result = manager.wait(&waiter, &run_id) => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!(run_id = %run_id, "Received Ctrl+C, canceling run");
            manager.cancel(&run_id).await?;
            manager.wait(&waiter, &run_id).await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(if result.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn build_engine(config: &Config, args: &RunArgs) -> Arc<dyn ExecutionEngine> {
    let mut primary = ClaudeCliEngine::from_config(&config.engine);
    if let Some(bin) = &args.claude_bin {
        primary = primary.with_bin(bin.clone());
    }
    if let Some(model) = &args.model {
        primary = primary.with_model(subrun_core::config::normalize_model(model));
    }

    match &args.fallback_bin {
        Some(bin) => {
            let fallback = ClaudeCliEngine::new(bin.clone()).with_model(
                args.fallback_model
                    .as_deref()
                    .and_then(subrun_core::config::normalize_model),
            );
            Arc::new(FailoverEngine::new(Arc::new(primary), Some(Arc::new(fallback))))
        }
        None => Arc::new(primary),
    }
}
