//! CLI entry point for the remedy supervisor.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use remedy_core::types::{TaskKey, TaskSpec};

use remedy_supervisor::collaborator::TracingStatusSink;
use remedy_supervisor::config::SupervisorConfig;
use remedy_supervisor::http::{
    build_client, HttpObservedStateSource, HttpReasoningEngine, HttpTargetSystem,
};
use remedy_supervisor::scheduler::run_once;
use remedy_supervisor::{Collaborators, Pipeline, Supervisor, TaskRuntime};

#[derive(Parser)]
#[command(name = "remedy-supervisor")]
#[command(about = "Safety-gated remediation of supervised cluster targets")]
struct Cli {
    /// Run a single cycle for every Task and exit.
    #[arg(long)]
    once: bool,

    /// Run as daemon, cycling every Task on its own schedule.
    #[arg(long)]
    daemon: bool,

    /// Restrict to one Task (namespace/name).
    #[arg(long)]
    task: Option<String>,

    /// Config file prefix (default: remedy).
    #[arg(short, long, default_value = "remedy")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let specs = select_tasks(&config, cli.task.as_deref())?;
    let settings = config.pipeline_settings();

    let client = build_client(None)?;
    let pipeline = Arc::new(Pipeline::new(
        &settings,
        Collaborators {
            reasoning: Arc::new(HttpReasoningEngine::new(
                client.clone(),
                &config.reasoning_url,
            )),
            target: Arc::new(HttpTargetSystem::new(client.clone(), &config.target_url)),
            observer: Arc::new(HttpObservedStateSource::new(client, &config.observe_url)),
            sink: Arc::new(TracingStatusSink),
        },
    )?);
    tracing::info!(tasks = specs.len(), "Pipeline ready");

    if cli.once {
        let runtimes = specs
            .into_iter()
            .map(|spec| Arc::new(TaskRuntime::new(spec, settings.history_cap)))
            .collect();
        for result in run_once(pipeline, runtimes, config.worker_pool_size).await {
            match result {
                Ok(report) => tracing::info!(
                    outcome = ?report.outcome,
                    phase = %report.phase,
                    records = report.records.len(),
                    "Cycle finished"
                ),
                Err(e) => tracing::error!(error = %e, "Cycle failed"),
            }
        }
    } else if cli.daemon {
        let supervisor = Supervisor::new(pipeline, config.worker_pool_size);
        for spec in specs {
            supervisor.declare(spec);
        }
        let purge = supervisor
            .spawn_ledger_purge(Duration::from_secs(config.ledger_purge_interval_secs));

        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutdown requested");
        purge.abort();
        supervisor.shutdown().await;
    } else {
        anyhow::bail!("Specify --once (single pass) or --daemon (continuous supervision)");
    }

    Ok(())
}

fn select_tasks(config: &SupervisorConfig, only: Option<&str>) -> anyhow::Result<Vec<TaskSpec>> {
    let Some(raw) = only else {
        return Ok(config.tasks.clone());
    };
    let key = TaskKey::parse(raw)
        .ok_or_else(|| anyhow::anyhow!("Invalid --task: {raw}. Expected namespace/name"))?;
    let selected: Vec<TaskSpec> = config
        .tasks
        .iter()
        .filter(|spec| spec.key == key)
        .cloned()
        .collect();
    if selected.is_empty() {
        anyhow::bail!("Task {key} is not declared in the configuration");
    }
    Ok(selected)
}

fn load_config(file_prefix: &str) -> anyhow::Result<SupervisorConfig> {
    let cfg = config::Config::builder()
        .add_source(config::File::with_name(file_prefix).required(false))
        .add_source(
            config::Environment::with_prefix("REMEDY_SUPERVISOR")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    match cfg.get::<SupervisorConfig>("supervisor") {
        Ok(c) => Ok(c),
        Err(config::ConfigError::NotFound(_)) => Ok(SupervisorConfig::default()),
        Err(e) => Err(e.into()),
    }
}
