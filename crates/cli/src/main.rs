// Clusterfacts workflow runner
//
// Design Decision: Use clap derive for argument parsing.
// Design Decision: Resolve the workflow before detaching so configuration errors reach the terminal.
// Design Decision: Build the tokio runtime by hand, after any fork.

mod config;
mod daemon;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use clusterfacts_core::telemetry::{init_telemetry, TelemetryConfig};
use clusterfacts_core::{Engine, EngineConfig, GraphResolver, TypeCatalog, WorkflowDescriptor};
use clusterfacts_steps::builtin_catalog;
use serde_json::Value;
use tracing::{error, info};

use config::RunnerConfig;
use daemon::PidFile;

#[derive(Debug, Parser)]
#[command(name = "run_workflow")]
#[command(about = "Resolve and run a Clusterfacts workflow")]
#[command(version)]
pub struct Cli {
    /// Runner configuration file (TOML)
    #[arg(long, short, env = "CLUSTERFACTS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Detach from the terminal and run in the background
    #[arg(long, conflicts_with = "cron")]
    pub daemon: bool,

    /// Exit immediately if a previous run of this workflow is still going
    #[arg(long)]
    pub cron: bool,

    /// PID file guarding against overlapping runs
    #[arg(long)]
    pub pid_file: Option<PathBuf>,

    /// Print the registered steps and exit
    #[arg(long)]
    pub list_steps: bool,

    /// Workflow descriptor (JSON)
    #[arg(required_unless_present = "list_steps")]
    pub workflow: Option<PathBuf>,
}

impl Cli {
    /// PID file to lock, if this mode needs one
    fn pid_path(&self, config: &RunnerConfig, workflow: &Path) -> Option<PathBuf> {
        if let Some(path) = &self.pid_file {
            return Some(path.clone());
        }
        if !(self.daemon || self.cron) {
            return None;
        }
        let stem = workflow
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workflow".to_string());
        Some(config.pid_dir.join(format!("{stem}.pid")))
    }
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %format!("{e:#}"), "run_workflow failed");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<bool> {
    if let Ok(path) = dotenvy::dotenv() {
        eprintln!("Loaded environment from {}", path.display());
    }
    let config = RunnerConfig::load(cli.config.as_deref())?;
    let catalog = builtin_catalog();

    if cli.list_steps {
        print_steps(&catalog);
        return Ok(true);
    }
    let workflow_path = cli
        .workflow
        .clone()
        .context("a workflow file is required")?;

    if !cli.daemon {
        init_logging(&config, config.log_file.clone())?;
    }

    let mut descriptor = WorkflowDescriptor::from_path(&workflow_path)
        .with_context(|| format!("failed to load workflow {}", workflow_path.display()))?;
    descriptor
        .params
        .entry("state_dir")
        .or_insert_with(|| Value::String(config.state_dir.display().to_string()));
    let workflow = GraphResolver::new(&catalog)
        .resolve(&descriptor)
        .with_context(|| format!("failed to resolve workflow {}", descriptor.name))?;

    if cli.daemon {
        daemon::daemonize().context("failed to detach")?;
        let log_file = config
            .log_file
            .clone()
            .unwrap_or_else(|| config.state_dir.join("run_workflow.log"));
        init_logging(&config, Some(log_file))?;
    }

    let _pid_file = match cli.pid_path(&config, &workflow_path) {
        Some(path) => Some(PidFile::acquire(path)?),
        None => None,
    };

    info!(workflow = %descriptor.name, steps = workflow.steps().len(), "Starting workflow");
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let engine = Engine::new(
        EngineConfig::default().with_poll_interval(Duration::from_millis(config.poll_interval_ms)),
    );
    let report = runtime.block_on(engine.run(workflow))?;

    Ok(report.succeeded())
}

fn init_logging(config: &RunnerConfig, log_file: Option<PathBuf>) -> Result<()> {
    if let Some(dir) = log_file.as_deref().and_then(Path::parent) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    }
    let telemetry = TelemetryConfig {
        service_name: "run_workflow".to_string(),
        ..TelemetryConfig::from_env()
    }
    .or_log_filter(config.log_filter.clone())
    .with_log_file(log_file);
    init_telemetry(telemetry)?;
    Ok(())
}

fn print_steps(catalog: &TypeCatalog) {
    let join = |kinds: &[clusterfacts_core::Kind]| {
        kinds
            .iter()
            .map(|k| k.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };

    for step in catalog.steps() {
        let spec = &step.spec;
        println!("{}", spec.name);
        if !spec.description.is_empty() {
            println!("    {}", spec.description);
        }
        if !spec.requires.is_empty() {
            println!("    requires: {}", join(&spec.requires));
        }
        if !spec.produces.is_empty() {
            println!("    produces: {}", join(&spec.produces));
        }
        for param in &spec.params {
            let marker = if param.required { " (required)" } else { "" };
            println!("    --{}{}: {}", param.name, marker, param.description);
        }
    }
}
