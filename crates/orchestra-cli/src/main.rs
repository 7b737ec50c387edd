//! `orchestra` - run a YAML workflow on an in-process runtime

mod settings;

use anyhow::{bail, Context, Result};
use clap::Parser;
use orchestra_core::application::converter::ProcessConverter;
use orchestra_core::{ExecutionStatus, RuntimeInterface, Stores, Variables, YamlWorkflowConverter};
use orchestra_monitoring::{init_logging, LogExt, TracingInteractionSink};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

use crate::settings::RunnerConfig;

#[derive(Debug, Parser)]
#[command(name = "orchestra", version, about = "Run a workflow definition to completion")]
struct Cli {
    /// Workflow definition (YAML)
    workflow: PathBuf,

    /// Configuration file
    #[arg(short, long, env = "ORCHESTRA_CONFIG")]
    config: Option<PathBuf>,

    /// Node patch applied before deployment (YAML keyed by node key)
    #[arg(short, long)]
    patch: Option<PathBuf>,

    /// Initial run variables as a JSON object
    #[arg(long, default_value = "{}")]
    vars: String,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = RunnerConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_logging(&config.monitoring).context("Failed to initialize logging")?;

    let variables: Variables = serde_json::from_str(&cli.vars).context("--vars must be a JSON object")?;

    let runtime = Arc::new(
        RuntimeInterface::new(
            config.orchestra.clone(),
            Stores::in_memory(),
            Some(Arc::new(TracingInteractionSink::new())),
        )
        .context("Failed to build runtime")?,
    );
    orchestra_stdlib::register_all(&runtime)
        .await
        .context("Failed to register standard components")?;
    runtime.start().context("Failed to start dispatcher")?;

    let domain = deploy(&runtime, &cli).await?;
    let id = runtime
        .trigger(&domain, variables)
        .await
        .with_context(|| format!("Failed to start {}", domain))?;

    let execution = tokio::select! {
        finished = runtime.wait_for_terminal(&id, config.run_timeout()) => {
            finished.log_err("Run did not finish").context("Run did not finish")?
        }
        _ = tokio::signal::ctrl_c() => {
            warn!(execution_id = %id, "Interrupted, terminating run");
            runtime.terminate(&id, Some("interrupted".to_string())).await?;
            runtime.execution(&id).await?
        }
    };

    info!(execution_id = %id, status = ?execution.status, "Run finished");
    println!(
        "{}",
        serde_json::to_string_pretty(&execution).context("Failed to render execution")?
    );

    Ok(match execution.status {
        ExecutionStatus::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

/// Register the workflow, returning its domain
async fn deploy(runtime: &RuntimeInterface, cli: &Cli) -> Result<String> {
    let definition = tokio::fs::read_to_string(&cli.workflow)
        .await
        .with_context(|| format!("Failed to read {}", cli.workflow.display()))?;
    let converter = YamlWorkflowConverter::new();

    let Some(patch) = &cli.patch else {
        let workflow_id = runtime
            .deploy_process(&definition, &converter)
            .await
            .context("Failed to deploy workflow")?;
        return Ok(runtime.workflows().get_workflow(&workflow_id).await?.domain.clone());
    };

    let patch = tokio::fs::read_to_string(patch)
        .await
        .with_context(|| format!("Failed to read {}", patch.display()))?;
    let mut workflow = converter.convert(&definition).context("Invalid workflow")?;
    converter.annotate(&mut workflow, &patch).context("Invalid patch")?;
    let domain = workflow.domain.clone();
    if domain.is_empty() {
        bail!("workflow has no domain");
    }
    runtime.deploy(workflow).await.context("Failed to deploy workflow")?;
    Ok(domain)
}
