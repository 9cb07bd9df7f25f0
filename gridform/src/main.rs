//! gridform: plan or simulate reconciliations of declared grid resources.
//!
//! `plan` shows what a reconciliation would do without contacting anything.
//! `simulate` runs the full reconciliation against an in-memory grid and
//! writes the resulting state, so state files can be inspected and chained.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gridform::clients::memory::{MemoryGrid, MemoryIdentity, SequentialKeys};
use gridform::{
    plan_deployment, plan_network, DeploymentReconciler, DeploymentSpec, DeploymentState,
    EngineConfig, GridClients, NetworkReconciler, NetworkSpec, NetworkState, Reconciler,
};

#[derive(Parser, Debug)]
#[command(name = "gridform", version, about)]
struct Cli {
    /// Engine configuration (JSON); missing fields use defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the completion polling budget in seconds
    #[arg(long, global = true)]
    completion_budget_secs: Option<u64>,

    /// Override the delay between two completion polls in milliseconds
    #[arg(long, global = true)]
    poll_interval_ms: Option<u64>,

    /// Override the access configuration keepalive in seconds
    #[arg(long, global = true)]
    keepalive_secs: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show what a reconciliation would do
    Plan {
        #[command(subcommand)]
        target: Target,
    },

    /// Reconcile against an in-memory grid and write the resulting state
    Simulate {
        /// Twin the simulated identity signs as
        #[arg(long, default_value = "1")]
        twin_id: u32,

        /// Delete the recorded resource instead of reconciling it
        #[arg(long)]
        destroy: bool,

        #[command(subcommand)]
        target: Target,
    },
}

#[derive(Subcommand, Debug)]
enum Target {
    /// Disks, storage nodes and machines on one node
    Deployment(Files),
    /// Mesh network across several nodes
    Network(Files),
}

#[derive(Args, Debug)]
struct Files {
    /// Declared resource (JSON)
    #[arg(long)]
    spec: PathBuf,

    /// State from a previous run (JSON)
    #[arg(long)]
    state: Option<PathBuf>,

    /// Where to write the result (stdout if omitted)
    #[arg(short, long)]
    out: Option<PathBuf>,
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

fn read_state<T: DeserializeOwned + Default>(path: Option<&Path>) -> Result<T> {
    match path {
        Some(path) if path.exists() => read_json(path),
        _ => Ok(T::default()),
    }
}

fn write_json<T: Serialize>(value: &T, out: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    match out {
        Some(path) => std::fs::write(path, json + "\n")
            .with_context(|| format!("Failed to write {}", path.display())),
        None => {
            println!("{}", json);
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config: EngineConfig = match &cli.config {
        Some(path) => read_json(path)?,
        None => EngineConfig::default(),
    };
    if let Some(secs) = cli.completion_budget_secs {
        config.completion_budget_secs = secs;
    }
    if let Some(ms) = cli.poll_interval_ms {
        config.poll_interval_ms = ms;
    }
    if let Some(secs) = cli.keepalive_secs {
        config.keepalive_secs = secs;
    }
    Ok(config)
}

fn memory_clients(grid: &Arc<MemoryGrid>, twin_id: u32) -> GridClients {
    GridClients {
        ledger: grid.clone(),
        agent: grid.clone(),
        directory: grid.clone(),
        identity: Arc::new(MemoryIdentity::new(twin_id)),
        keys: Arc::new(SequentialKeys::new(format!("gridform-{}", twin_id))),
    }
}

async fn simulate_deployment(
    files: &Files,
    config: &EngineConfig,
    twin_id: u32,
    destroy: bool,
) -> Result<()> {
    let mut state: DeploymentState = read_state(files.state.as_deref())?;
    let grid = Arc::new(MemoryGrid::new());
    if let (Some(node_id), Some(contract_id), Some(version)) =
        (state.node_id, state.contract_id, state.version)
    {
        grid.adopt(node_id, twin_id, contract_id, version);
    }

    let reconciler = DeploymentReconciler::new(memory_clients(&grid, twin_id), config);
    if destroy {
        let result = reconciler.finalize(&mut state).await;
        write_json(&state, files.out.as_deref())?;
        result?;
        return Ok(());
    }

    let spec: DeploymentSpec = read_json(&files.spec)?;
    let result = reconciler.reconcile(&spec, &mut state).await;
    // partial progress is state too
    write_json(&state, files.out.as_deref())?;
    result?;
    info!("Deployment on node {} reconciled", spec.node_id);
    Ok(())
}

async fn simulate_network(
    files: &Files,
    config: &EngineConfig,
    twin_id: u32,
    destroy: bool,
) -> Result<()> {
    let mut state: NetworkState = read_state(files.state.as_deref())?;
    let grid = Arc::new(MemoryGrid::new());
    for node in &state.nodes {
        if let (Some(contract_id), Some(version)) = (node.contract_id, node.version) {
            grid.adopt(node.node_id, twin_id, contract_id, version);
        }
    }

    let reconciler = NetworkReconciler::new(memory_clients(&grid, twin_id), config.clone());
    if destroy {
        let result = reconciler.finalize(&mut state).await;
        write_json(&state, files.out.as_deref())?;
        result?;
        return Ok(());
    }

    let spec: NetworkSpec = read_json(&files.spec)?;
    let result = reconciler.reconcile(&spec, &mut state).await;
    write_json(&state, files.out.as_deref())?;
    result?;
    info!("Network {} reconciled", spec.name);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gridform=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match &cli.command {
        Commands::Plan { target } => match target {
            Target::Deployment(files) => {
                let spec: DeploymentSpec = read_json(&files.spec)?;
                let state: DeploymentState = read_state(files.state.as_deref())?;
                write_json(&plan_deployment(&spec, &state)?, files.out.as_deref())
            }
            Target::Network(files) => {
                let spec: NetworkSpec = read_json(&files.spec)?;
                let state: NetworkState = read_state(files.state.as_deref())?;
                write_json(&plan_network(&spec, &state)?, files.out.as_deref())
            }
        },
        Commands::Simulate {
            twin_id,
            destroy,
            target,
        } => match target {
            Target::Deployment(files) => {
                simulate_deployment(files, &config, *twin_id, *destroy).await
            }
            Target::Network(files) => simulate_network(files, &config, *twin_id, *destroy).await,
        },
    }
}
