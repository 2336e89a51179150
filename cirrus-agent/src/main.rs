//! cirrus-agent: drives a cluster's network resources to the state in its manifest.
//!
//! Long-running provider operations that outlive a pass are recorded in the
//! status file and resumed by the next pass, or by the next invocation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cirrus_agent::agent::DEFAULT_REQUEUE_CAP;
use cirrus_agent::services::{self, ServiceSettings};
use cirrus_agent::status::read_status;
use cirrus_agent::{
    Action, AgentAuditLogger, AgentSettings, ClusterManifest, FileStatusStore, PassOutcome,
    ReconcileAgent, SimulatedCloud,
};

/// cirrus cluster agent
#[derive(Parser, Debug)]
#[command(name = "cirrus-agent", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Cluster manifest (JSON)
    #[arg(long, global = true, default_value = "cluster.json")]
    manifest: PathBuf,

    /// Status file holding conditions and in-flight operations
    #[arg(long, global = true, default_value = "cluster.status.json")]
    status_file: PathBuf,

    /// State file of the simulated provider
    #[arg(long, global = true, default_value = "cloud.json")]
    cloud_state: PathBuf,

    /// Time budget for one pass in seconds
    #[arg(long, global = true, default_value = "1200")]
    timeout_secs: u64,

    /// How long the simulated provider takes to finish an operation
    #[arg(long, global = true, default_value = "30000")]
    operation_latency_ms: u64,

    /// Stop after this many passes
    #[arg(long, global = true)]
    max_passes: Option<u32>,

    /// Upper bound on the delay between passes in seconds
    #[arg(long, global = true, default_value_t = DEFAULT_REQUEUE_CAP.as_secs())]
    requeue_cap_secs: u64,

    /// Run a single pass and exit
    #[arg(long, global = true)]
    once: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or update all resources
    Reconcile,
    /// Delete all resources
    Delete,
    /// Print conditions and in-flight operations
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cirrus_agent=info,cirrus_lro=info,audit=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let action = match &args.command {
        Command::Status => return print_status(&args),
        Command::Reconcile => Action::Reconcile,
        Command::Delete => Action::Delete,
    };

    let manifest = ClusterManifest::load(&args.manifest)?;
    info!(
        "Starting cirrus-agent for cluster {} ({})",
        manifest.cluster_name, manifest.resource_group
    );

    let status = Arc::new(FileStatusStore::open(&args.status_file)?);
    let cloud = Arc::new(
        SimulatedCloud::open(
            &args.cloud_state,
            Duration::from_millis(args.operation_latency_ms),
        )
        .context("Failed to open provider state")?,
    );

    let timeout = Duration::from_secs(args.timeout_secs);
    let service_settings = ServiceSettings {
        timeout,
        ..ServiceSettings::default()
    };
    let agent = ReconcileAgent::new(
        services::for_manifest(&manifest, &cloud, &status, service_settings),
        AgentAuditLogger::new(&manifest.cluster_name),
        AgentSettings {
            timeout,
            requeue_cap: Duration::from_secs(args.requeue_cap_secs),
            max_passes: args.max_passes,
            once: args.once,
            ..AgentSettings::default()
        },
    );

    let summary = agent.run(action).await;
    if status.has_unsaved_changes() {
        status.save().with_context(|| {
            format!(
                "Status file {} is out of date, in-flight operations may not be resumed",
                status.path().display()
            )
        })?;
    }

    match summary.last {
        PassOutcome::Ready => Ok(()),
        PassOutcome::Requeue(after) => {
            warn!(
                passes = summary.passes,
                "Operations still in progress, run again in {:?}", after
            );
            Ok(())
        }
        PassOutcome::Failed(e) => {
            bail!("{:?} failed after {} passes: {}", action, summary.passes, e)
        }
    }
}

fn print_status(args: &Args) -> Result<()> {
    let status = read_status(&args.status_file)?;

    if status.conditions.is_empty() {
        println!("No conditions recorded");
    }
    for c in &status.conditions {
        println!(
            "{:<24} {:<8} {:<16} {}",
            c.condition_type,
            format!("{:?}", c.status),
            c.reason.as_deref().unwrap_or("-"),
            c.message.as_deref().unwrap_or("")
        );
    }

    if !status.long_running_operation_states.is_empty() {
        println!();
        println!("In-flight operations:");
        for op in &status.long_running_operation_states {
            println!(
                "  {:<7} {}/{} (service: {})",
                op.kind.to_string(),
                op.resource_group,
                op.name,
                op.service_name
            );
        }
    }
    Ok(())
}
