//! CLI entrypoint for the scheduler core.
//!
//! The real deployment drives [`hpc_sched_core::CycleOrchestrator`] from a
//! transport-specific `ServerConnector` that this crate does not provide
//! (§1). This binary ships the two things that are self-contained without
//! one: config validation, and running a cycle against a JSON snapshot
//! fixture via [`hpc_sched_core::connector::JsonFileConnector`] — useful
//! for dry-running a sched_config against captured state the way a site
//! might replay an incident.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use clap::{Parser, Subcommand};
use hpc_sched_core::config::ConfigLoader;
use hpc_sched_core::connector::JsonFileConnector;
use hpc_sched_core::{build_server, CycleOrchestrator};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "hpc-sched-core")]
#[command(about = "Decision engine for a batch-workload HPC scheduler")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate a sched_config file, printing the resolved
    /// policy as JSON.
    CheckConfig {
        /// Path to the sched_config file.
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Run one scheduling cycle against a JSON snapshot fixture and print
    /// what it decided.
    RunFile {
        /// Path to a JSON snapshot file (server/queues/nodes/resvs/jobs).
        #[arg(short, long)]
        snapshot: PathBuf,
        /// Optional sched_config file; defaults are used if omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Cycle time, as Unix seconds. Defaults to the current time.
        #[arg(short, long)]
        now: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    hpc_sched_core::init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::CheckConfig { file } => {
            let config = ConfigLoader::load_from_file(&file)?;
            let json = serde_json::json!({
                "sched_cycle_len": config.policy.sched_cycle_len,
                "backfill_depth": config.policy.backfill_depth,
                "strict_ordering": config.policy.strict_ordering,
                "max_preempt_attempts": config.policy.max_preempt_attempts,
                "node_sort_key": config.node_sort_key,
                "job_sort_key": config.job_sort_key,
                "resources_to_check": config.resources_to_check,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }

        Commands::RunFile { snapshot, config, now } => {
            let config = match config {
                Some(path) => ConfigLoader::load_from_file(&path)?,
                None => hpc_sched_core::SchedConfig::default(),
            };
            let connector = JsonFileConnector::from_file(&snapshot)?;
            let server_status = connector_stat_server(&connector).await?;
            let queues = connector_stat_queue(&connector).await?;
            let nodes = connector_stat_node(&connector).await?;
            let resvs = connector_stat_resv(&connector).await?;
            let jobs = connector_stat_jobs(&connector).await?;

            let cycle_time = now.unwrap_or_else(|| {
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0)
            });
            let mut server = build_server(cycle_time, &server_status, &queues, &nodes, &resvs, &jobs);

            let orchestrator = CycleOrchestrator::new(&connector, Arc::new(config), None);
            let outcome = orchestrator.run_cycle(&mut server).await?;

            println!("jobs run:       {:?}", outcome.jobs_run);
            println!("held as top:    {:?}", outcome.jobs_held_as_top);
            println!("preempted:      {:?}", outcome.jobs_preempted);
            println!("cycle duration: {:?}", outcome.cycle_duration);
            if outcome.ended_early {
                println!("(cycle ended early: sched_cycle_len exceeded)");
            }
            for line in connector.commit_log() {
                println!("commit> {line}");
            }
        }
    }

    Ok(())
}

// Thin wrappers so `main` reads as the cycle orchestrator's own callers
// would: one query per entity kind, matching §6.1 rather than reaching
// into `JsonFileConnector` internals directly.
async fn connector_stat_server(c: &JsonFileConnector) -> Result<hpc_sched_core::connector::BatchStatus, Box<dyn std::error::Error>> {
    use hpc_sched_core::connector::ServerConnector;
    Ok(c.stat_server().await?)
}
async fn connector_stat_queue(c: &JsonFileConnector) -> Result<Vec<hpc_sched_core::connector::BatchStatus>, Box<dyn std::error::Error>> {
    use hpc_sched_core::connector::ServerConnector;
    Ok(c.stat_queue().await?)
}
async fn connector_stat_node(c: &JsonFileConnector) -> Result<Vec<hpc_sched_core::connector::BatchStatus>, Box<dyn std::error::Error>> {
    use hpc_sched_core::connector::ServerConnector;
    Ok(c.stat_node().await?)
}
async fn connector_stat_resv(c: &JsonFileConnector) -> Result<Vec<hpc_sched_core::connector::BatchStatus>, Box<dyn std::error::Error>> {
    use hpc_sched_core::connector::ServerConnector;
    Ok(c.stat_resv().await?)
}
async fn connector_stat_jobs(c: &JsonFileConnector) -> Result<Vec<hpc_sched_core::connector::BatchStatus>, Box<dyn std::error::Error>> {
    use hpc_sched_core::connector::ServerConnector;
    let selection = hpc_sched_core::connector::JobSelection::default();
    Ok(c.selstat_jobs(&selection, &[], None).await?)
}
