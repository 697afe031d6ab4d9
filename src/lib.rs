//! Decision engine for a batch-workload HPC scheduler.
//!
//! Given a snapshot of queues, nodes, reservations, and jobs, this crate
//! decides, every cycle, which queued jobs can run now, which should be
//! promised a future start ("top jobs", with lower-priority backfill
//! filling the gaps), and which running jobs must be preempted to make
//! room for something more important. The actual wire transport to the
//! batch server is out of scope — [`connector::ServerConnector`] is the
//! seam a site's transport implementation plugs into.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod buckets;
pub mod calendar;
pub mod config;
pub mod connector;
pub mod entities;
pub mod equiv;
pub mod error;
pub mod fairshare;
pub mod fit;
pub mod formula;
pub mod ingest;
pub mod limits;
pub mod orchestrator;
pub mod placement;
pub mod preempt;
pub mod request;
pub mod resource;
pub mod simulate;
pub mod state_count;
pub mod topjob;

pub use config::{ConfigHandle, ConfigLoader, SchedConfig};
pub use connector::ServerConnector;
pub use entities::server::Server;
pub use error::{ScheduleError, ScheduleResult};
pub use fit::{is_ok_to_run, FitFlags, RunOutcome};
pub use ingest::build_server;
pub use orchestrator::{CycleOrchestrator, CycleOutcome};
pub use state_count::StateCount;

/// Install the crate's `tracing` subscriber: JSON on non-interactive
/// output, env-filterable via `RUST_LOG` (§10.1). Binaries call this once
/// at startup; library consumers that already run their own subscriber
/// should not call this.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).json().try_init();
}
