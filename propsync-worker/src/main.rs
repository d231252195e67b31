//! propsync: supervisor, worker and scheduler entry point.
//!
//! Reads config from env vars (see `WorkerConfig`), optionally seeded from
//! `.env`:
//!   PROPSYNC_DATABASE_URL  Postgres connection string (worker, schedule)
//!   PROPSYNC_POOL_SIZE     worker processes under `supervise` (default: 4)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use propsync_core::{HandlerRegistry, TaskExecutor, TracingSink};
use propsync_worker::config::WorkerConfig;
use propsync_worker::process::set_process_label;
use propsync_worker::signals::ShutdownSignals;
use propsync_worker::supervisor::{CommandSpawner, Supervisor};
use propsync_worker::telemetry::init_tracing;
use propsync_worker::worker::{spawn_signal_listener, Worker, WorkerState};

#[derive(Parser)]
#[command(name = "propsync")]
#[command(about = "Property sync hub job runner")]
struct Cli {
    #[command(flatten)]
    config: WorkerConfig,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Keep a pool of worker processes alive until signalled
    Supervise,

    /// Poll the job queue (normally spawned by `supervise`)
    Worker {
        /// Pool slot this process occupies
        #[arg(long, default_value_t = 0)]
        slot: usize,
    },

    /// Enqueue due jobs on every tick
    Schedule,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing();

    cli.config.validate()?;

    match cli.command {
        Command::Supervise => {
            set_process_label("supervisor", None);
            let spawner = CommandSpawner::current_exe()?.with_env(cli.config.to_env());
            Supervisor::new(spawner, cli.config.pool_size).run().await?;
            Ok(())
        }
        Command::Worker { slot } => {
            set_process_label("worker", Some(slot));
            run_worker(&cli.config, slot).await
        }
        Command::Schedule => {
            set_process_label("scheduler", None);
            run_scheduler(&cli.config).await
        }
    }
}

/// Supplier integrations register their handlers here.
fn build_registry() -> HandlerRegistry {
    let registry = HandlerRegistry::new();
    if registry.is_empty() {
        tracing::warn!("no sync handlers registered; every delivery will fail dispatch");
    }
    for key in registry.keys() {
        tracing::debug!(%key, "handler available");
    }
    registry
}

async fn run_worker(config: &WorkerConfig, slot: usize) -> Result<()> {
    let backend = backend::connect(config).await?;
    let sink = Arc::new(TracingSink);
    let executor = TaskExecutor::new(
        backend.jobs.clone(),
        backend.owners.clone(),
        Arc::new(build_registry()),
        sink.clone(),
    )
    .with_timeout(config.handler_timeout());

    let state = Arc::new(WorkerState::new());
    let listener = spawn_signal_listener(state.clone()).context("Failed to install signal handlers")?;

    let worker = Worker::new(slot, backend.queue, Arc::new(executor), sink, state)
        .with_receive(config.receive_batch, config.receive_wait());
    worker.run().await;

    listener.abort();
    Ok(())
}

async fn run_scheduler(config: &WorkerConfig) -> Result<()> {
    let backend = backend::connect(config).await?;
    let scheduler =
        propsync_core::Scheduler::new(backend.jobs, backend.queue, config.schedule_interval());

    let shutdown = CancellationToken::new();
    let mut signals = ShutdownSignals::install().context("Failed to install signal handlers")?;
    let token = shutdown.clone();
    tokio::spawn(async move {
        let name = signals.recv().await;
        tracing::info!(signal = name, "scheduler received shutdown signal");
        token.cancel();
    });

    scheduler.run(shutdown).await;
    Ok(())
}

#[cfg(feature = "postgres")]
mod backend {
    use anyhow::{Context, Result};
    use propsync_core::{JobQueue, JobStore, OwnerStore, PgQueue, PgStore};
    use propsync_worker::config::WorkerConfig;
    use sqlx::postgres::PgPoolOptions;
    use std::sync::Arc;

    pub struct Backend {
        pub jobs: Arc<dyn JobStore>,
        pub owners: Arc<dyn OwnerStore>,
        pub queue: Arc<dyn JobQueue>,
    }

    pub async fn connect(config: &WorkerConfig) -> Result<Backend> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(config.database_url()?)
            .await
            .context("Failed to connect to database")?;
        tracing::info!("Connected to database");

        let store = Arc::new(PgStore::new(pool.clone()));
        Ok(Backend {
            jobs: store.clone(),
            owners: store,
            queue: Arc::new(PgQueue::new(pool, config.visibility_timeout())),
        })
    }
}

#[cfg(not(feature = "postgres"))]
mod backend {
    use anyhow::{bail, Result};
    use propsync_core::{JobQueue, JobStore, OwnerStore};
    use propsync_worker::config::WorkerConfig;
    use std::sync::Arc;

    pub struct Backend {
        pub jobs: Arc<dyn JobStore>,
        pub owners: Arc<dyn OwnerStore>,
        pub queue: Arc<dyn JobQueue>,
    }

    pub async fn connect(_config: &WorkerConfig) -> Result<Backend> {
        bail!("propsync was built without the `postgres` feature; no job backend available")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_registry_resolves_every_listed_key() {
        let registry = build_registry();
        let keys = registry.keys();
        assert_eq!(keys.len(), registry.len());
        for key in &keys {
            assert!(registry.lookup(key).is_some(), "{key} listed but not resolvable");
        }
    }

    #[test]
    fn cli_parses_worker_slot() {
        let cli = Cli::try_parse_from(["propsync", "worker", "--slot", "3"]).unwrap();
        assert!(matches!(cli.command, Command::Worker { slot: 3 }));
    }
}
