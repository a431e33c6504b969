use anyhow::Context;
use bulk_search::config::{SchedulerConfig, WorkerConfig};
use bulk_search::matching::{MatcherRegistry, SampleStore};
use bulk_search::queue::{Broker, MemoryBroker, RedisBroker};
use bulk_search::scheduler::{Scheduler, router};
use bulk_search::storage::{DirectoryStorage, HttpStorageClient, StorageQueryClient};
use bulk_search::worker::Worker;
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bulk-search", version, about = "Distributed bulk file search")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and its HTTP API against a redis broker.
    Scheduler {
        #[command(flatten)]
        broker: BrokerArgs,
        #[command(flatten)]
        storage: StorageArgs,
        #[command(flatten)]
        scheduler: SchedulerArgs,
    },
    /// Run a worker daemon against a redis broker.
    Worker {
        #[command(flatten)]
        broker: BrokerArgs,
        #[command(flatten)]
        worker: WorkerArgs,
    },
    /// Scheduler and workers in one process with an in-memory broker.
    Standalone {
        #[command(flatten)]
        storage: StorageArgs,
        #[command(flatten)]
        scheduler: SchedulerArgs,
        #[command(flatten)]
        worker: WorkerArgs,
    },
}

#[derive(Args)]
struct BrokerArgs {
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Namespace of every broker key.
    #[arg(long, env = "BULK_SEARCH_PREFIX", default_value = "bulk-search")]
    key_prefix: String,
}

#[derive(Args)]
struct StorageArgs {
    /// Index engine endpoint. Without it, candidates come from a full scan.
    #[arg(long, env = "URSADB_URL")]
    ursadb_url: Option<String>,

    /// Directory scanned when no index engine is configured.
    #[arg(long, env = "BULK_SEARCH_SCAN_ROOT")]
    scan_root: Option<PathBuf>,
}

#[derive(Args)]
struct SchedulerArgs {
    #[arg(long, env = "BULK_SEARCH_BIND", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    #[arg(long, env = "BULK_SEARCH_BATCH_SIZE", default_value_t = 500)]
    batch_size: usize,

    #[arg(long, env = "BULK_SEARCH_TASK_ATTEMPTS", default_value_t = 3)]
    task_attempts: u32,

    #[arg(long, env = "BULK_SEARCH_DISPATCH_ATTEMPTS", default_value_t = 5)]
    dispatch_attempts: u32,

    /// Lease sweep period in milliseconds.
    #[arg(long, env = "BULK_SEARCH_SWEEP_MS", default_value_t = 1000)]
    sweep_ms: u64,

    /// Jobs per owner per day, 0 for unlimited.
    #[arg(long, env = "BULK_SEARCH_OWNER_QUOTA", default_value_t = 0)]
    owner_quota: u64,
}

impl SchedulerArgs {
    fn config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_batch_size: self.batch_size.max(1),
            max_task_attempts: self.task_attempts.max(1),
            max_dispatch_attempts: self.dispatch_attempts.max(1),
            sweep_interval: Duration::from_millis(self.sweep_ms.max(1)),
            owner_quota: self.owner_quota,
            ..SchedulerConfig::default()
        }
    }
}

#[derive(Args)]
struct WorkerArgs {
    /// Root of the shared sample directory.
    #[arg(long, env = "BULK_SEARCH_SAMPLES", default_value = ".")]
    samples: PathBuf,

    #[arg(long, env = "BULK_SEARCH_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Lease duration in seconds.
    #[arg(long, env = "BULK_SEARCH_LEASE_SECS", default_value_t = 30)]
    lease_secs: u64,
}

impl WorkerArgs {
    fn config(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.concurrency.max(1),
            lease_timeout: Duration::from_secs(self.lease_secs.max(1)),
            ..WorkerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
        }
        tracing::info!("Shutdown requested");
        signal.cancel();
    });

    match cli.command {
        Command::Scheduler {
            broker,
            storage,
            scheduler,
        } => {
            let broker = connect_broker(&broker).await?;
            let storage = storage_client(&storage, None)?;
            run_scheduler(broker, storage, &scheduler, shutdown, Vec::new()).await
        }
        Command::Worker { broker, worker } => {
            let broker = connect_broker(&broker).await?;
            let handles = spawn_worker(broker, &worker, shutdown.clone());

            tracing::info!("Press Ctrl+C to shutdown");
            join_all(handles).await;
            Ok(())
        }
        Command::Standalone {
            storage,
            scheduler,
            worker,
        } => {
            let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
            let storage = storage_client(&storage, Some(&worker.samples))?;
            let workers = spawn_worker(broker.clone(), &worker, shutdown.clone());
            run_scheduler(broker, storage, &scheduler, shutdown, workers).await
        }
    }
}

async fn connect_broker(args: &BrokerArgs) -> anyhow::Result<Arc<dyn Broker>> {
    let broker = RedisBroker::connect(&args.redis_url, &args.key_prefix)
        .await
        .with_context(|| format!("failed to connect to redis at {}", args.redis_url))?;
    Ok(Arc::new(broker))
}

fn storage_client(
    args: &StorageArgs,
    fallback_root: Option<&PathBuf>,
) -> anyhow::Result<Arc<dyn StorageQueryClient>> {
    if let Some(url) = &args.ursadb_url {
        tracing::info!("Using index engine at {}", url);
        return Ok(Arc::new(HttpStorageClient::new(url)));
    }

    let root = args
        .scan_root
        .as_ref()
        .or(fallback_root)
        .context("either --ursadb-url or --scan-root is required")?;
    tracing::warn!(
        "No index engine configured, every query scans {}",
        root.display()
    );
    Ok(Arc::new(DirectoryStorage::new(root.clone())))
}

fn spawn_worker(
    broker: Arc<dyn Broker>,
    args: &WorkerArgs,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let worker = Worker::new(
        broker,
        MatcherRegistry::with_builtin(),
        Arc::new(SampleStore::new(args.samples.clone())),
        args.config(),
    );
    tracing::info!("Worker {} reading samples from {}", worker.id(), args.samples.display());
    worker.start(shutdown)
}

async fn run_scheduler(
    broker: Arc<dyn Broker>,
    storage: Arc<dyn StorageQueryClient>,
    args: &SchedulerArgs,
    shutdown: CancellationToken,
    mut handles: Vec<JoinHandle<()>>,
) -> anyhow::Result<()> {
    let scheduler = Scheduler::new(broker, storage, MatcherRegistry::with_builtin(), args.config());
    handles.extend(scheduler.clone().start(shutdown.clone()).await?);

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;

    tracing::info!("HTTP server listening on {}", args.bind);
    tracing::info!("Press Ctrl+C to shutdown");

    let stop = shutdown.clone();
    axum::serve(listener, router(scheduler))
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await?;

    shutdown.cancel();
    join_all(handles).await;
    Ok(())
}

async fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::warn!("Background task ended abnormally: {}", e);
        }
    }
    tracing::info!("Shutdown complete");
}
