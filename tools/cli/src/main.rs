//! FieldSync CLI - Command line interface for the offline sync queue.
//!
//! This tool inspects and edits a local sync queue and runs the sync engine
//! against an HTTP endpoint.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fieldsync_common::ItemId;
use fieldsync_store::QueueStore;
use fieldsync_sync::{
    ConnectivityMonitor, HttpEndpoint, ManualConnectivity, NewItem, Operation, ProbeConnectivity,
    SyncConfig, SyncEvent, SyncManager, SyncStatus, TickOutcome,
};

/// How often `run` probes the endpoint for connectivity.
const PROBE_INTERVAL: Duration = Duration::from_secs(5);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "FieldSync - Offline-first sync queue")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Queue directory (default: platform data dir).
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    /// JSON sync configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a mutation.
    Enqueue {
        /// Model type, e.g. "Job".
        #[arg(short, long)]
        model: String,

        /// Operation kind.
        #[arg(short, long, value_enum)]
        operation: OperationArg,

        /// Record payload as JSON.
        #[arg(short, long)]
        data: String,
    },

    /// List queued items.
    List {
        /// Only items in this status.
        #[arg(long, value_enum)]
        status: Option<StatusArg>,

        /// Print items as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show item counts per status.
    Stats,

    /// Delete completed and/or failed items.
    Purge {
        /// Delete completed items.
        #[arg(long)]
        completed: bool,

        /// Delete failed items.
        #[arg(long)]
        failed: bool,
    },

    /// Queue failed items again.
    Retry {
        /// Item to re-queue.
        #[arg(required_unless_present = "all")]
        id: Option<String>,

        /// Re-queue every failed item.
        #[arg(long)]
        all: bool,
    },

    /// Run the sync engine.
    Run {
        /// Base URL of the sync endpoint.
        #[arg(short, long)]
        endpoint: String,

        /// Address probed for connectivity (default: the endpoint host).
        #[arg(long, conflicts_with = "assume_online")]
        probe: Option<String>,

        /// Skip connectivity probing and treat the network as always up.
        #[arg(long)]
        assume_online: bool,

        /// Drain the queue once and exit instead of syncing until Ctrl-C.
        #[arg(long)]
        once: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OperationArg {
    Create,
    Update,
    Delete,
}

impl From<OperationArg> for Operation {
    fn from(arg: OperationArg) -> Self {
        match arg {
            OperationArg::Create => Operation::Create,
            OperationArg::Update => Operation::Update,
            OperationArg::Delete => Operation::Delete,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum StatusArg {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl From<StatusArg> for SyncStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Pending => SyncStatus::Pending,
            StatusArg::Processing => SyncStatus::Processing,
            StatusArg::Completed => SyncStatus::Completed,
            StatusArg::Failed => SyncStatus::Failed,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG overrides --verbose
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let store_dir = match cli.store {
        Some(dir) => dir,
        None => default_store_dir()?,
    };
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Enqueue {
            model,
            operation,
            data,
        } => cmd_enqueue(&store_dir, config, &model, operation.into(), &data).await,

        Commands::List { status, json } => {
            cmd_list(&store_dir, config, status.map(Into::into), json).await
        }

        Commands::Stats => cmd_stats(&store_dir, config).await,

        Commands::Purge { completed, failed } => {
            cmd_purge(&store_dir, config, completed, failed).await
        }

        Commands::Retry { id, all } => cmd_retry(&store_dir, config, id.as_deref(), all).await,

        Commands::Run {
            endpoint,
            probe,
            assume_online,
            once,
        } => cmd_run(&store_dir, config, &endpoint, probe, assume_online, once).await,
    }
}

fn default_store_dir() -> Result<PathBuf> {
    let base = dirs::data_local_dir().context("Could not determine local data directory")?;
    Ok(base.join("fieldsync").join("queue"))
}

fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    let Some(path) = path else {
        return Ok(SyncConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    SyncConfig::from_json(&json).with_context(|| format!("Invalid config {}", path.display()))
}

fn open_store(store_dir: &Path) -> Result<Arc<dyn QueueStore>> {
    let store_config = serde_json::json!({
        "root": store_dir.to_string_lossy()
    });
    fieldsync_store::open_store("local", &store_config).context("Failed to open queue store")
}

/// Open a manager that never transmits, for queue maintenance.
fn open_offline(store_dir: &Path, config: SyncConfig) -> Result<SyncManager> {
    let endpoint = HttpEndpoint::new("http://localhost/").context("Invalid endpoint")?;
    let manager = SyncManager::new(
        open_store(store_dir)?,
        Arc::new(endpoint),
        Arc::new(ManualConnectivity::offline()),
        config,
    )
    .context("Invalid sync configuration")?;
    Ok(manager)
}

/// Queue a mutation.
async fn cmd_enqueue(
    store_dir: &Path,
    config: SyncConfig,
    model: &str,
    operation: Operation,
    data: &str,
) -> Result<()> {
    let data: serde_json::Value = serde_json::from_str(data).context("Payload is not valid JSON")?;
    let manager = open_offline(store_dir, config)?;

    let id = manager
        .add_to_sync_queue(NewItem::new(model, operation, data))
        .await
        .context("Failed to queue mutation")?;

    println!("{}", id);
    Ok(())
}

/// List queued items.
async fn cmd_list(
    store_dir: &Path,
    config: SyncConfig,
    status: Option<SyncStatus>,
    json: bool,
) -> Result<()> {
    let manager = open_offline(store_dir, config)?;
    let items = manager
        .list_items(status)
        .await
        .context("Failed to list queue")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if items.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    for item in items {
        let error = item
            .last_error
            .as_deref()
            .map(|e| format!("  ({})", e))
            .unwrap_or_default();
        println!(
            "{}  {:<10}  {:<6}  {:<12}  retries={}  {}{}",
            item.id,
            item.status.as_str(),
            item.operation.as_str(),
            item.model_type,
            item.retry_count,
            item.timestamp.format("%Y-%m-%d %H:%M:%S"),
            error
        );
    }
    Ok(())
}

/// Show counts per status.
async fn cmd_stats(store_dir: &Path, config: SyncConfig) -> Result<()> {
    let manager = open_offline(store_dir, config)?;
    let stats = manager.stats().await.context("Failed to read queue")?;

    println!("Queue: {}", store_dir.display());
    println!("  Pending:    {}", stats.pending);
    println!("  Processing: {}", stats.processing);
    println!("  Completed:  {}", stats.completed);
    println!("  Failed:     {}", stats.failed);
    println!("  Total:      {}", stats.total());
    Ok(())
}

/// Delete terminal items.
async fn cmd_purge(store_dir: &Path, config: SyncConfig, completed: bool, failed: bool) -> Result<()> {
    let statuses = match (completed, failed) {
        (true, false) => vec![SyncStatus::Completed],
        (false, true) => vec![SyncStatus::Failed],
        _ => vec![SyncStatus::Completed, SyncStatus::Failed],
    };

    let manager = open_offline(store_dir, config)?;
    let purged = manager
        .purge(&statuses)
        .await
        .context("Failed to purge queue")?;

    println!("Purged {} item(s).", purged);
    Ok(())
}

/// Re-queue failed items.
async fn cmd_retry(store_dir: &Path, config: SyncConfig, id: Option<&str>, all: bool) -> Result<()> {
    let manager = open_offline(store_dir, config)?;

    let ids = if all {
        manager
            .list_items(Some(SyncStatus::Failed))
            .await
            .context("Failed to list queue")?
            .into_iter()
            .map(|item| item.id)
            .collect()
    } else {
        let id = id.context("An item id or --all is required")?;
        vec![ItemId::new(id).context("Invalid item id")?]
    };

    for id in ids {
        let requeued = manager
            .requeue_failed(&id)
            .await
            .with_context(|| format!("Failed to re-queue {}", id))?;
        println!("{} -> {}", id, requeued);
    }
    Ok(())
}

/// Run the engine.
async fn cmd_run(
    store_dir: &Path,
    config: SyncConfig,
    endpoint: &str,
    probe: Option<String>,
    assume_online: bool,
    once: bool,
) -> Result<()> {
    let endpoint = HttpEndpoint::new(endpoint).context("Invalid endpoint URL")?;

    let connectivity: Arc<dyn ConnectivityMonitor> = if assume_online {
        Arc::new(ManualConnectivity::online())
    } else {
        let target = match probe {
            Some(probe) => probe,
            None => {
                let (host, port) = endpoint
                    .socket_addr_hint()
                    .context("Endpoint URL has no host to probe")?;
                format!("{}:{}", host, port)
            }
        };
        let addr = tokio::net::lookup_host(&target)
            .await
            .with_context(|| format!("Failed to resolve {}", target))?
            .next()
            .with_context(|| format!("No address for {}", target))?;
        info!("Probing {} for connectivity", addr);
        Arc::new(ProbeConnectivity::spawn(addr, PROBE_INTERVAL, PROBE_TIMEOUT))
    };

    let manager = SyncManager::new(
        open_store(store_dir)?,
        Arc::new(endpoint),
        connectivity.clone(),
        config,
    )
    .context("Invalid sync configuration")?;

    let recovered = manager.init().await.context("Failed to initialise queue")?;
    if recovered > 0 {
        info!("Recovered {} interrupted item(s)", recovered);
    }

    let mut events = manager.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Dropped {} event(s)", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    if once {
        if !assume_online {
            // Give the first probe a chance to land
            let mut changes = connectivity.subscribe();
            let _ = tokio::time::timeout(PROBE_TIMEOUT * 2, changes.wait_for(|c| c.is_online())).await;
        }
        loop {
            match manager.sync_now().await.context("Sync failed")? {
                TickOutcome::Processed(_) => continue,
                TickOutcome::Offline => {
                    println!("Offline; nothing sent.");
                    break;
                }
                TickOutcome::Empty | TickOutcome::Overlapping => break,
            }
        }
    } else {
        manager.start_sync();
        println!("Syncing every {:?}. Press Ctrl-C to stop.", manager.config().sync_interval);
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        println!("\nStopping...");
    }

    manager.dispose().await;
    printer.abort();

    let stats = manager.stats().await.context("Failed to read queue")?;
    println!(
        "Pending: {}, completed: {}, failed: {}",
        stats.pending, stats.completed, stats.failed
    );
    Ok(())
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::ItemCompleted(e) => {
            println!("[completed] {} {} {}", e.item.id, e.item.operation, e.item.model_type);
        }
        SyncEvent::Error(e) => {
            let item = e
                .item_id
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "-".to_string());
            let retry = if e.will_retry { "will retry" } else { "gave up" };
            println!("[error] {} {:?}: {} ({})", item, e.source, e.message, retry);
        }
        SyncEvent::ConflictResolved(e) => {
            println!(
                "[conflict] {} resolved by {}: {:?} wins",
                e.item_id, e.strategy, e.winner
            );
        }
        SyncEvent::BatchProcessed(e) => {
            println!(
                "[batch] {} item(s) in {:?}: {} completed, {} retried, {} failed",
                e.count, e.duration, e.completed, e.retried, e.failed
            );
        }
    }
}
