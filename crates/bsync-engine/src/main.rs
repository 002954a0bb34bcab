#![warn(missing_docs)]

//! `bsync`: run synchronization cycles between two file-backed replicas.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bsync_engine::{
    BundleStore, Clock, Collection, FileKeyValueStore, LocalRepository, LogFormat, MemoryRepository,
    MemoryStorageAdapter, Record, ReplicaSide, StorageAdapter, SyncConfig, SynchronizeOutcome,
    Synchronizer,
    SystemClock,
};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "bsync")]
#[command(about = "Bidirectional browser data synchronization", long_about = None)]
struct Cli {
    #[arg(short, long, env = "BSYNC_CONFIG", default_value = "bsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one cycle per collection.
    Sync {
        /// Only this collection.
        #[arg(short, long)]
        collection: Option<String>,
    },
    /// Print the saved bundles.
    Status,
}

fn init_tracing(format: LogFormat) {
    let registry = tracing_subscriber::registry().with(EnvFilter::from_default_env());
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = if cli.config.exists() {
        SyncConfig::from_file(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        SyncConfig::default()
    };
    init_tracing(config.log_format);
    if !cli.config.exists() {
        warn!("Config file not found, using defaults: {}", cli.config.display());
    }

    let kv = FileKeyValueStore::open(&config.state_path)?;
    let bundles = BundleStore::new(Arc::new(kv));

    match cli.command {
        Command::Status => {
            for collection in collections(&config, None)? {
                let remote = bundles.load_bundle(collection, ReplicaSide::Remote)?;
                let local = bundles.load_bundle(collection, ReplicaSide::Local)?;
                println!(
                    "{:<10} remote={:<15} local={}",
                    collection, remote.timestamp, local.timestamp
                );
            }
            Ok(())
        }
        Command::Sync { collection } => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupted, aborting the running cycle");
                    on_signal.cancel();
                }
            });

            let mut failed = 0;
            for collection in collections(&config, collection.as_deref())? {
                match sync_collection(&config, &bundles, collection, cancel.clone()).await? {
                    SynchronizeOutcome::Failed(_) => failed += 1,
                    SynchronizeOutcome::Aborted => break,
                    _ => {}
                }
            }
            if failed > 0 {
                bail!("{} collection(s) failed to synchronize", failed);
            }
            Ok(())
        }
    }
}

fn collections(config: &SyncConfig, only: Option<&str>) -> Result<Vec<Collection>> {
    if let Some(name) = only {
        return match Collection::from_name(name) {
            Some(c) => Ok(vec![c]),
            None => bail!("unknown collection: {}", name),
        };
    }
    if config.collections.is_empty() {
        return Ok(Collection::ALL.to_vec());
    }
    Ok(config.collections.iter().map(|c| c.name).collect())
}

async fn sync_collection(
    config: &SyncConfig,
    bundles: &BundleStore,
    collection: Collection,
    cancel: CancellationToken,
) -> Result<SynchronizeOutcome> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let remote =
        MemoryRepository::new(collection, clock.clone()).with_options(config.session_options());
    for record in read_fixture(&config.remote_fixture(collection), collection)? {
        remote.seed(record);
    }

    let mut adapter = MemoryStorageAdapter::new(collection);
    if collection.is_hierarchical() {
        adapter.ensure_roots()?;
    }
    for record in read_fixture(&config.local_fixture(collection), collection)? {
        adapter.seed(record);
    }
    let local = Arc::new(
        LocalRepository::new(adapter, clock).with_options(config.local_options(collection)),
    );

    let synchronizer = Synchronizer::new(
        Arc::new(remote.clone()),
        local.clone(),
        bundles.clone(),
        config.sync_options(collection),
    )?;
    let outcome = synchronizer.synchronize_with(cancel).await;

    if let SynchronizeOutcome::Synchronized(stats) = &outcome {
        write_fixture(&config.remote_fixture(collection), &remote.records())?;
        write_fixture(&config.local_fixture(collection), &local.with_adapter(|a| a.records()))?;
        info!(
            collection = %collection,
            inbound_failures = stats.remote_to_local.failed_guids.len(),
            outbound_failures = stats.local_to_remote.failed_guids.len(),
            "replicas written"
        );
    }
    Ok(outcome)
}

/// Records in `path`, or none if the file does not exist.
fn read_fixture(path: &Path, collection: Collection) -> Result<Vec<Record>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    let records: Vec<Record> =
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
    if let Some(stray) = records.iter().find(|r| r.collection != collection) {
        bail!("{}: record {} belongs to {}", path.display(), stray.guid, stray.collection);
    }
    Ok(records)
}

fn write_fixture(path: &Path, records: &[Record]) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(records)?)?;
    Ok(())
}
