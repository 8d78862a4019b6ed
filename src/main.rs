//! chronicled - commit-log engine daemon
//!
//! Wires the commit-log engine together and runs:
//! - the periodic checkpoint strategy
//! - the periodic stale-log pruner
//! - the admin server with the export/restore trigger endpoints
//!
//! Configuration comes from a TOML file named by `CHRONICLE_CONFIG` (or the
//! first CLI argument); defaults apply when neither is set. Exported diffs
//! go to the directory named by `CHRONICLE_BLOB_PATH` (default `./blobs`).

use chronicle::{
    AdminServer, AdminState, BucketAssigner, CheckpointError, CheckpointStrategy, ChronicleConfig,
    DiffExporter, LocalFsBlobStore, MemoryDatastore, Restorer, StaleLogPruner, SystemTimeSource,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_BLOB_PATH: &str = "./blobs";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    info!(
        buckets = config.bucket_count,
        admin_addr = %config.admin_addr,
        "starting chronicled"
    );

    let blob_path = std::env::var("CHRONICLE_BLOB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_BLOB_PATH));

    let time_source = SystemTimeSource::new();
    let store = MemoryDatastore::new();
    let assigner = BucketAssigner::new(config.bucket_count)?;
    let blobs = Arc::new(LocalFsBlobStore::new(blob_path));

    let strategy = CheckpointStrategy::new(
        store.clone(),
        assigner,
        time_source.clone(),
        config.checkpoint.clone(),
    );
    let pruner = StaleLogPruner::new(
        store.clone(),
        time_source,
        config.prune.clone(),
        config.retry.clone(),
    );
    let exporter = DiffExporter::new(
        store.clone(),
        blobs.clone(),
        config.export.clone(),
        config.retry.clone(),
    );
    let restorer = Restorer::new(
        store.clone(),
        blobs,
        config.export.prefix.clone(),
        config.retry.clone(),
    );

    // Periodic checkpointing
    let checkpoint_interval = config.checkpoint.interval;
    let checkpoint_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(checkpoint_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match strategy.take_checkpoint() {
                Ok(_) => {}
                Err(CheckpointError::TimeNotAdvanced { .. }) => {
                    // Scheduled too tightly; the next tick will succeed.
                }
            }
        }
    });

    // Periodic pruning
    let prune_interval = config.prune.interval;
    let prune_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(prune_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = pruner.prune().await {
                warn!("prune pass failed: {}", e);
            }
        }
    });

    let state = Arc::new(AdminState {
        store,
        exporter,
        restorer,
    });
    let server = AdminServer::bind(&config.admin_addr, state).await?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("admin server exited: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    checkpoint_task.abort();
    prune_task.abort();
    Ok(())
}

fn load_config() -> Result<ChronicleConfig, Box<dyn std::error::Error + Send + Sync>> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CHRONICLE_CONFIG").ok());
    match path {
        Some(path) => {
            let config = ChronicleConfig::load(std::path::Path::new(&path))?;
            info!(config_path = %path, "loaded configuration");
            Ok(config)
        }
        None => {
            let config = ChronicleConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}
