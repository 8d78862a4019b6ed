//! Stale-Log Pruner
//!
//! Commit-log manifests and their mutations are only needed until they are
//! safely exported and outside the retention window. The pruner deletes
//! manifests older than BOTH `now - retention_window` and the most recent
//! exported checkpoint, as a scan-and-batch-delete job.
//!
//! Coordination with the exporter is by invariant, not locks: the deletion
//! floor never passes the last published checkpoint, so an un-exported
//! range can never lose data to pruning. The pruner runs off the write path
//! entirely.

use crate::clock::{CommitTime, TimeSource};
use crate::config::PruneConfig;
use crate::retry::{retry_logged, RetryPolicy};
use crate::store::{MemoryDatastore, StoreError};
use tracing::{debug, info};

/// Error type for prune operations
#[derive(Debug)]
pub enum PruneError {
    /// Datastore error (after retries)
    Store(StoreError),
}

impl std::fmt::Display for PruneError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PruneError::Store(e) => write!(f, "Datastore error: {}", e),
        }
    }
}

impl std::error::Error for PruneError {}

/// Result of one prune run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneResult {
    pub manifests_deleted: usize,
    pub batches: usize,
    /// Deletion floor used for this run; manifests at or after it survive
    pub floor: CommitTime,
}

/// Deletes commit logs no longer needed for recovery.
#[derive(Clone)]
pub struct StaleLogPruner<T: TimeSource> {
    store: MemoryDatastore,
    time_source: T,
    config: PruneConfig,
    retry: RetryPolicy,
}

impl<T: TimeSource> StaleLogPruner<T> {
    pub fn new(
        store: MemoryDatastore,
        time_source: T,
        config: PruneConfig,
        retry: RetryPolicy,
    ) -> Self {
        debug_assert!(
            config.batch_size >= 1,
            "Precondition: prune batch size must be at least 1"
        );
        StaleLogPruner {
            store,
            time_source,
            config,
            retry,
        }
    }

    /// The time before which manifests are prunable.
    ///
    /// Without a published checkpoint nothing has been exported yet, so
    /// nothing is prunable.
    fn deletion_floor(&self) -> CommitTime {
        let retention_floor = self
            .time_source
            .now()
            .saturating_sub(self.config.retention_window);
        let export_floor = self
            .store
            .checkpoint_root()
            .unwrap_or(CommitTime::START_OF_TIME);
        retention_floor.min(export_floor)
    }

    /// Run one prune pass to completion.
    pub async fn prune(&self) -> Result<PruneResult, PruneError> {
        let floor = self.deletion_floor();
        let mut result = PruneResult {
            floor,
            ..PruneResult::default()
        };

        loop {
            let batch = self
                .store
                .manifests_older_than(floor, self.config.batch_size);
            if batch.is_empty() {
                break;
            }
            result.batches += 1;

            for (bucket, time) in batch {
                let deleted = retry_logged(
                    &self.retry,
                    "prune_delete_manifest",
                    StoreError::is_transient,
                    |_| {
                        let store = self.store.clone();
                        async move { store.delete_manifest(bucket, time) }
                    },
                )
                .await
                .map_err(PruneError::Store)?;

                if deleted {
                    result.manifests_deleted += 1;
                }
            }

            debug!(
                batch = result.batches,
                deleted = result.manifests_deleted,
                "pruned commit-log batch"
            );
        }

        if result.manifests_deleted > 0 {
            info!(
                manifests_deleted = result.manifests_deleted,
                floor = %floor,
                "pruned stale commit logs"
            );
        }
        Ok(result)
    }
}
