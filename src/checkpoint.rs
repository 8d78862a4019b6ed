//! Checkpoints and the Checkpoint Strategy
//!
//! A checkpoint is a transaction-consistent cut across all commit-log
//! buckets, taken without global locks:
//!
//! 1. Pick a candidate time `T = now - safety_margin`. The margin covers the
//!    backing store's eventual-consistency window and is a config knob, not
//!    a constant.
//! 2. Read each bucket's watermark transactionlessly (buckets are single
//!    small records, strongly consistent by construction).
//! 3. Record `min(last_written, T)` per bucket: at or after everything fully
//!    committed before `T`, never covering a commit that might still be in
//!    flight. A transaction is never split across a checkpoint boundary.
//! 4. Persist the checkpoint and advance the checkpoint root atomically.
//!
//! Checkpoints are immutable once published and monotonic over time: a later
//! checkpoint's per-bucket times are >= the corresponding times of any
//! earlier one. That is what makes incremental diffing sound.

use crate::bucket::{BucketAssigner, BucketId};
use crate::clock::{CommitTime, TimeSource};
use crate::config::CheckpointConfig;
use crate::store::MemoryDatastore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// A point-in-time cut: the overall checkpoint time plus, per bucket, the
/// latest manifest time known fully committed as of this checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_time: CommitTime,
    pub bucket_times: BTreeMap<BucketId, CommitTime>,
}

impl Checkpoint {
    pub fn new(checkpoint_time: CommitTime, bucket_times: BTreeMap<BucketId, CommitTime>) -> Self {
        let checkpoint = Checkpoint {
            checkpoint_time,
            bucket_times,
        };
        #[cfg(debug_assertions)]
        checkpoint.verify_invariants();
        checkpoint
    }

    /// The cut time for one bucket. Buckets unknown to this checkpoint are
    /// at the beginning of time.
    pub fn bucket_time(&self, bucket: BucketId) -> CommitTime {
        self.bucket_times
            .get(&bucket)
            .copied()
            .unwrap_or(CommitTime::START_OF_TIME)
    }

    /// # Invariants
    /// - Every per-bucket time is <= the overall checkpoint time.
    #[cfg(debug_assertions)]
    pub fn verify_invariants(&self) {
        for (bucket, time) in &self.bucket_times {
            debug_assert!(
                *time <= self.checkpoint_time,
                "Invariant violated: {} time {} exceeds checkpoint time {}",
                bucket,
                time,
                self.checkpoint_time
            );
        }
    }
}

/// Error type for checkpoint operations
#[derive(Debug)]
pub enum CheckpointError {
    /// The candidate time is not after the previously published checkpoint.
    /// Benign under rapid scheduling; the next invocation retries.
    TimeNotAdvanced {
        candidate: CommitTime,
        previous: CommitTime,
    },
}

impl std::fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointError::TimeNotAdvanced {
                candidate,
                previous,
            } => write!(
                f,
                "Checkpoint candidate time {} is not after previous checkpoint {}",
                candidate, previous
            ),
        }
    }
}

impl std::error::Error for CheckpointError {}

/// Computes and publishes checkpoints.
///
/// Read-only except for the final atomic publish; a failed attempt leaves no
/// partial state, so the scheduler simply retries on the next tick.
#[derive(Clone)]
pub struct CheckpointStrategy<T: TimeSource> {
    store: MemoryDatastore,
    assigner: BucketAssigner,
    time_source: T,
    config: CheckpointConfig,
}

impl<T: TimeSource> CheckpointStrategy<T> {
    pub fn new(
        store: MemoryDatastore,
        assigner: BucketAssigner,
        time_source: T,
        config: CheckpointConfig,
    ) -> Self {
        CheckpointStrategy {
            store,
            assigner,
            time_source,
            config,
        }
    }

    /// Compute and publish one checkpoint.
    pub fn take_checkpoint(&self) -> Result<Checkpoint, CheckpointError> {
        let candidate = self
            .time_source
            .now()
            .saturating_sub(self.config.safety_margin);

        if let Some(previous) = self.store.checkpoint_root() {
            if candidate <= previous {
                return Err(CheckpointError::TimeNotAdvanced {
                    candidate,
                    previous,
                });
            }
        }

        let mut bucket_times = BTreeMap::new();
        for id in self.assigner.all_buckets() {
            let last_written = self
                .store
                .bucket(id)
                .map(|bucket| bucket.last_written)
                .unwrap_or(CommitTime::START_OF_TIME);
            bucket_times.insert(id, last_written.min(candidate));
        }

        let checkpoint = Checkpoint::new(candidate, bucket_times);
        self.store.publish_checkpoint(checkpoint.clone());

        info!(
            checkpoint_time = %checkpoint.checkpoint_time,
            buckets = checkpoint.bucket_times.len(),
            "published checkpoint"
        );

        Ok(checkpoint)
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }
}
