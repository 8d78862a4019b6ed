//! Transactional Commit Log and Point-in-Time Recovery
//!
//! Gives an eventually-consistent key-value datastore transaction-level
//! durability and point-in-time recoverability:
//!
//! ```text
//! mutation → TransactionRunner (commit log, same transaction)
//!          → CheckpointStrategy (periodic, transaction-consistent cut)
//!          → DiffExporter (checkpoint pair → framed blob)
//!          → [disaster] → Restorer (replay diffs in order)
//! ```
//!
//! Entity groups hash to a fixed set of commit-log buckets; each bucket
//! carries a watermark of its latest durable commit. Checkpoints cut across
//! bucket watermarks without global locks, exports diff two checkpoints
//! into blob storage, and the pruner retires logs past the retention window
//! once they are safely exported.

pub mod admin;
pub mod blobstore;
pub mod bucket;
pub mod checkpoint;
pub mod clock;
pub mod commitlog;
pub mod config;
pub mod entity;
pub mod export;
pub mod frame;
pub mod prune;
pub mod restore;
pub mod retry;
#[cfg(feature = "s3")]
pub mod s3_store;
pub mod store;

pub use admin::{AdminServer, AdminState};
pub use blobstore::{BlobMeta, BlobStore, InMemoryBlobStore, LocalFsBlobStore};
pub use bucket::{Bucket, BucketAssigner, BucketConfigError, BucketId};
pub use checkpoint::{Checkpoint, CheckpointError, CheckpointStrategy};
pub use clock::{CommitClock, CommitTime, SimulatedTimeSource, SystemTimeSource, TimeSource};
pub use commitlog::{
    CommitLogError, CommitResult, ManifestRecord, MutationRecord, TransactionRunner,
};
pub use config::{CheckpointConfig, ChronicleConfig, ConfigError, ExportConfig, PruneConfig};
pub use entity::{EntityKey, GroupId, KeyError, RawEntity};
pub use export::{DiffExporter, ExportError, ExportResult};
pub use frame::{DiffReader, DiffRecord, DiffWriter, FrameError};
pub use prune::{PruneError, PruneResult, StaleLogPruner};
pub use restore::{DiffFile, DiffLister, RestoreError, RestoreResult, Restorer};
pub use retry::{retry, retry_logged, RetryAttempt, RetryPolicy};
#[cfg(feature = "s3")]
pub use s3_store::S3BlobStore;
pub use store::{MemoryDatastore, StoreError, Transaction};
