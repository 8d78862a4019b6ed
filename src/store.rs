//! In-Memory Datastore Model
//!
//! Models the backing key-value store the commit log is layered on: strongly
//! consistent within a single entity group, with small single-record reads
//! (bucket watermarks, the checkpoint root) strongly consistent by
//! construction.
//!
//! Business entities and commit-log tables (buckets, manifests, mutations,
//! checkpoints) live behind one `parking_lot` lock; a commit holds the write
//! guard for its whole check-then-apply sequence, which is what gives the
//! commit-log append atomicity with the business mutation.
//!
//! There is no ambient "current transaction": callers buffer their saves and
//! deletes in an explicit [`Transaction`] and hand it to the transaction
//! runner, which applies it through a [`WriteTxn`] guard.

use crate::bucket::{Bucket, BucketId};
use crate::checkpoint::Checkpoint;
use crate::clock::CommitTime;
use crate::commitlog::{ManifestRecord, MutationRecord};
use crate::entity::{EntityKey, GroupId, RawEntity};
use parking_lot::{RwLock, RwLockWriteGuard};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;

/// Error type for datastore operations
#[derive(Debug)]
pub enum StoreError {
    /// A transaction touched an entity outside its group
    CrossGroup { txn_group: GroupId, key: EntityKey },
    /// Transient storage unavailability (retryable)
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::CrossGroup { txn_group, key } => write!(
                f,
                "Transaction on group {} may not touch entity {}",
                txn_group, key
            ),
            StoreError::Unavailable(msg) => write!(f, "Datastore unavailable: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl StoreError {
    /// Whether this error kind is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Buffered saves and deletes for one single-group transaction.
///
/// Nothing is applied until the transaction runner commits the buffer.
/// The last call wins per key: saving a key cancels an earlier delete of it
/// in the same transaction, and vice versa.
#[derive(Debug)]
pub struct Transaction {
    group: GroupId,
    saves: BTreeMap<EntityKey, Vec<u8>>,
    deletes: BTreeSet<EntityKey>,
}

impl Transaction {
    pub fn new(group: GroupId) -> Self {
        Transaction {
            group,
            saves: BTreeMap::new(),
            deletes: BTreeSet::new(),
        }
    }

    pub fn group(&self) -> &GroupId {
        &self.group
    }

    /// Buffer an entity save.
    pub fn save(&mut self, entity: RawEntity) -> Result<(), StoreError> {
        self.check_group(&entity.key)?;
        self.deletes.remove(&entity.key);
        self.saves.insert(entity.key.clone(), entity.bytes);
        Ok(())
    }

    /// Buffer an entity delete.
    ///
    /// Unlike saves, deletes may name keys outside the transaction's group:
    /// the tombstone is recorded in this transaction's manifest and applied
    /// wherever the key lives.
    pub fn delete(&mut self, key: EntityKey) -> Result<(), StoreError> {
        self.saves.remove(&key);
        self.deletes.insert(key);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.saves.is_empty() && self.deletes.is_empty()
    }

    pub(crate) fn into_parts(self) -> (Vec<RawEntity>, Vec<EntityKey>) {
        let saves = self
            .saves
            .into_iter()
            .map(|(key, bytes)| RawEntity::new(key, bytes))
            .collect();
        let deletes = self.deletes.into_iter().collect();
        (saves, deletes)
    }

    fn check_group(&self, key: &EntityKey) -> Result<(), StoreError> {
        if key.group != self.group {
            return Err(StoreError::CrossGroup {
                txn_group: self.group.clone(),
                key: key.clone(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
struct StoreInner {
    entities: BTreeMap<EntityKey, Vec<u8>>,
    /// Last commit time per entity-group root
    group_watermarks: HashMap<GroupId, CommitTime>,
    /// Last commit time per bucket (buckets are created lazily)
    buckets: BTreeMap<BucketId, CommitTime>,
    /// Manifests keyed by (bucket, commit time)
    manifests: BTreeMap<(BucketId, CommitTime), ManifestRecord>,
    /// Mutations keyed by (bucket, manifest time, stringified entity key)
    mutations: BTreeMap<(BucketId, CommitTime, String), MutationRecord>,
    checkpoints: BTreeMap<CommitTime, Checkpoint>,
    checkpoint_root: Option<CommitTime>,
}

/// Shared-handle in-memory datastore. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryDatastore {
    inner: Arc<RwLock<StoreInner>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        MemoryDatastore {
            inner: Arc::new(RwLock::new(StoreInner::default())),
        }
    }

    /// Begin an atomic write: all operations on the returned guard apply
    /// under one lock acquisition and become visible together on drop.
    pub fn begin_write(&self) -> WriteTxn<'_> {
        WriteTxn {
            guard: self.inner.write(),
        }
    }

    // ------------------------------------------------------------------
    // Business entities
    // ------------------------------------------------------------------

    pub fn get_entity(&self, key: &EntityKey) -> Option<Vec<u8>> {
        self.inner.read().entities.get(key).cloned()
    }

    pub fn entity_count(&self) -> usize {
        self.inner.read().entities.len()
    }

    /// All entity keys, sorted. Intended for tests and verification.
    pub fn entity_keys(&self) -> Vec<EntityKey> {
        self.inner.read().entities.keys().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Watermarks
    // ------------------------------------------------------------------

    /// Strongly consistent read of a bucket record (buckets are single
    /// small records, so this needs no transaction). `None` until the
    /// bucket receives its first commit — buckets are created lazily.
    pub fn bucket(&self, id: BucketId) -> Option<Bucket> {
        self.inner
            .read()
            .buckets
            .get(&id)
            .map(|&last_written| Bucket { id, last_written })
    }

    /// The bucket's watermark, if the bucket exists yet.
    pub fn bucket_watermark(&self, bucket: BucketId) -> Option<CommitTime> {
        self.bucket(bucket).map(|b| b.last_written)
    }

    pub fn group_watermark(&self, group: &GroupId) -> Option<CommitTime> {
        self.inner.read().group_watermarks.get(group).copied()
    }

    // ------------------------------------------------------------------
    // Commit log
    // ------------------------------------------------------------------

    /// Manifest commit times for one bucket in `[from, to)`, ascending.
    ///
    /// Ids only: this is the cheap enumeration pass the exporter sorts and
    /// batches before loading full records.
    pub fn manifest_times_in_range(
        &self,
        bucket: BucketId,
        from: CommitTime,
        to: CommitTime,
    ) -> Vec<CommitTime> {
        let inner = self.inner.read();
        inner
            .manifests
            .range((
                Bound::Included((bucket, from)),
                Bound::Excluded((bucket, to)),
            ))
            .map(|((_, time), _)| *time)
            .collect()
    }

    pub fn manifest(&self, bucket: BucketId, time: CommitTime) -> Option<ManifestRecord> {
        self.inner.read().manifests.get(&(bucket, time)).cloned()
    }

    /// All mutations under one manifest, ordered by stringified entity key.
    pub fn mutations_for_manifest(
        &self,
        bucket: BucketId,
        time: CommitTime,
    ) -> Vec<MutationRecord> {
        let inner = self.inner.read();
        inner
            .mutations
            .range((
                Bound::Included((bucket, time, String::new())),
                Bound::Excluded((bucket, time.next(), String::new())),
            ))
            .map(|(_, record)| record.clone())
            .collect()
    }

    pub fn manifest_count(&self) -> usize {
        self.inner.read().manifests.len()
    }

    pub fn mutation_count(&self) -> usize {
        self.inner.read().mutations.len()
    }

    /// Manifest ids strictly older than `floor`, oldest first, at most
    /// `limit`. Used by the pruner's scan-and-batch-delete loop.
    pub fn manifests_older_than(
        &self,
        floor: CommitTime,
        limit: usize,
    ) -> Vec<(BucketId, CommitTime)> {
        let inner = self.inner.read();
        let mut ids: Vec<(BucketId, CommitTime)> = inner
            .manifests
            .keys()
            .filter(|(_, time)| *time < floor)
            .copied()
            .collect();
        // Oldest first across buckets, bucket id as tie-break
        ids.sort_by_key(|(bucket, time)| (*time, *bucket));
        ids.truncate(limit);
        ids
    }

    /// Delete one manifest and its child mutations. Returns whether the
    /// manifest existed.
    pub fn delete_manifest(
        &self,
        bucket: BucketId,
        time: CommitTime,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let existed = inner.manifests.remove(&(bucket, time)).is_some();
        let child_keys: Vec<(BucketId, CommitTime, String)> = inner
            .mutations
            .range((
                Bound::Included((bucket, time, String::new())),
                Bound::Excluded((bucket, time.next(), String::new())),
            ))
            .map(|(key, _)| key.clone())
            .collect();
        for key in child_keys {
            inner.mutations.remove(&key);
        }
        Ok(existed)
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    /// Persist a checkpoint and advance the checkpoint root in one atomic
    /// write. Checkpoints are immutable once published.
    pub fn publish_checkpoint(&self, checkpoint: Checkpoint) {
        let mut inner = self.inner.write();
        inner
            .checkpoints
            .insert(checkpoint.checkpoint_time, checkpoint);
        let published = inner
            .checkpoints
            .keys()
            .next_back()
            .copied()
            .expect("checkpoint map is non-empty after insert");
        inner.checkpoint_root = Some(published);
    }

    pub fn checkpoint_at(&self, time: CommitTime) -> Option<Checkpoint> {
        self.inner.read().checkpoints.get(&time).cloned()
    }

    pub fn latest_checkpoint(&self) -> Option<Checkpoint> {
        self.inner
            .read()
            .checkpoints
            .values()
            .next_back()
            .cloned()
    }

    /// The most recently published checkpoint time (the resume point for
    /// the next export).
    pub fn checkpoint_root(&self) -> Option<CommitTime> {
        self.inner.read().checkpoint_root
    }
}

/// Write guard over the whole store. Everything done through one guard
/// commits atomically when the guard is dropped; aborting is returning
/// before mutating.
pub struct WriteTxn<'a> {
    guard: RwLockWriteGuard<'a, StoreInner>,
}

impl WriteTxn<'_> {
    pub fn group_watermark(&self, group: &GroupId) -> Option<CommitTime> {
        self.guard.group_watermarks.get(group).copied()
    }

    pub fn bucket_watermark(&self, bucket: BucketId) -> Option<CommitTime> {
        self.guard.buckets.get(&bucket).copied()
    }

    pub fn manifest_exists(&self, bucket: BucketId, time: CommitTime) -> bool {
        self.guard.manifests.contains_key(&(bucket, time))
    }

    pub fn save_entity(&mut self, entity: RawEntity) {
        self.guard.entities.insert(entity.key, entity.bytes);
    }

    pub fn delete_entity(&mut self, key: &EntityKey) {
        self.guard.entities.remove(key);
    }

    pub fn put_manifest(&mut self, manifest: ManifestRecord) {
        self.guard
            .manifests
            .insert((manifest.bucket, manifest.commit_time), manifest);
    }

    pub fn put_mutation(&mut self, mutation: MutationRecord) {
        let key = (
            mutation.bucket,
            mutation.manifest_time,
            mutation.entity.key.encode(),
        );
        self.guard.mutations.insert(key, mutation);
    }

    pub fn set_bucket_watermark(&mut self, bucket: BucketId, time: CommitTime) {
        self.guard.buckets.insert(bucket, time);
    }

    pub fn set_group_watermark(&mut self, group: GroupId, time: CommitTime) {
        self.guard.group_watermarks.insert(group, time);
    }

    pub fn set_checkpoint_root(&mut self, time: CommitTime) {
        self.guard.checkpoint_root = Some(time);
    }
}
