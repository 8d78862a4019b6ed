//! Commit-Log Buckets and the Bucket Assigner
//!
//! Every top-level entity group is assigned to exactly one of a fixed number
//! of commit-log buckets. Buckets bound checkpoint fan-out: a checkpoint
//! reads one watermark per bucket rather than one per entity group.
//!
//! Assignment is a pure FNV-1a hash of the group id modulo the bucket count.
//! FNV is deterministic across processes, which is load-bearing here: a
//! group's per-group ordering is only discoverable through a single bucket's
//! manifest sequence, so the mapping must never change for a given id.

use crate::clock::CommitTime;
use crate::entity::GroupId;
use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use std::hash::Hasher;

/// Identifier of a commit-log bucket, in `1..=bucket_count`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BucketId(pub u32);

impl std::fmt::Display for BucketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bucket-{}", self.0)
    }
}

/// A commit-log bucket and its watermark.
///
/// Created lazily on first write, mutated by every commit it receives,
/// never deleted. `last_written` is the latest commit time known durable
/// for this bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub id: BucketId,
    pub last_written: CommitTime,
}

/// Error constructing a bucket assigner
#[derive(Debug, PartialEq, Eq)]
pub enum BucketConfigError {
    /// Bucket count must be at least 1
    ZeroBuckets,
}

impl std::fmt::Display for BucketConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BucketConfigError::ZeroBuckets => write!(f, "Bucket count must be at least 1"),
        }
    }
}

impl std::error::Error for BucketConfigError {}

/// Deterministically maps entity groups to buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketAssigner {
    bucket_count: u32,
}

impl BucketAssigner {
    /// Create an assigner over a fixed bucket count.
    ///
    /// A zero bucket count is a fatal configuration error, not a default.
    pub fn new(bucket_count: u32) -> Result<Self, BucketConfigError> {
        if bucket_count == 0 {
            return Err(BucketConfigError::ZeroBuckets);
        }
        Ok(BucketAssigner { bucket_count })
    }

    /// The bucket a group's commit logs live in.
    ///
    /// Pure and stable: the same id always lands in the same bucket, across
    /// calls and across process restarts.
    pub fn bucket_for(&self, group: &GroupId) -> BucketId {
        let mut hasher = FnvHasher::default();
        hasher.write(group.as_str().as_bytes());
        let bucket = (hasher.finish() % u64::from(self.bucket_count)) as u32 + 1;

        debug_assert!(
            bucket >= 1 && bucket <= self.bucket_count,
            "Postcondition: bucket id {} out of range 1..={}",
            bucket,
            self.bucket_count
        );

        BucketId(bucket)
    }

    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    /// All bucket ids, in ascending order.
    pub fn all_buckets(&self) -> impl Iterator<Item = BucketId> {
        (1..=self.bucket_count).map(BucketId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_bucket_count_is_fatal() {
        assert_eq!(BucketAssigner::new(0), Err(BucketConfigError::ZeroBuckets));
    }

    #[test]
    fn test_assignment_stable_across_calls() {
        let assigner = BucketAssigner::new(3).unwrap();
        let group = GroupId::new("example.test");

        let first = assigner.bucket_for(&group);
        for _ in 0..100 {
            assert_eq!(assigner.bucket_for(&group), first);
        }
    }

    #[test]
    fn test_assignment_stable_across_instances() {
        // A fresh assigner (as after a process restart) must agree.
        let a = BucketAssigner::new(7).unwrap();
        let b = BucketAssigner::new(7).unwrap();

        for i in 0..50 {
            let group = GroupId::new(format!("group-{}", i));
            assert_eq!(a.bucket_for(&group), b.bucket_for(&group));
        }
    }

    #[test]
    fn test_assignment_in_range() {
        let assigner = BucketAssigner::new(5).unwrap();
        for i in 0..200 {
            let bucket = assigner.bucket_for(&GroupId::new(format!("g{}", i)));
            assert!(bucket.0 >= 1 && bucket.0 <= 5);
        }
    }

    #[test]
    fn test_assignment_spreads_groups() {
        let assigner = BucketAssigner::new(4).unwrap();
        let mut seen = std::collections::HashSet::new();
        for i in 0..100 {
            seen.insert(assigner.bucket_for(&GroupId::new(format!("g{}", i))));
        }
        assert!(
            seen.len() > 1,
            "100 groups should not all hash to one bucket"
        );
    }

    #[test]
    fn test_single_bucket() {
        let assigner = BucketAssigner::new(1).unwrap();
        assert_eq!(assigner.bucket_for(&GroupId::new("anything")), BucketId(1));
        assert_eq!(assigner.all_buckets().collect::<Vec<_>>(), vec![BucketId(1)]);
    }

    #[test]
    fn test_all_buckets_ascending() {
        let assigner = BucketAssigner::new(3).unwrap();
        let ids: Vec<u32> = assigner.all_buckets().map(|b| b.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
