//! End-to-end backup flow: commit-logged writes → checkpoints → export →
//! restore, exercising the round-trip and idempotence guarantees.

use chronicle::{
    BucketAssigner, BucketId, Checkpoint, CheckpointConfig, CheckpointStrategy, CommitClock,
    CommitTime, DiffExporter, EntityKey, ExportConfig, GroupId, InMemoryBlobStore,
    MemoryDatastore, RawEntity, RestoreResult, Restorer, RetryPolicy, SimulatedTimeSource,
    TransactionRunner,
};
use std::sync::Arc;

struct Source {
    store: MemoryDatastore,
    runner: TransactionRunner<SimulatedTimeSource>,
    strategy: CheckpointStrategy<SimulatedTimeSource>,
    exporter: DiffExporter<InMemoryBlobStore>,
    blobs: Arc<InMemoryBlobStore>,
    assigner: BucketAssigner,
    time: SimulatedTimeSource,
}

fn source(buckets: u32) -> Source {
    let time = SimulatedTimeSource::new(1_000_000);
    let store = MemoryDatastore::new();
    let assigner = BucketAssigner::new(buckets).unwrap();
    let runner = TransactionRunner::new(store.clone(), assigner, CommitClock::new(time.clone()));
    let strategy = CheckpointStrategy::new(
        store.clone(),
        assigner,
        time.clone(),
        CheckpointConfig::test(),
    );
    let blobs = Arc::new(InMemoryBlobStore::new());
    let exporter = DiffExporter::new(
        store.clone(),
        blobs.clone(),
        ExportConfig::test(),
        RetryPolicy::test(),
    );
    Source {
        store,
        runner,
        strategy,
        exporter,
        blobs,
        assigner,
        time,
    }
}

fn restorer_into(source: &Source, target: &MemoryDatastore) -> Restorer<InMemoryBlobStore> {
    Restorer::new(
        target.clone(),
        source.blobs.clone(),
        "diffs/",
        RetryPolicy::test(),
    )
}

/// A named top-level entity: one entity group per name.
fn entity_key(name: &str) -> EntityKey {
    EntityKey::new(GroupId::new(name), "Entity", name).unwrap()
}

fn save_own(source: &Source, name: &str, value: &[u8]) {
    let group = GroupId::new(name);
    let value = value.to_vec();
    source
        .runner
        .run(&group, |txn| {
            txn.save(RawEntity::new(entity_key(name), value.clone()))?;
            Ok(())
        })
        .unwrap();
}

fn checkpoint(source: &Source) -> Checkpoint {
    source.time.advance_ms(10);
    source.strategy.take_checkpoint().unwrap()
}

async fn restore_all(source: &Source, target: &MemoryDatastore, from: CommitTime) -> RestoreResult {
    restorer_into(source, target)
        .restore(from, false)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_round_trip_into_empty_store() {
    let source = source(4);

    for name in ["alpha", "beta", "gamma", "delta", "epsilon"] {
        save_own(&source, name, format!("value-{}", name).as_bytes());
    }
    // Overwrite one and delete another before the cut.
    save_own(&source, "alpha", b"value-alpha-v2");
    let group = GroupId::new("beta");
    source
        .runner
        .run(&group, |txn| {
            txn.delete(entity_key("beta"))?;
            Ok(())
        })
        .unwrap();

    let upper = checkpoint(&source);
    source.exporter.export(None, &upper).await.unwrap();

    let target = MemoryDatastore::new();
    let result = restore_all(&source, &target, CommitTime::START_OF_TIME).await;

    assert_eq!(result.files_applied, 1);
    assert_eq!(result.transactions_applied, 7);
    assert_eq!(result.restored_to, Some(upper.checkpoint_time));

    // Restored state equals the source state.
    assert_eq!(target.entity_keys(), source.store.entity_keys());
    assert_eq!(
        target.get_entity(&entity_key("alpha")),
        Some(b"value-alpha-v2".to_vec())
    );
    assert_eq!(target.get_entity(&entity_key("beta")), None);

    // The commit-log audit trail came along too.
    assert_eq!(target.manifest_count(), source.store.manifest_count());
    assert_eq!(target.mutation_count(), source.store.mutation_count());
    assert_eq!(target.checkpoint_root(), Some(upper.checkpoint_time));
}

#[tokio::test]
async fn test_three_bucket_scenario() {
    let source = source(3);

    // Pick group names that land in specific buckets; assignment is a
    // stable hash, so searching is deterministic.
    let group_in_bucket = |bucket: u32| -> GroupId {
        (0..)
            .map(|i| GroupId::new(format!("group-{}", i)))
            .find(|g| source.assigner.bucket_for(g) == BucketId(bucket))
            .expect("some group hashes into every bucket")
    };
    let bucket1_group = group_in_bucket(1);
    let bucket2_group = group_in_bucket(2);

    // Seed the source with x and previous-keep, then cut the lower bound.
    save_own(&source, "x", b"seed-x");
    save_own(&source, "previous-keep", b"seed-keep");
    let lower = checkpoint(&source);

    // T1 (bucket 1): delete {x}
    source
        .runner
        .run(&bucket1_group, |txn| {
            txn.delete(entity_key("x"))?;
            Ok(())
        })
        .unwrap();

    // T2 (bucket 2): save {a, b}; delete {x}
    let a_key = EntityKey::new(bucket2_group.clone(), "Entity", "a").unwrap();
    let b_key = EntityKey::new(bucket2_group.clone(), "Entity", "b").unwrap();
    {
        let (a_key, b_key) = (a_key.clone(), b_key.clone());
        source
            .runner
            .run(&bucket2_group, move |txn| {
                txn.save(RawEntity::new(a_key, b"value-a".to_vec()))?;
                txn.save(RawEntity::new(b_key, b"value-b".to_vec()))?;
                txn.delete(entity_key("x"))?;
                Ok(())
            })
            .unwrap();
    }

    // T3 (bucket 1): save {c}; delete {a}
    let c_key = EntityKey::new(bucket1_group.clone(), "Entity", "c").unwrap();
    {
        let (a_key, c_key) = (a_key.clone(), c_key.clone());
        source
            .runner
            .run(&bucket1_group, move |txn| {
                txn.save(RawEntity::new(c_key, b"value-c".to_vec()))?;
                txn.delete(a_key)?;
                Ok(())
            })
            .unwrap();
    }

    let upper = checkpoint(&source);
    let export = source.exporter.export(Some(&lower), &upper).await.unwrap();
    assert_eq!(export.num_transactions, 3);

    // Replay onto a store pre-seeded with {x, previous-keep}.
    let target = MemoryDatastore::new();
    {
        let mut write = target.begin_write();
        write.save_entity(RawEntity::new(entity_key("x"), b"seed-x".to_vec()));
        write.save_entity(RawEntity::new(entity_key("previous-keep"), b"seed-keep".to_vec()));
    }

    let result = restorer_into(&source, &target)
        .restore(lower.checkpoint_time, false)
        .await
        .unwrap();
    assert_eq!(result.transactions_applied, 3);

    // Exactly {previous-keep, b, c} survives.
    let mut ids: Vec<String> = target
        .entity_keys()
        .into_iter()
        .map(|k| k.id)
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["b", "c", "previous-keep"]);
    assert_eq!(target.get_entity(&b_key), Some(b"value-b".to_vec()));
    assert_eq!(target.get_entity(&c_key), Some(b"value-c".to_vec()));
}

#[tokio::test]
async fn test_replaying_same_diff_twice_converges() {
    let source = source(2);
    for name in ["one", "two", "three"] {
        save_own(&source, name, b"v");
    }
    let upper = checkpoint(&source);
    source.exporter.export(None, &upper).await.unwrap();

    let target = MemoryDatastore::new();
    let restorer = restorer_into(&source, &target);

    restorer.restore(CommitTime::START_OF_TIME, false).await.unwrap();
    let keys_once = target.entity_keys();
    let manifests_once = target.manifest_count();

    // Second replay of the identical chain: same final state.
    restorer.restore(CommitTime::START_OF_TIME, false).await.unwrap();
    assert_eq!(target.entity_keys(), keys_once);
    assert_eq!(target.manifest_count(), manifests_once);
    assert_eq!(target.checkpoint_root(), Some(upper.checkpoint_time));
}

#[tokio::test]
async fn test_incremental_chain_restores_across_files() {
    let source = source(3);

    save_own(&source, "first", b"v1");
    let c1 = checkpoint(&source);
    source.exporter.export(None, &c1).await.unwrap();

    save_own(&source, "second", b"v2");
    save_own(&source, "first", b"v1-updated");
    let c2 = checkpoint(&source);
    source.exporter.export(Some(&c1), &c2).await.unwrap();

    let group = GroupId::new("first");
    source
        .runner
        .run(&group, |txn| {
            txn.delete(entity_key("first"))?;
            Ok(())
        })
        .unwrap();
    let c3 = checkpoint(&source);
    source.exporter.export(Some(&c2), &c3).await.unwrap();

    let target = MemoryDatastore::new();
    let result = restore_all(&source, &target, CommitTime::START_OF_TIME).await;

    assert_eq!(result.files_applied, 3);
    assert_eq!(result.restored_to, Some(c3.checkpoint_time));
    assert_eq!(target.entity_keys(), source.store.entity_keys());
    assert_eq!(target.get_entity(&entity_key("first")), None);
    assert_eq!(target.get_entity(&entity_key("second")), Some(b"v2".to_vec()));

    // Bucket watermarks match the last file's upper checkpoint.
    for (&bucket, &time) in &c3.bucket_times {
        assert_eq!(target.bucket_watermark(bucket), Some(time));
    }
}

#[tokio::test]
async fn test_resume_from_later_checkpoint() {
    let source = source(2);

    save_own(&source, "early", b"v");
    let c1 = checkpoint(&source);
    source.exporter.export(None, &c1).await.unwrap();

    save_own(&source, "late", b"v");
    let c2 = checkpoint(&source);
    source.exporter.export(Some(&c1), &c2).await.unwrap();

    // Restore only from c1 onward: the first file (lower bound at the
    // beginning of time) is skipped, and the chain may start mid-history.
    let target = MemoryDatastore::new();
    let result = restore_all(&source, &target, c1.checkpoint_time).await;

    assert_eq!(result.files_applied, 1);
    assert_eq!(target.get_entity(&entity_key("late")), Some(b"v".to_vec()));
    assert_eq!(target.get_entity(&entity_key("early")), None);
}

#[tokio::test]
async fn test_empty_window_round_trip() {
    let source = source(3);
    save_own(&source, "pre", b"v");
    let c1 = checkpoint(&source);
    source.exporter.export(None, &c1).await.unwrap();

    // No activity between c1 and c2.
    let c2 = checkpoint(&source);
    let export = source.exporter.export(Some(&c1), &c2).await.unwrap();
    assert_eq!(export.num_transactions, 0);

    let target = MemoryDatastore::new();
    let result = restore_all(&source, &target, CommitTime::START_OF_TIME).await;

    assert_eq!(result.files_applied, 2);
    assert_eq!(result.restored_to, Some(c2.checkpoint_time));
    assert_eq!(target.entity_count(), 1);
    assert_eq!(target.checkpoint_root(), Some(c2.checkpoint_time));
}
