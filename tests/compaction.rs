//! Online compaction under concurrent writes.

use proximum::{
    CompactionOptions, ExternalId, Index, IndexConfig, NodeId, StoreConfig,
};
use tempfile::tempdir;
use uuid::Uuid;

const DIM: usize = 32;

fn config(dir: &std::path::Path, name: &str) -> IndexConfig {
    IndexConfig {
        capacity: 10_000,
        chunk_size: 16,
        store: StoreConfig::at(Uuid::new_v4(), dir.join(format!("{}.redb", name))),
        mmap_dir: Some(dir.to_path_buf()),
        ..IndexConfig::new(DIM)
    }
}

fn make_vector(seed: u64) -> Vec<f32> {
    (0..DIM)
        .map(|i| (seed as f32 * 0.7 + i as f32 * 0.31).sin())
        .collect()
}

#[test]
fn online_compaction_with_concurrent_insert_and_delete() {
    let dir = tempdir().unwrap();
    let mut index = Index::create(config(dir.path(), "source")).unwrap();
    for seed in 0..10u64 {
        index = index.insert(&make_vector(seed)).unwrap();
    }

    let state = index
        .start_online_compaction(config(dir.path(), "target"), CompactionOptions::default())
        .unwrap();

    let fresh = make_vector(77);
    state.assoc("new-1", &fresh, None).unwrap();
    state.delete(NodeId(3)).unwrap();

    let progress = state.progress();
    assert!(progress.delta_count >= 2);
    assert!(!progress.failed);

    let finished = state.finish().unwrap();
    assert_eq!(finished.count_vectors(), 11);
    assert_eq!(finished.deleted_count(), 0);
    let hit = finished.nearest(&fresh).unwrap().unwrap();
    assert_eq!(hit.id, ExternalId::Str("new-1".into()));
}

#[test]
fn compaction_state_serves_reads_during_copy() {
    let dir = tempdir().unwrap();
    let mut index = Index::create(config(dir.path(), "source")).unwrap();
    for seed in 0..25u64 {
        index = index
            .assoc(format!("doc-{}", seed), &make_vector(seed), None)
            .unwrap();
    }

    let state = index
        .start_online_compaction(
            config(dir.path(), "target"),
            CompactionOptions {
                batch_size: 5,
                max_delta_size: 100,
            },
        )
        .unwrap();

    // Reads keep working while the copier runs.
    assert_eq!(state.count_vectors(), 25);
    let hits = state.search(&make_vector(12), 3).unwrap();
    assert_eq!(hits[0].id, ExternalId::Str("doc-12".into()));

    let finished = state.finish().unwrap();
    assert_eq!(finished.count_vectors(), 25);
    assert!(finished.contains("doc-12"));
}

#[test]
fn offline_compaction_rebuilds_dense_index() {
    let dir = tempdir().unwrap();
    let mut index = Index::create(config(dir.path(), "source")).unwrap();
    for seed in 0..30u64 {
        index = index
            .assoc(format!("doc-{}", seed), &make_vector(seed), None)
            .unwrap();
    }
    for seed in 0..10u64 {
        index = index.dissoc(format!("doc-{}", seed * 3)).unwrap();
    }
    assert_eq!(index.count_vectors(), 20);

    let compacted = index.compact(config(dir.path(), "target")).unwrap();
    assert_eq!(compacted.count_vectors(), 20);
    assert_eq!(compacted.total_count(), 20);
    assert_eq!(compacted.deleted_count(), 0);
    compacted.check_invariants().unwrap();

    // Survivors keep their ids and remain findable.
    let hits = compacted.search(&make_vector(4), 1).unwrap();
    assert_eq!(hits[0].id, ExternalId::Str("doc-4".into()));
}

#[test]
fn finished_target_is_committed_and_reloadable() {
    let dir = tempdir().unwrap();
    let mut index = Index::create(config(dir.path(), "source")).unwrap();
    for seed in 0..8u64 {
        index = index
            .assoc(format!("doc-{}", seed), &make_vector(seed), None)
            .unwrap();
    }
    let target_cfg = config(dir.path(), "target");
    let state = index
        .start_online_compaction(target_cfg.clone(), CompactionOptions::default())
        .unwrap();
    let finished = state.finish().unwrap();
    assert!(finished.commit_id().is_some());
    finished.close().unwrap();

    let reloaded = Index::load(target_cfg, None).unwrap();
    assert_eq!(reloaded.count_vectors(), 8);
    assert!(reloaded.contains("doc-5"));
}
