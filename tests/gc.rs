//! Mark-and-sweep garbage collection.

use proximum::{GcOptions, Index, IndexConfig, StoreConfig, Timestamp};
use tempfile::tempdir;
use uuid::Uuid;

const DIM: usize = 32;

fn config(dir: &std::path::Path) -> IndexConfig {
    IndexConfig {
        capacity: 10_000,
        chunk_size: 16,
        store: StoreConfig::at(Uuid::new_v4(), dir.join("kv.redb")),
        mmap_dir: Some(dir.to_path_buf()),
        ..IndexConfig::new(DIM)
    }
}

fn make_vector(seed: u64) -> Vec<f32> {
    (0..DIM)
        .map(|i| (seed as f32 * 0.7 + i as f32 * 0.31).sin())
        .collect()
}

fn tomorrow() -> Timestamp {
    Timestamp::now().offset(24 * 3600 * 1000)
}

#[test]
fn gc_preserves_global_keys_and_the_branch_head() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    let index = Index::create(cfg.clone()).unwrap();
    let index = index.insert(&make_vector(0)).unwrap().sync().unwrap();
    let head = index.commit_id().unwrap();

    // Aggressive cutoff one day in the future: everything unreachable
    // would qualify, so survival proves reachability marking.
    let removed = index.gc(tomorrow(), GcOptions::default()).unwrap();
    assert!(!removed.iter().any(|k| k == b"index/config"));
    assert!(!removed.iter().any(|k| k == b"branches"));

    index.close().unwrap();
    let loaded = Index::load(cfg, None).unwrap();
    assert_eq!(loaded.commit_id(), Some(head));
    assert_eq!(loaded.count_vectors(), 1);
    assert_eq!(loaded.branches().unwrap(), vec!["main"]);
}

#[test]
fn gc_reclaims_orphaned_commits() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    let index = Index::create(cfg).unwrap();
    let index = index.insert(&make_vector(0)).unwrap().sync().unwrap();
    let feature = index.branch("doomed").unwrap();
    let doomed_head = feature.commit_id().unwrap();
    feature.close().unwrap();

    index.delete_branch("doomed").unwrap();
    let removed = index.gc(tomorrow(), GcOptions { batch_size: 2 }).unwrap();

    let doomed_key = format!("commit/{}", doomed_head).into_bytes();
    assert!(removed.contains(&doomed_key));

    // The shared history commit referenced by main must survive.
    let main_key = format!("commit/{}", index.commit_id().unwrap()).into_bytes();
    assert!(!removed.contains(&main_key));
}

#[test]
fn gc_past_cutoff_removes_nothing() {
    let dir = tempdir().unwrap();
    let index = Index::create(config(dir.path())).unwrap();
    let index = index.insert(&make_vector(0)).unwrap().sync().unwrap();

    let removed = index
        .gc(Timestamp::from_millis(0), GcOptions::default())
        .unwrap();
    assert!(removed.is_empty());
}

#[test]
fn gc_keeps_full_history_reachable_from_head() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    let mut index = Index::create(cfg.clone()).unwrap();
    for round in 0..3u64 {
        index = index.insert(&make_vector(round)).unwrap().sync().unwrap();
    }
    let history = index.history().unwrap();
    assert_eq!(history.len(), 3);

    let removed = index.gc(tomorrow(), GcOptions::default()).unwrap();
    for commit in &history {
        let key = format!("commit/{}", commit).into_bytes();
        assert!(!removed.contains(&key), "live commit {} swept", commit);
    }

    // Time travel to the oldest commit still works after the sweep.
    index.close().unwrap();
    let old = Index::load_commit(cfg, history[2]).unwrap();
    assert_eq!(old.count_vectors(), 1);
}
