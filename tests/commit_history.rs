//! Commit chains, history, and DAG queries.

use proximum::{Index, IndexConfig, StoreConfig};
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

#[test]
fn commit_chain_of_three() {
    let dir = tempdir().unwrap();
    let mut index = Index::create(config(dir.path())).unwrap();

    let mut commits = Vec::new();
    for round in 0..3u64 {
        for i in 0..5u64 {
            index = index.insert(&make_vector(round * 5 + i)).unwrap();
        }
        index = index.sync().unwrap();
        commits.push(index.commit_id().unwrap());
    }
    let [c1, c2, c3] = commits[..] else { unreachable!() };

    assert_eq!(index.history().unwrap(), vec![c3, c2, c1]);
    assert_eq!(index.parents(c3).unwrap().into_iter().collect::<Vec<_>>(), vec![c2]);
    assert!(index.parents(c1).unwrap().is_empty());
    assert!(index.is_ancestor(c1, c3).unwrap());
    assert_eq!(index.count_vectors(), 15);
}

#[test]
fn commit_graph_covers_all_branches() {
    let dir = tempdir().unwrap();
    let index = Index::create(config(dir.path())).unwrap();
    let main = index.insert(&make_vector(0)).unwrap().sync().unwrap();
    let feature = main.branch("side").unwrap();

    let graph = main.commit_graph().unwrap();
    let main_head = main.commit_id().unwrap();
    let side_head = feature.commit_id().unwrap();
    assert!(graph.contains_key(&main_head));
    assert!(graph.contains_key(&side_head));
    assert!(graph[&side_head].contains(&main_head));
    assert!(graph[&main_head].is_empty());
}

#[test]
fn common_ancestor_of_diverged_branches() {
    let dir = tempdir().unwrap();
    let index = Index::create(config(dir.path())).unwrap();
    let base = index.insert(&make_vector(0)).unwrap().sync().unwrap();
    let base_head = base.commit_id().unwrap();

    let feature = base.branch("fork-a").unwrap();
    let feature = feature.insert(&make_vector(1)).unwrap().sync().unwrap();
    let main = base.insert(&make_vector(2)).unwrap().sync().unwrap();

    let ancestor = main
        .common_ancestor(main.commit_id().unwrap(), feature.commit_id().unwrap())
        .unwrap();
    assert_eq!(ancestor, Some(base_head));
}

#[test]
fn commit_info_exposes_snapshot_fields() {
    let dir = tempdir().unwrap();
    let mut index = Index::create(config(dir.path())).unwrap();
    for seed in 0..7u64 {
        index = index.insert(&make_vector(seed)).unwrap();
    }
    let index = index.sync().unwrap();

    let commit = index.commit_info(index.commit_id().unwrap()).unwrap();
    assert_eq!(commit.branch, "main");
    assert_eq!(commit.branch_vector_count, 7);
    assert_eq!(commit.branch_deleted_count, 0);
    assert!(commit.entry_point.is_some());
    assert!(commit.vectors_addr_root.is_some());
    assert!(commit.edges_addr_root.is_some());
}

#[test]
fn timestamps_nondecreasing_across_syncs() {
    let dir = tempdir().unwrap();
    let mut index = Index::create(config(dir.path())).unwrap();
    let mut last = None;
    for seed in 0..3u64 {
        index = index.insert(&make_vector(seed)).unwrap().sync().unwrap();
        let commit = index.commit_info(index.commit_id().unwrap()).unwrap();
        if let Some(prev) = last {
            assert!(commit.created_at >= prev);
        }
        last = Some(commit.created_at);
    }
}
