//! Mark-and-sweep garbage collection over the KV store.
//!
//! Mark computes the live key set: the two well-known keys, every branch
//! head, the transitive commit closure of each head, and for every
//! reachable commit its snapshot, its PSS pages, and all chunks reachable
//! through its address maps. Sweep deletes any other key whose last-write
//! stamp is older than the cutoff, in batches. `index/config` and
//! `branches` are never removed.

use std::collections::{HashSet, VecDeque};

use tracing::{info, instrument};

use super::branch::read_branches;
use super::commit::{branch_head, read_commit};
use super::Index;
use crate::error::Result;
use crate::storage::schema::{
    branch_head_key, commit_key, edge_chunk_key, vector_chunk_key, BRANCHES_KEY, INDEX_CONFIG_KEY,
};
use crate::storage::PersistentSet;
use crate::types::{ExternalId, Metadata, NodeId, StorageAddress, Timestamp};

/// Options for [`Index::gc`].
#[derive(Clone, Copy, Debug)]
pub struct GcOptions {
    /// Keys deleted per transaction.
    pub batch_size: usize,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self { batch_size: 1000 }
    }
}

impl Index {
    /// Removes keys unreachable from any branch head and older than
    /// `remove_before`. Returns the removed key set.
    #[instrument(skip(self, opts), fields(branch = %self.state.branch))]
    pub fn gc(&self, remove_before: Timestamp, opts: GcOptions) -> Result<HashSet<Vec<u8>>> {
        let store = self.store.as_ref();

        // Mark.
        let mut live: HashSet<Vec<u8>> = HashSet::new();
        live.insert(INDEX_CONFIG_KEY.to_vec());
        live.insert(BRANCHES_KEY.to_vec());

        let mut queue = VecDeque::new();
        for branch in read_branches(store)? {
            live.insert(branch_head_key(&branch));
            if let Some(head) = branch_head(store, &branch)? {
                queue.push_back(head);
            }
        }

        let mut seen = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            live.insert(commit_key(id));
            let commit = read_commit(store, id)?;
            for parent in &commit.parents {
                queue.push_back(*parent);
            }

            PersistentSet::<NodeId, Metadata>::collect_page_keys(
                store,
                commit.metadata_root,
                &mut live,
            )?;
            PersistentSet::<ExternalId, NodeId>::collect_page_keys(
                store,
                commit.external_id_root,
                &mut live,
            )?;
            PersistentSet::<u64, StorageAddress>::collect_page_keys(
                store,
                commit.vectors_addr_root,
                &mut live,
            )?;
            PersistentSet::<u64, StorageAddress>::collect_page_keys(
                store,
                commit.edges_addr_root,
                &mut live,
            )?;

            let vectors_addr: PersistentSet<u64, StorageAddress> =
                PersistentSet::load(store, commit.vectors_addr_root)?;
            for (_, addr) in vectors_addr.iter() {
                live.insert(vector_chunk_key(*addr));
            }
            let edges_addr: PersistentSet<u64, StorageAddress> =
                PersistentSet::load(store, commit.edges_addr_root)?;
            for (_, addr) in edges_addr.iter() {
                live.insert(edge_chunk_key(*addr));
            }
        }

        // Sweep, batched.
        let mut removed = HashSet::new();
        let mut batch: Vec<Vec<u8>> = Vec::with_capacity(opts.batch_size);
        for key in store.list_keys()? {
            if live.contains(&key) {
                continue;
            }
            let Some(stamp) = store.write_stamp(&key)? else {
                continue;
            };
            if stamp < remove_before {
                batch.push(key);
                if batch.len() >= opts.batch_size.max(1) {
                    store.delete_batch(&batch)?;
                    removed.extend(batch.drain(..));
                }
            }
        }
        if !batch.is_empty() {
            store.delete_batch(&batch)?;
            removed.extend(batch.drain(..));
        }

        info!(removed = removed.len(), live = live.len(), "GC swept");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::tests::test_config;
    use tempfile::tempdir;

    fn make_vector(seed: u64, dim: usize) -> Vec<f32> {
        (0..dim)
            .map(|i| (seed as f32 * 0.7 + i as f32 * 0.31).sin())
            .collect()
    }

    fn far_future() -> Timestamp {
        Timestamp::now().offset(24 * 3600 * 1000)
    }

    #[test]
    fn test_gc_preserves_global_keys_and_reachable_state() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), 8);
        let index = Index::create(config.clone()).unwrap();
        let index = index.insert(&make_vector(0, 8)).unwrap().sync().unwrap();
        let head = index.commit_id().unwrap();

        let removed = index.gc(far_future(), GcOptions::default()).unwrap();
        assert!(!removed.contains(&INDEX_CONFIG_KEY.to_vec()));
        assert!(!removed.contains(&BRANCHES_KEY.to_vec()));
        assert!(!removed.contains(&commit_key(head)));

        // The store still loads and sees the same head.
        index.close().unwrap();
        let loaded = Index::load(config, None).unwrap();
        assert_eq!(loaded.commit_id(), Some(head));
        assert_eq!(loaded.count_vectors(), 1);
    }

    #[test]
    fn test_gc_removes_superseded_chunks() {
        let dir = tempdir().unwrap();
        let mut index = Index::create(test_config(dir.path(), 8)).unwrap();
        // Two syncs: the first tail-chunk write is superseded by the second.
        index = index.insert(&make_vector(0, 8)).unwrap().sync().unwrap();
        index = index.insert(&make_vector(1, 8)).unwrap().sync().unwrap();
        let first = index.history().unwrap()[1];

        // Drop the older commit from reachability by resetting history:
        // delete nothing yet; with both commits reachable, nothing from
        // the chain may vanish.
        let removed = index.gc(far_future(), GcOptions::default()).unwrap();
        assert!(!removed.contains(&commit_key(first)));
    }

    #[test]
    fn test_gc_respects_cutoff() {
        let dir = tempdir().unwrap();
        let index = Index::create(test_config(dir.path(), 8)).unwrap();
        let index = index.insert(&make_vector(0, 8)).unwrap().sync().unwrap();

        // Everything is newer than a cutoff in the past: nothing removed.
        let removed = index
            .gc(Timestamp::from_millis(0), GcOptions::default())
            .unwrap();
        assert!(removed.is_empty());
    }

    #[test]
    fn test_gc_collects_unreachable_branch_remnants() {
        let dir = tempdir().unwrap();
        let index = Index::create(test_config(dir.path(), 8)).unwrap();
        let index = index.insert(&make_vector(0, 8)).unwrap().sync().unwrap();
        let feature = index.branch("feature").unwrap();
        let feature_head = feature.commit_id().unwrap();
        let feature_mmap = feature.vectors.path().to_path_buf();
        feature.vectors.close().unwrap();
        let _ = std::fs::remove_file(feature_mmap);

        index.delete_branch("feature").unwrap();
        let removed = index.gc(far_future(), GcOptions::default()).unwrap();
        assert!(removed.contains(&commit_key(feature_head)));
    }
}
