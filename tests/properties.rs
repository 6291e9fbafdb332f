//! Property-based tests: persistent-map laws, graph invariants, and
//! external-id ordering.

use proptest::prelude::*;
use proximum::{ExternalId, Index, IndexConfig, StoreConfig};
use tempfile::tempdir;
use uuid::Uuid;

const DIM: usize = 16;

fn config(dir: &std::path::Path) -> IndexConfig {
    IndexConfig {
        capacity: 4_096,
        chunk_size: 8,
        store: StoreConfig::at(Uuid::new_v4(), dir.join("kv.redb")),
        mmap_dir: Some(dir.to_path_buf()),
        ..IndexConfig::new(DIM)
    }
}

fn vector_strategy() -> impl Strategy<Value = Vec<f32>> {
    proptest::collection::vec(-1.0f32..1.0, DIM)
}

fn external_id_strategy() -> impl Strategy<Value = ExternalId> {
    prop_oneof![
        any::<i64>().prop_map(ExternalId::Int),
        "[a-z]{1,12}".prop_map(ExternalId::Str),
        any::<u128>().prop_map(|v| ExternalId::Uuid(Uuid::from_u128(v))),
        "[a-z]{1,8}".prop_map(ExternalId::Tag),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(10))]

    #[test]
    fn assoc_preserves_other_keys(
        entries in proptest::collection::btree_map(0u32..64, vector_strategy(), 1..12),
        new_key in 1000u32..2000,
        new_vec in vector_strategy(),
    ) {
        let dir = tempdir().unwrap();
        let mut index = Index::create(config(dir.path())).unwrap();
        for (key, vec) in &entries {
            index = index.assoc(*key, vec, None).unwrap();
        }
        let before = index.count_vectors();

        let derived = index.assoc(new_key, &new_vec, None).unwrap();

        // count(assoc(idx, e, v)) = count(idx) + 1 for a fresh key.
        prop_assert_eq!(derived.count_vectors(), before + 1);
        // get(assoc(idx, e, v), e') = get(idx, e') for e' != e.
        for key in entries.keys() {
            prop_assert_eq!(index.get(*key).unwrap(), derived.get(*key).unwrap());
        }
        // The original never sees the new key.
        prop_assert!(index.get(new_key).unwrap().is_none());
    }

    #[test]
    fn graph_invariants_hold_after_mixed_ops(
        vectors in proptest::collection::vec(vector_strategy(), 5..25),
        delete_picks in proptest::collection::vec(any::<proptest::sample::Index>(), 0..5),
    ) {
        let dir = tempdir().unwrap();
        let mut index = Index::create(config(dir.path())).unwrap();
        for (i, vec) in vectors.iter().enumerate() {
            index = index.assoc(i as u32, vec, None).unwrap();
        }
        let mut deleted = std::collections::BTreeSet::new();
        for pick in &delete_picks {
            let key = pick.index(vectors.len()) as u32;
            if deleted.insert(key) {
                index = index.dissoc(key).unwrap();
            }
        }

        prop_assert!(index.check_invariants().is_ok());
        prop_assert_eq!(
            index.count_vectors(),
            (vectors.len() - deleted.len()) as u64
        );

        let metrics = index.metrics(None);
        prop_assert_eq!(metrics.vector_count, metrics.total_count - metrics.deleted_count);
        prop_assert!(metrics.deletion_ratio >= 0.0 && metrics.deletion_ratio <= 1.0);
    }

    #[test]
    fn remapping_an_external_id_always_collides(
        key in 0u32..100,
        first in vector_strategy(),
        second in vector_strategy(),
    ) {
        let dir = tempdir().unwrap();
        let index = Index::create(config(dir.path())).unwrap();
        let index = index.assoc(key, &first, None).unwrap();

        let err = index.assoc(key, &second, None).unwrap_err();
        prop_assert!(err.is_collision());
        // State unchanged.
        prop_assert_eq!(index.count_vectors(), 1);
        prop_assert_eq!(index.get(key).unwrap().unwrap().len(), DIM);
    }

    #[test]
    fn external_id_order_is_total_and_antisymmetric(
        a in external_id_strategy(),
        b in external_id_strategy(),
        c in external_id_strategy(),
    ) {
        use std::cmp::Ordering;

        // Totality: exactly one of <, =, > holds.
        let ab = a.cmp(&b);
        prop_assert_eq!(b.cmp(&a), ab.reverse());
        // Equality agrees with Eq.
        prop_assert_eq!(ab == Ordering::Equal, a == b);
        // Transitivity on a sorted triple.
        let mut sorted = vec![a, b, c];
        sorted.sort();
        prop_assert!(sorted[0] <= sorted[1] && sorted[1] <= sorted[2]);
        prop_assert!(sorted[0] <= sorted[2]);
    }

    #[test]
    fn insert_then_search_finds_self(
        vectors in proptest::collection::vec(vector_strategy(), 1..15),
    ) {
        let dir = tempdir().unwrap();
        let mut index = Index::create(config(dir.path())).unwrap();
        for (i, vec) in vectors.iter().enumerate() {
            index = index.assoc(i as u32, vec, None).unwrap();
        }
        for (i, vec) in vectors.iter().enumerate() {
            let hits = index.search(vec, 1).unwrap();
            prop_assert!(!hits.is_empty());
            // An identical duplicate may legitimately win the tie, so
            // assert on distance rather than identity.
            let _ = i;
            prop_assert!(hits[0].distance < 1e-4);
        }
    }
}
