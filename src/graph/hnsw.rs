//! HNSW construction and search over the chunked edge store.
//!
//! Insertion follows the classic algorithm: greedy descent through the
//! upper layers, then a beam search of width `ef_construction` per layer
//! with the diversity heuristic selecting neighbors, bidirectional linking,
//! and cap pruning. Search runs the same descent with beam 1 and a bounded
//! best-first pass at layer 0.
//!
//! Levels are drawn from a geometric distribution using a ChaCha8 stream
//! keyed by the node id, so the same insert sequence always produces the
//! same graph.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::HashSet;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::EdgeStore;
use crate::config::{DistanceKind, IndexConfig};
use crate::error::Result;
use crate::types::NodeId;
use crate::vector::distance::distance;
use crate::vector::VectorStore;

/// Fixed seed mixed with the node id for level sampling.
const LEVEL_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// Resolved HNSW parameters.
#[derive(Clone, Copy, Debug)]
pub struct HnswParams {
    /// Max neighbors above layer 0.
    pub m: usize,
    /// Max neighbors at layer 0.
    pub m0: usize,
    /// Construction beam width.
    pub ef_construction: usize,
    /// Level-sampling parameter `1 / ln(M)`.
    pub ml: f64,
    /// Hard cap on layers.
    pub max_level: u8,
    /// Distance metric.
    pub distance: DistanceKind,
}

impl HnswParams {
    /// Extracts the parameters from a resolved index config.
    pub fn from_config(config: &IndexConfig) -> Self {
        Self {
            m: config.m,
            m0: config.m0(),
            ef_construction: config.ef_construction(),
            ml: config.ml(),
            max_level: config.max_level(),
            distance: config.distance,
        }
    }

    #[inline]
    fn cap(&self, layer: u8) -> usize {
        if layer == 0 {
            self.m0
        } else {
            self.m
        }
    }
}

/// A search result: internal node id plus its distance to the query.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SearchHit {
    /// Internal node id.
    pub node: NodeId,
    /// Distance to the query under the index metric.
    pub distance: f32,
}

/// Heap entry ordered by (distance, node id). The id tie-break makes
/// results deterministic: the smaller id wins on equal distance.
#[derive(Clone, Copy, PartialEq)]
struct Near {
    dist: f32,
    node: NodeId,
}

impl Eq for Near {}

impl Ord for Near {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then_with(|| self.node.0.cmp(&other.node.0))
    }
}

impl PartialOrd for Near {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Samples a node's level: `floor(-ln(U) * ml)` clamped to the level cap.
pub fn sample_level(node: NodeId, params: &HnswParams) -> u8 {
    let mut rng = ChaCha8Rng::seed_from_u64(LEVEL_SEED ^ node.0 as u64);
    let u: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
    let level = (-u.ln() * params.ml).floor();
    (level as u64).min(params.max_level as u64) as u8
}

#[inline]
fn dist_to(params: &HnswParams, vectors: &VectorStore, query: &[f32], node: NodeId) -> f32 {
    distance(params.distance, query, vectors.vector(node))
}

/// Greedy walk on one layer: repeatedly moves to the closest neighbor
/// until no neighbor improves on the current candidate.
fn greedy_step(
    graph: &EdgeStore,
    vectors: &VectorStore,
    params: &HnswParams,
    query: &[f32],
    layer: u8,
    mut current: Near,
) -> Near {
    loop {
        let mut improved = false;
        for neighbor in graph.neighbors(layer, current.node) {
            let d = dist_to(params, vectors, query, neighbor);
            if d < current.dist {
                current = Near {
                    dist: d,
                    node: neighbor,
                };
                improved = true;
            }
        }
        if !improved {
            return current;
        }
    }
}

/// Bounded best-first search on one layer.
///
/// Expands from the entry set with a min-heap of candidates and a max-heap
/// of results capped at `ef`. Traversal visits deleted nodes (they still
/// route), but only nodes passing `keep` enter the result set.
fn search_layer(
    graph: &EdgeStore,
    vectors: &VectorStore,
    params: &HnswParams,
    query: &[f32],
    entries: &[Near],
    ef: usize,
    layer: u8,
    keep: &dyn Fn(NodeId) -> bool,
) -> Vec<Near> {
    let mut visited: HashSet<NodeId> = entries.iter().map(|e| e.node).collect();
    let mut candidates: BinaryHeap<Reverse<Near>> =
        entries.iter().map(|&e| Reverse(e)).collect();
    let mut results: BinaryHeap<Near> = entries
        .iter()
        .filter(|e| keep(e.node))
        .copied()
        .collect();
    results = bound(results, ef);

    while let Some(Reverse(nearest)) = candidates.pop() {
        if results.len() >= ef {
            if let Some(furthest) = results.peek() {
                if nearest.dist > furthest.dist {
                    break;
                }
            }
        }
        for neighbor in graph.neighbors(layer, nearest.node) {
            if !visited.insert(neighbor) {
                continue;
            }
            let d = dist_to(params, vectors, query, neighbor);
            let within_beam = results.len() < ef
                || results.peek().map(|f| d < f.dist).unwrap_or(true);
            if within_beam {
                let entry = Near {
                    dist: d,
                    node: neighbor,
                };
                candidates.push(Reverse(entry));
                if keep(neighbor) {
                    results.push(entry);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }
    }

    let mut out: Vec<Near> = results.into_vec();
    out.sort_unstable();
    out
}

fn bound(mut heap: BinaryHeap<Near>, ef: usize) -> BinaryHeap<Near> {
    while heap.len() > ef {
        heap.pop();
    }
    heap
}

/// The diversity heuristic: a candidate is selected only if no
/// already-selected neighbor is closer to it than the query is.
/// Candidates must arrive sorted ascending by distance to the query.
fn select_diverse(
    vectors: &VectorStore,
    params: &HnswParams,
    candidates: &[Near],
    cap: usize,
) -> Vec<NodeId> {
    let mut selected: Vec<Near> = Vec::with_capacity(cap);
    for &candidate in candidates {
        if selected.len() >= cap {
            break;
        }
        let candidate_vec = vectors.vector(candidate.node);
        let diverse = selected.iter().all(|kept| {
            distance(params.distance, candidate_vec, vectors.vector(kept.node)) >= candidate.dist
        });
        if diverse {
            selected.push(candidate);
        }
    }
    selected.into_iter().map(|n| n.node).collect()
}

/// Inserts a node at a pre-sampled level. The edge store must be transient.
pub fn insert(
    graph: &EdgeStore,
    vectors: &VectorStore,
    params: &HnswParams,
    node: NodeId,
    level: u8,
    query: &[f32],
) -> Result<()> {
    let Some(entry) = graph.entry_point() else {
        // First node becomes the entry point; no edges yet.
        graph.maybe_promote(node, level);
        return Ok(());
    };
    let top_level = graph.current_max_level();

    let mut ep = Near {
        dist: dist_to(params, vectors, query, entry),
        node: entry,
    };
    for layer in (level + 1..=top_level).rev() {
        ep = greedy_step(graph, vectors, params, query, layer, ep);
    }

    for layer in (0..=level.min(top_level)).rev() {
        let found = search_layer(
            graph,
            vectors,
            params,
            query,
            &[ep],
            params.ef_construction,
            layer,
            &|n| n != node,
        );
        let cap = params.cap(layer);
        let selected = select_diverse(vectors, params, &found, cap);

        graph.set_neighbors(layer, node, &selected)?;
        for &neighbor in &selected {
            link_bidirectional(graph, vectors, params, layer, node, neighbor)?;
        }
        ensure_reachable(graph, vectors, params, layer, node, &selected)?;

        if let Some(best) = found.first() {
            ep = *best;
        }
    }

    graph.maybe_promote(node, level);
    Ok(())
}

/// Adds `node` to `neighbor`'s row, pruning with the diversity heuristic
/// on overflow. Edges dropped by the prune are removed from both sides so
/// the graph stays bidirectional after the operation completes.
fn link_bidirectional(
    graph: &EdgeStore,
    vectors: &VectorStore,
    params: &HnswParams,
    layer: u8,
    node: NodeId,
    neighbor: NodeId,
) -> Result<()> {
    let cap = params.cap(layer);
    let mut dropped: Vec<NodeId> = Vec::new();
    graph.update_neighbors(layer, neighbor, |row| {
        if row.contains(&node) {
            return;
        }
        row.push(node);
        if row.len() > cap {
            let anchor = vectors.vector(neighbor);
            let mut scored: Vec<Near> = row
                .iter()
                .map(|&n| Near {
                    dist: dist_to(params, vectors, anchor, n),
                    node: n,
                })
                .collect();
            scored.sort_unstable();
            let kept = select_diverse(vectors, params, &scored, cap);
            dropped = row
                .iter()
                .copied()
                .filter(|n| !kept.contains(n))
                .collect();
            *row = kept;
        }
    })?;
    for d in dropped {
        graph.update_neighbors(layer, d, |row| {
            row.retain(|&n| n != neighbor);
        })?;
    }
    Ok(())
}

/// Guarantees a fresh node keeps at least one bidirectional edge: if every
/// selected neighbor pruned it away, force-link to the closest one,
/// evicting one of that neighbor's edges symmetrically to make room.
fn ensure_reachable(
    graph: &EdgeStore,
    vectors: &VectorStore,
    params: &HnswParams,
    layer: u8,
    node: NodeId,
    selected: &[NodeId],
) -> Result<()> {
    if selected.is_empty() || !graph.neighbors(layer, node).is_empty() {
        return Ok(());
    }
    let anchor = selected[0];
    let mut evicted = None;
    graph.update_neighbors(layer, anchor, |row| {
        if row.len() >= params.cap(layer) {
            evicted = row.pop();
        }
        row.push(node);
    })?;
    if let Some(e) = evicted {
        graph.update_neighbors(layer, e, |row| {
            row.retain(|&n| n != anchor);
        })?;
    }
    graph.set_neighbors(layer, node, &[anchor])?;
    Ok(())
}

/// Searches for the `k` nearest live nodes.
///
/// `keep` gates entry to the result set (deleted nodes and slots invisible
/// to the branch); the expansion frontier is unrestricted.
pub fn search(
    graph: &EdgeStore,
    vectors: &VectorStore,
    params: &HnswParams,
    query: &[f32],
    k: usize,
    ef: usize,
    keep: &dyn Fn(NodeId) -> bool,
) -> Vec<SearchHit> {
    let Some(entry) = graph.entry_point() else {
        return Vec::new();
    };
    let mut ep = Near {
        dist: dist_to(params, vectors, query, entry),
        node: entry,
    };
    for layer in (1..=graph.current_max_level()).rev() {
        ep = greedy_step(graph, vectors, params, query, layer, ep);
    }

    let ef = ef.max(k);
    let found = search_layer(graph, vectors, params, query, &[ep], ef, 0, keep);
    found
        .into_iter()
        .take(k)
        .map(|n| SearchHit {
            node: n.node,
            distance: n.dist,
        })
        .collect()
}

/// Removes a deleted node's edges and repairs its former neighbors from
/// their two-hop neighborhood via the diversity heuristic.
///
/// `node_count` bounds the scan used when the entry point itself died.
pub fn repair_after_delete(
    graph: &EdgeStore,
    vectors: &VectorStore,
    params: &HnswParams,
    node: NodeId,
    node_count: u32,
) -> Result<()> {
    let top_level = graph.current_max_level();
    let mut former_by_layer: Vec<Vec<NodeId>> = Vec::with_capacity(top_level as usize + 1);

    for layer in 0..=top_level {
        let former = graph.neighbors(layer, node);
        graph.set_neighbors(layer, node, &[])?;
        for &f in &former {
            graph.update_neighbors(layer, f, |row| {
                row.retain(|&n| n != node);
            })?;
        }
        former_by_layer.push(former);
    }

    for (layer, former) in former_by_layer.iter().enumerate() {
        let layer = layer as u8;
        let cap = params.cap(layer);
        for &f in former {
            if graph.is_deleted(f) {
                continue;
            }
            // Candidate pool: the node's other former neighbors plus f's
            // two-hop neighborhood.
            let mut pool: HashSet<NodeId> = former.iter().copied().collect();
            for n in graph.neighbors(layer, f) {
                pool.insert(n);
                for nn in graph.neighbors(layer, n) {
                    pool.insert(nn);
                }
            }
            pool.remove(&f);
            pool.remove(&node);

            let anchor = vectors.vector(f);
            let mut scored: Vec<Near> = pool
                .into_iter()
                .filter(|&n| !graph.is_deleted(n))
                .map(|n| Near {
                    dist: dist_to(params, vectors, anchor, n),
                    node: n,
                })
                .collect();
            scored.sort_unstable();
            let selected = select_diverse(vectors, params, &scored, cap);

            // Apply the new row symmetrically: removals clear both sides,
            // additions only stand when the counterpart keeps the edge.
            let old_row = graph.neighbors(layer, f);
            let mut final_row: Vec<NodeId> = Vec::with_capacity(selected.len());
            for s in selected {
                if old_row.contains(&s) {
                    final_row.push(s);
                    continue;
                }
                let mut accepted = false;
                graph.update_neighbors(layer, s, |row| {
                    if row.contains(&f) {
                        accepted = true;
                    } else if row.len() < cap {
                        row.push(f);
                        accepted = true;
                    }
                })?;
                if accepted {
                    final_row.push(s);
                }
            }
            for &r in &old_row {
                if !final_row.contains(&r) {
                    graph.update_neighbors(layer, r, |row| {
                        row.retain(|&n| n != f);
                    })?;
                }
            }
            graph.set_neighbors(layer, f, &final_row)?;
        }
    }

    // Re-seat the entry point if it died.
    if graph.entry_point() == Some(node) {
        let mut replacement = None;
        'outer: for layer in (0..=top_level).rev() {
            for &f in &former_by_layer[layer as usize] {
                if !graph.is_deleted(f) {
                    replacement = Some((f, layer));
                    break 'outer;
                }
            }
        }
        if replacement.is_none() {
            replacement = (0..node_count)
                .map(NodeId)
                .find(|&n| n != node && !graph.is_deleted(n))
                .map(|n| (n, 0));
        }
        match replacement {
            Some((n, level)) => {
                graph.set_entry_point(Some(n));
                graph.set_max_level(level);
            }
            None => {
                graph.set_entry_point(None);
                graph.set_max_level(0);
            }
        }
    }
    Ok(())
}

/// Structural oracle used by tests and metrics: no self-loops, no
/// duplicate neighbors, and every edge bidirectional.
pub fn check_invariants(graph: &EdgeStore, node_count: u32) -> std::result::Result<(), String> {
    let top = graph.current_max_level();
    for layer in 0..=top {
        for id in 0..node_count {
            let node = NodeId(id);
            let neighbors = graph.neighbors(layer, node);
            let mut seen = HashSet::new();
            for &n in &neighbors {
                if n == node {
                    return Err(format!("self-loop at node {} layer {}", id, layer));
                }
                if !seen.insert(n) {
                    return Err(format!("duplicate neighbor {} at node {} layer {}", n, id, layer));
                }
                if n.0 >= node_count {
                    return Err(format!(
                        "neighbor {} out of range at node {} layer {}",
                        n, id, layer
                    ));
                }
                if !graph.neighbors(layer, n).contains(&node) {
                    return Err(format!(
                        "edge {} -> {} not bidirectional at layer {}",
                        id, n, layer
                    ));
                }
            }
        }
    }
    Ok(())
}
