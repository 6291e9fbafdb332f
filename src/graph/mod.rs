//! Chunked copy-on-write edge store for the HNSW graph.
//!
//! Adjacency is stored per layer in dense chunks of [`CHUNK_SIZE`] rows:
//! layer 0 rows hold `M0` neighbor slots, upper layers hold `M`. Unused
//! slots are the sentinel [`NO_NEIGHBOR`]. A chunk is addressed by its
//! *encoded position* `(layer << 32) | chunk_index`, which is also the key
//! the dirty set and the persisted address map use.
//!
//! # Persistent / transient model
//!
//! A store is either *persistent* (pure: mutators panic) or *transient*
//! (a single logical writer may mutate in place). Chunks are `Arc` cells
//! tagged with the id of the store that owns them; writing through a store
//! that does not own a cell clones it first, so forks and earlier values
//! never observe later mutations. Any chunk written while transient joins
//! the dirty set and receives a fresh storage address at the next sync.
//!
//! Reads never block readers. Writers take one of 256 position-keyed
//! stripes, so concurrent writes to distinct chunks do not serialize.
//!
//! Chunks may be evicted after a commit (`softify`) and reloaded on demand
//! through a [`ChunkSource`] over the committed address map; restoring a
//! position absent from the map yields "no neighbors".

pub mod hnsw;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use roaring::RoaringBitmap;
use tracing::debug;

use crate::error::{Result, StorageError, ValidationError};
use crate::storage::schema::edge_chunk_key;
use crate::storage::{KvStore, PersistentSet};
use crate::types::{NodeId, StorageAddress};

/// Rows per edge chunk.
pub const CHUNK_SIZE: usize = 1024;

/// Sentinel for an unused neighbor slot.
pub const NO_NEIGHBOR: i32 = -1;

const STRIPES: usize = 256;

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

/// Packs a layer and chunk index into an encoded position.
#[inline]
pub fn encode_position(layer: u8, chunk_index: u32) -> u64 {
    ((layer as u64) << 32) | chunk_index as u64
}

/// Unpacks an encoded position.
#[inline]
pub fn decode_position(position: u64) -> (u8, u32) {
    ((position >> 32) as u8, position as u32)
}

/// Serializes chunk slots to little-endian bytes for the KV store.
pub fn chunk_to_bytes(slots: &[i32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(slots.len() * 4);
    for slot in slots {
        bytes.extend_from_slice(&slot.to_le_bytes());
    }
    bytes
}

/// Parses chunk bytes back into neighbor slots.
pub fn bytes_to_chunk(bytes: &[u8]) -> Result<Box<[i32]>> {
    if bytes.len() % 4 != 0 {
        return Err(StorageError::corrupted("Edge chunk length not a multiple of 4").into());
    }
    let mut slots = Vec::with_capacity(bytes.len() / 4);
    for quad in bytes.chunks_exact(4) {
        slots.push(i32::from_le_bytes(quad.try_into().unwrap()));
    }
    Ok(slots.into_boxed_slice())
}

/// Capability to reload an evicted chunk from durable storage.
pub trait ChunkSource: Send + Sync {
    /// Returns the chunk at the encoded position, or `None` when the
    /// position is not in the address map.
    fn restore(&self, position: u64) -> Result<Option<Box<[i32]>>>;
}

/// [`ChunkSource`] over the KV store and a committed address map snapshot.
pub struct KvChunkSource {
    store: Arc<dyn KvStore>,
    addresses: PersistentSet<u64, StorageAddress>,
}

impl KvChunkSource {
    /// Builds a source over a committed edges address map.
    pub fn new(store: Arc<dyn KvStore>, addresses: PersistentSet<u64, StorageAddress>) -> Self {
        Self { store, addresses }
    }
}

impl ChunkSource for KvChunkSource {
    fn restore(&self, position: u64) -> Result<Option<Box<[i32]>>> {
        let Some(addr) = self.addresses.get(&position) else {
            return Ok(None);
        };
        let Some(bytes) = self.store.get(&edge_chunk_key(*addr))? else {
            return Err(crate::error::IntegrityError::ChunkNotFound {
                position,
                storage_addr: addr.to_string(),
            }
            .into());
        };
        Ok(Some(bytes_to_chunk(&bytes)?))
    }
}

struct ChunkCell {
    /// Id of the store that may mutate these slots in place.
    owner: u64,
    slots: RwLock<Box<[i32]>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct GraphTop {
    entry: Option<NodeId>,
    max_level: u8,
}

/// The COW chunked hierarchical adjacency store.
pub struct EdgeStore {
    max_nodes: u32,
    max_level: u8,
    m: usize,
    m0: usize,
    store_id: u64,
    transient: bool,
    chunks: RwLock<HashMap<u64, Arc<ChunkCell>>>,
    dirty: Mutex<HashSet<u64>>,
    stripes: Vec<Mutex<()>>,
    top: Mutex<GraphTop>,
    deleted: RwLock<RoaringBitmap>,
    source: RwLock<Option<Arc<dyn ChunkSource>>>,
}

impl std::fmt::Debug for EdgeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeStore")
            .field("store_id", &self.store_id)
            .field("transient", &self.transient)
            .field("chunks", &self.chunks.read().len())
            .field("dirty", &self.dirty.lock().len())
            .finish()
    }
}

impl EdgeStore {
    /// Creates an empty persistent store for the given geometry.
    pub fn new(max_nodes: u32, max_level: u8, m: usize, m0: usize) -> Self {
        Self {
            max_nodes,
            max_level,
            m,
            m0,
            store_id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            transient: false,
            chunks: RwLock::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
            stripes: (0..STRIPES).map(|_| Mutex::new(())).collect(),
            top: Mutex::new(GraphTop {
                entry: None,
                max_level: 0,
            }),
            deleted: RwLock::new(RoaringBitmap::new()),
            source: RwLock::new(None),
        }
    }

    fn clone_with(&self, dirty: HashSet<u64>) -> Self {
        Self {
            max_nodes: self.max_nodes,
            max_level: self.max_level,
            m: self.m,
            m0: self.m0,
            store_id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            transient: false,
            chunks: RwLock::new(self.chunks.read().clone()),
            dirty: Mutex::new(dirty),
            stripes: (0..STRIPES).map(|_| Mutex::new(())).collect(),
            top: Mutex::new(*self.top.lock()),
            deleted: RwLock::new(self.deleted.read().clone()),
            source: RwLock::new(self.source.read().clone()),
        }
    }

    /// Forks the store: shared chunk refs, empty dirty set, persistent
    /// mode, regardless of the parent's mode.
    pub fn fork(&self) -> Self {
        self.clone_with(HashSet::new())
    }

    /// Clones for the next value in the same lineage: shared chunk refs
    /// and the dirty set carried over so uncommitted chunks still flush
    /// at the next sync.
    pub fn clone_for_update(&self) -> Self {
        self.clone_with(self.dirty.lock().clone())
    }

    /// Switches to transient mode, enabling in-place mutation for a
    /// single logical writer. A no-op when already transient.
    pub fn as_transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Seals the store; subsequent mutation attempts panic.
    pub fn as_persistent(mut self) -> Self {
        self.transient = false;
        self
    }

    /// True while the store accepts mutation.
    #[inline]
    pub fn is_transient(&self) -> bool {
        self.transient
    }

    /// Maximum node capacity.
    #[inline]
    pub fn max_nodes(&self) -> u32 {
        self.max_nodes
    }

    /// Maximum layer the geometry allows.
    #[inline]
    pub fn max_level_limit(&self) -> u8 {
        self.max_level
    }

    /// Neighbor slots per row at a layer.
    #[inline]
    pub fn slot_limit(&self, layer: u8) -> usize {
        if layer == 0 {
            self.m0
        } else {
            self.m
        }
    }

    fn assert_transient(&self) {
        assert!(
            self.transient,
            "edge store mutation while persistent (call as_transient first)"
        );
    }

    fn check_capacity(&self, node: NodeId) -> Result<()> {
        if node.0 >= self.max_nodes {
            return Err(ValidationError::capacity_exceeded(self.max_nodes as u64).into());
        }
        Ok(())
    }

    fn stripe(&self, position: u64) -> &Mutex<()> {
        &self.stripes[(position as usize) % STRIPES]
    }

    /// Loads or fabricates the cell at a position for writing.
    /// Caller must hold the stripe for the position.
    fn cell_for_write(&self, position: u64) -> Result<Arc<ChunkCell>> {
        let existing = self.chunks.read().get(&position).cloned();
        let cell = match existing {
            Some(cell) if cell.owner == self.store_id => cell,
            Some(cell) => {
                // Copy-on-write: the cell is shared with a fork or an
                // earlier value of this lineage.
                let cloned = Arc::new(ChunkCell {
                    owner: self.store_id,
                    slots: RwLock::new(cell.slots.read().clone()),
                });
                self.chunks.write().insert(position, cloned.clone());
                cloned
            }
            None => {
                let (layer, _) = decode_position(position);
                let slots = match self.restore_from_source(position)? {
                    Some(slots) => slots,
                    None => vec![NO_NEIGHBOR; CHUNK_SIZE * self.slot_limit(layer)]
                        .into_boxed_slice(),
                };
                let cell = Arc::new(ChunkCell {
                    owner: self.store_id,
                    slots: RwLock::new(slots),
                });
                self.chunks.write().insert(position, cell.clone());
                cell
            }
        };
        Ok(cell)
    }

    fn restore_from_source(&self, position: u64) -> Result<Option<Box<[i32]>>> {
        let source = self.source.read().clone();
        match source {
            Some(source) => source.restore(position),
            None => Ok(None),
        }
    }

    /// Reads the neighbor list of a node at a layer. Sentinel slots are
    /// stripped; an absent chunk reads as no neighbors.
    pub fn neighbors(&self, layer: u8, node: NodeId) -> Vec<NodeId> {
        let chunk_index = node.0 / CHUNK_SIZE as u32;
        let position = encode_position(layer, chunk_index);
        let row = (node.0 as usize % CHUNK_SIZE) * self.slot_limit(layer);

        let cell = self.chunks.read().get(&position).cloned();
        let cell = match cell {
            Some(cell) => cell,
            None => match self.restore_and_cache(position) {
                Some(cell) => cell,
                None => return Vec::new(),
            },
        };
        let slots = cell.slots.read();
        slots[row..row + self.slot_limit(layer)]
            .iter()
            .take_while(|&&s| s != NO_NEIGHBOR)
            .map(|&s| NodeId(s as u32))
            .collect()
    }

    fn restore_and_cache(&self, position: u64) -> Option<Arc<ChunkCell>> {
        let slots = self.restore_from_source(position).ok().flatten()?;
        let cell = Arc::new(ChunkCell {
            // Restored content matches the committed bytes; tagging it
            // owned is safe because it is private to this store's map.
            owner: self.store_id,
            slots: RwLock::new(slots),
        });
        self.chunks.write().entry(position).or_insert(cell.clone());
        Some(cell)
    }

    /// Overwrites the neighbor row of a node. Lists longer than the layer
    /// cap are truncated.
    ///
    /// # Panics
    /// Panics while persistent.
    pub fn set_neighbors(&self, layer: u8, node: NodeId, neighbors: &[NodeId]) -> Result<()> {
        self.update_neighbors(layer, node, |row| {
            row.clear();
            row.extend_from_slice(neighbors);
        })
    }

    /// Atomically transforms the neighbor row of a node under its chunk
    /// stripe. The closure sees the current (sentinel-stripped) list and
    /// mutates it in place; the result is truncated to the layer cap and
    /// sentinel-padded.
    pub fn update_neighbors(
        &self,
        layer: u8,
        node: NodeId,
        f: impl FnOnce(&mut Vec<NodeId>),
    ) -> Result<()> {
        self.assert_transient();
        self.check_capacity(node)?;
        assert!(layer <= self.max_level, "layer {} beyond limit", layer);

        let limit = self.slot_limit(layer);
        let chunk_index = node.0 / CHUNK_SIZE as u32;
        let position = encode_position(layer, chunk_index);
        let row_start = (node.0 as usize % CHUNK_SIZE) * limit;

        let _stripe = self.stripe(position).lock();
        let cell = self.cell_for_write(position)?;
        let mut slots = cell.slots.write();

        let mut current: Vec<NodeId> = slots[row_start..row_start + limit]
            .iter()
            .take_while(|&&s| s != NO_NEIGHBOR)
            .map(|&s| NodeId(s as u32))
            .collect();
        f(&mut current);
        current.truncate(limit);

        for (i, slot) in slots[row_start..row_start + limit].iter_mut().enumerate() {
            *slot = current.get(i).map_or(NO_NEIGHBOR, |n| n.0 as i32);
        }
        drop(slots);

        self.dirty.lock().insert(position);
        Ok(())
    }

    /// Current entry point, if the graph is non-empty.
    pub fn entry_point(&self) -> Option<NodeId> {
        self.top.lock().entry
    }

    /// Level of the entry point.
    pub fn current_max_level(&self) -> u8 {
        self.top.lock().max_level
    }

    /// Sets the entry point. Requires transient mode.
    pub fn set_entry_point(&self, entry: Option<NodeId>) {
        self.assert_transient();
        self.top.lock().entry = entry;
    }

    /// Sets the current max level. Requires transient mode.
    pub fn set_max_level(&self, level: u8) {
        self.assert_transient();
        self.top.lock().max_level = level;
    }

    /// Promotes the entry point when a node exceeds the current top level.
    pub fn maybe_promote(&self, node: NodeId, level: u8) {
        self.assert_transient();
        let mut top = self.top.lock();
        if top.entry.is_none() || level > top.max_level {
            top.entry = Some(node);
            top.max_level = level;
        }
    }

    /// Marks a node deleted. Requires transient mode.
    pub fn set_deleted(&self, node: NodeId) {
        self.assert_transient();
        self.deleted.write().insert(node.0);
    }

    /// True if the node is marked deleted.
    pub fn is_deleted(&self, node: NodeId) -> bool {
        self.deleted.read().contains(node.0)
    }

    /// Snapshot of the deleted-node bitmap.
    pub fn deleted_nodes(&self) -> RoaringBitmap {
        self.deleted.read().clone()
    }

    /// Number of deleted nodes below the given bound.
    pub fn deleted_count_below(&self, bound: u32) -> u64 {
        let deleted = self.deleted.read();
        if bound == 0 {
            0
        } else {
            deleted.range_cardinality(0..bound)
        }
    }

    /// Replaces the deleted bitmap (restore path).
    pub fn set_deleted_nodes(&self, bitmap: RoaringBitmap) {
        self.assert_transient();
        *self.deleted.write() = bitmap;
    }

    /// True when uncommitted chunk mutations exist.
    pub fn has_dirty(&self) -> bool {
        !self.dirty.lock().is_empty()
    }

    /// Snapshot of the dirty positions.
    pub fn dirty_positions(&self) -> Vec<u64> {
        let mut positions: Vec<u64> = self.dirty.lock().iter().copied().collect();
        positions.sort_unstable();
        positions
    }

    /// Removes the given positions from the dirty set. A chunk mutated
    /// after the snapshot was taken stays dirty.
    pub fn clear_dirty(&self, positions: &[u64]) {
        let mut dirty = self.dirty.lock();
        for position in positions {
            dirty.remove(position);
        }
    }

    /// Raw chunk bytes copy-out for persistence. `None` when not resident.
    pub fn chunk_by_encoded_position(&self, position: u64) -> Option<Box<[i32]>> {
        let cell = self.chunks.read().get(&position).cloned()?;
        let slots = cell.slots.read();
        Some(slots.clone())
    }

    /// Installs raw chunk slots at a position (restore path).
    pub fn set_chunk_by_encoded_position(&self, position: u64, slots: Box<[i32]>) {
        self.assert_transient();
        let cell = Arc::new(ChunkCell {
            owner: self.store_id,
            slots: RwLock::new(slots),
        });
        self.chunks.write().insert(position, cell);
    }

    /// Installs the chunk source used to reload evicted chunks.
    pub fn set_source(&self, source: Option<Arc<dyn ChunkSource>>) {
        *self.source.write() = source;
    }

    /// Evicts clean chunks beyond `cache_size` resident chunks. Dirty
    /// chunks always stay.
    pub fn softify(&self, cache_size: usize) {
        let dirty = self.dirty.lock().clone();
        let mut chunks = self.chunks.write();
        if chunks.len() <= cache_size {
            return;
        }
        let excess = chunks.len() - cache_size;
        let victims: Vec<u64> = chunks
            .keys()
            .filter(|pos| !dirty.contains(pos))
            .take(excess)
            .copied()
            .collect();
        for position in &victims {
            chunks.remove(position);
        }
        debug!(evicted = victims.len(), resident = chunks.len(), "Softified edge chunks");
    }

    /// Number of resident chunks.
    pub fn resident_chunks(&self) -> usize {
        self.chunks.read().len()
    }

    /// Total bidirectional edges over the resident graph.
    pub fn count_edges(&self) -> u64 {
        let chunks = self.chunks.read();
        let mut slots_used: u64 = 0;
        for cell in chunks.values() {
            let slots = cell.slots.read();
            slots_used += slots.iter().filter(|&&s| s != NO_NEIGHBOR).count() as u64;
        }
        slots_used / 2
    }
}
