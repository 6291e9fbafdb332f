//! Append-only vector store: mmap cache + chunked KV source of truth.
//!
//! Vectors live twice. A fixed-size memory-mapped file serves all reads
//! (distance kernels read the region in place, no copies, no I/O); the
//! durable copy is chunked into `chunk_size * dim * 4`-byte blocks written
//! asynchronously to the KV store. The mmap file is a cache that can be
//! rebuilt from the chunks.
//!
//! ## File format (version 1)
//!
//! ```text
//! HEADER (64 bytes):
//!   [magic "PVDB" 4B]
//!   [version u32 LE]
//!   [count u64 LE]        (vectors durable as of the last sync)
//!   [dim u64 LE]
//!   [chunk_size u64 LE]
//!   [reserved 32B]
//! BODY: capacity * dim * 4 bytes of dense little-endian f32
//! ```
//!
//! ## Crash consistency
//!
//! `sync` orders data bytes → header count → KV chunk drain. A header
//! count of `N` on disk means vectors `[0, N)` are recoverable from the
//! mmap or from KV chunks through the current address map; a crash
//! between any two steps rolls back to the previous sync.

#[cfg(not(target_endian = "little"))]
compile_error!("the vector store requires a little-endian architecture");

use std::cell::UnsafeCell;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use fs2::FileExt;
use memmap2::MmapMut;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, StorageError, ValidationError};
use crate::storage::schema::vector_chunk_key;
use crate::storage::{KvStore, PendingWrite};
use crate::types::{NodeId, StorageAddress};

/// Size of the mmap file header.
pub const HEADER_SIZE: usize = 64;

const MAGIC: &[u8; 4] = b"PVDB";
const FORMAT_VERSION: u32 = 1;

/// Shared mmap region.
///
/// Writes go through raw pointers and are serialized by the append lock;
/// readers only observe slots below the published count, which is stored
/// with release ordering after the bytes are in place.
struct MmapRegion {
    map: UnsafeCell<MmapMut>,
}

unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

impl MmapRegion {
    fn bytes(&self) -> &[u8] {
        unsafe { &*self.map.get() }
    }

    /// Caller must hold the append lock; ranges of concurrent writes
    /// never overlap reads below the published count.
    unsafe fn write(&self, offset: usize, data: &[u8]) {
        let map = unsafe { &mut *self.map.get() };
        map[offset..offset + data.len()].copy_from_slice(data);
    }

    fn flush(&self) -> std::io::Result<()> {
        unsafe { &*self.map.get() }.flush()
    }
}

struct AppendState {
    /// Vectors of the current partial chunk, rewritten on each flush.
    tail: Vec<f32>,
    /// Chunk index the tail belongs to.
    tail_chunk: u64,
    /// Chunk → address assignments not yet drained by a sync.
    flushed: Vec<(u64, StorageAddress)>,
    /// In-flight KV writes not yet drained by a sync.
    pending: Vec<PendingWrite>,
}

struct VectorStoreInner {
    path: PathBuf,
    dim: usize,
    capacity: u32,
    chunk_size: usize,
    crypto_hash: bool,
    region: MmapRegion,
    /// Held for its advisory lock; released on close or drop.
    file: File,
    kv: Arc<dyn KvStore>,
    slots: AtomicU32,
    append: Mutex<AppendState>,
    closed: AtomicBool,
}

/// Handle to the shared vector store of a branch lineage.
///
/// Cloning is cheap; all clones share the file, the slot counter, and the
/// pending-write bookkeeping. Appends are serialized by a mutex so slot
/// order matches KV chunk serialization order.
#[derive(Clone)]
pub struct VectorStore {
    inner: Arc<VectorStoreInner>,
}

impl std::fmt::Debug for VectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStore")
            .field("path", &self.inner.path)
            .field("dim", &self.inner.dim)
            .field("slots", &self.inner.slots.load(Ordering::Relaxed))
            .finish()
    }
}

fn as_bytes(vecs: &[f32]) -> &[u8] {
    unsafe { std::slice::from_raw_parts(vecs.as_ptr() as *const u8, vecs.len() * 4) }
}

impl VectorStore {
    /// Creates a fresh vector file at `path`, truncating anything there.
    pub fn create(
        path: &Path,
        dim: usize,
        capacity: u32,
        chunk_size: usize,
        crypto_hash: bool,
        kv: Arc<dyn KvStore>,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.try_lock_exclusive().map_err(|_| StorageError::Locked)?;

        let body = capacity as u64 * dim as u64 * 4;
        file.set_len(HEADER_SIZE as u64 + body)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        let region = MmapRegion {
            map: UnsafeCell::new(map),
        };

        let store = Self {
            inner: Arc::new(VectorStoreInner {
                path: path.to_path_buf(),
                dim,
                capacity,
                chunk_size,
                crypto_hash,
                region,
                file,
                kv,
                slots: AtomicU32::new(0),
                append: Mutex::new(AppendState {
                    tail: Vec::new(),
                    tail_chunk: 0,
                    flushed: Vec::new(),
                    pending: Vec::new(),
                }),
                closed: AtomicBool::new(false),
            }),
        };
        store.write_header(0);
        store.inner.region.flush()?;
        info!(path = %path.display(), dim, capacity, "Vector file created");
        Ok(store)
    }

    /// Opens an existing vector file, validating its header.
    ///
    /// Returns the store and the persisted count from the header. Callers
    /// restore any missing chunks past that count from the KV store.
    pub fn open(
        path: &Path,
        dim: usize,
        capacity: u32,
        chunk_size: usize,
        crypto_hash: bool,
        kv: Arc<dyn KvStore>,
    ) -> Result<(Self, u64)> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        file.try_lock_exclusive().map_err(|_| StorageError::Locked)?;

        let expected_len = HEADER_SIZE as u64 + capacity as u64 * dim as u64 * 4;
        if file.metadata()?.len() < expected_len {
            file.set_len(expected_len)?;
        }
        let map = unsafe { MmapMut::map_mut(&file)? };

        let header = &map[..HEADER_SIZE];
        if &header[..4] != MAGIC {
            return Err(StorageError::corrupted("Bad vector file magic").into());
        }
        let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(StorageError::VersionMismatch {
                expected: FORMAT_VERSION,
                found: version,
            }
            .into());
        }
        let count = u64::from_le_bytes(header[8..16].try_into().unwrap());
        let file_dim = u64::from_le_bytes(header[16..24].try_into().unwrap());
        let file_chunk = u64::from_le_bytes(header[24..32].try_into().unwrap());
        if file_dim != dim as u64 || file_chunk != chunk_size as u64 {
            return Err(StorageError::corrupted(format!(
                "Vector file geometry mismatch: dim {} chunk {} (expected {} / {})",
                file_dim, file_chunk, dim, chunk_size
            ))
            .into());
        }

        let region = MmapRegion {
            map: UnsafeCell::new(map),
        };

        // Rebuild the tail buffer so the partial chunk keeps rewriting
        // under new addresses as more vectors arrive.
        let tail_chunk = count / chunk_size as u64;
        let tail_start = tail_chunk * chunk_size as u64;
        let mut tail = Vec::new();
        {
            let bytes = region.bytes();
            let from = HEADER_SIZE + tail_start as usize * dim * 4;
            let to = HEADER_SIZE + count as usize * dim * 4;
            let floats = unsafe {
                std::slice::from_raw_parts(bytes[from..to].as_ptr() as *const f32, (to - from) / 4)
            };
            tail.extend_from_slice(floats);
        }

        debug!(path = %path.display(), count, "Vector file opened");

        let store = Self {
            inner: Arc::new(VectorStoreInner {
                path: path.to_path_buf(),
                dim,
                capacity,
                chunk_size,
                crypto_hash,
                region,
                file,
                kv,
                slots: AtomicU32::new(count as u32),
                append: Mutex::new(AppendState {
                    tail,
                    tail_chunk,
                    flushed: Vec::new(),
                    pending: Vec::new(),
                }),
                closed: AtomicBool::new(false),
            }),
        };
        Ok((store, count))
    }

    /// Vector dimensionality.
    #[inline]
    pub fn dim(&self) -> usize {
        self.inner.dim
    }

    /// Maximum number of vectors the file is sized for.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.inner.capacity
    }

    /// Vectors per KV chunk.
    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    /// Total slots allocated in the file across the whole lineage.
    #[inline]
    pub fn slot_count(&self) -> u32 {
        self.inner.slots.load(Ordering::Acquire)
    }

    /// Path of the mmap file.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Atomically reserves the next slot, writes the vector into the mmap,
    /// and buffers it for the async KV flush. Full chunks flush here.
    pub fn append(&self, vec: &[f32]) -> Result<NodeId> {
        if vec.len() != self.inner.dim {
            return Err(ValidationError::dimension_mismatch(self.inner.dim, vec.len()).into());
        }
        let mut state = self.inner.append.lock();
        let slot = self.inner.slots.load(Ordering::Relaxed);
        if slot >= self.inner.capacity {
            return Err(ValidationError::capacity_exceeded(self.inner.capacity as u64).into());
        }

        let offset = HEADER_SIZE + slot as usize * self.inner.dim * 4;
        unsafe { self.inner.region.write(offset, as_bytes(vec)) };
        state.tail.extend_from_slice(vec);
        self.inner.slots.store(slot + 1, Ordering::Release);

        if state.tail.len() == self.inner.chunk_size * self.inner.dim {
            self.flush_tail(&mut state, true);
        }
        Ok(NodeId(slot))
    }

    /// Packages the current partial chunk (if any) and hands it to the KV
    /// store for an async write. Does not wait.
    pub fn flush_async(&self) -> Result<()> {
        let mut state = self.inner.append.lock();
        if !state.tail.is_empty() {
            self.flush_tail(&mut state, false);
        }
        Ok(())
    }

    fn flush_tail(&self, state: &mut AppendState, complete: bool) {
        let bytes = as_bytes(&state.tail).to_vec();
        let addr = StorageAddress::for_chunk(&bytes, self.inner.crypto_hash);
        let chunk = state.tail_chunk;
        let pending = self.inner.kv.put_async(vector_chunk_key(addr), bytes);
        state.flushed.push((chunk, addr));
        state.pending.push(pending);
        if complete {
            state.tail.clear();
            state.tail_chunk += 1;
        }
    }

    /// The sync pipeline for the vector side:
    /// flush the partial chunk, force the mmap, publish the header count,
    /// force again, then await every KV write captured up to the flush
    /// point. Appends racing past the capture belong to the next commit.
    ///
    /// Returns the chunk → address assignments captured by this sync, in
    /// flush order (later entries supersede earlier ones per chunk).
    pub fn sync_flush(&self) -> Result<Vec<(u64, StorageAddress)>> {
        let (addresses, pending, count) = {
            let mut state = self.inner.append.lock();
            if !state.tail.is_empty() {
                self.flush_tail(&mut state, false);
            }
            let addresses = std::mem::take(&mut state.flushed);
            let pending = std::mem::take(&mut state.pending);
            let count = self.inner.slots.load(Ordering::Acquire);
            (addresses, pending, count)
        };

        self.inner.region.flush()?;
        self.write_header(count as u64);
        self.inner.region.flush()?;

        for write in pending {
            write.wait()?;
        }
        Ok(addresses)
    }

    fn write_header(&self, count: u64) {
        let mut header = [0u8; HEADER_SIZE];
        header[..4].copy_from_slice(MAGIC);
        header[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        header[8..16].copy_from_slice(&count.to_le_bytes());
        header[16..24].copy_from_slice(&(self.inner.dim as u64).to_le_bytes());
        header[24..32].copy_from_slice(&(self.inner.chunk_size as u64).to_le_bytes());
        unsafe { self.inner.region.write(0, &header) };
    }

    /// Reads the vector at a node id. No I/O.
    ///
    /// # Panics
    /// Panics if the slot was never allocated; that is a programming error.
    pub fn vector(&self, node: NodeId) -> &[f32] {
        let slot = node.0;
        assert!(
            slot < self.slot_count(),
            "vector {} out of bounds (slots: {})",
            slot,
            self.slot_count()
        );
        let from = HEADER_SIZE + slot as usize * self.inner.dim * 4;
        let bytes = &self.inner.region.bytes()[from..from + self.inner.dim * 4];
        unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const f32, self.inner.dim) }
    }

    /// Raw mapped body as f32s, for kernels that scan without copying.
    pub fn segment(&self) -> &[f32] {
        let bytes = &self.inner.region.bytes()[HEADER_SIZE..];
        unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const f32, bytes.len() / 4) }
    }

    /// Writes chunk bytes back into the mmap during a cold load.
    pub fn restore_chunk(&self, chunk_index: u64, bytes: &[u8]) -> Result<()> {
        let offset = HEADER_SIZE + chunk_index as usize * self.inner.chunk_size * self.inner.dim * 4;
        if offset + bytes.len() > HEADER_SIZE + self.inner.capacity as usize * self.inner.dim * 4 {
            return Err(StorageError::corrupted("Chunk exceeds vector file capacity").into());
        }
        let _guard = self.inner.append.lock();
        unsafe { self.inner.region.write(offset, bytes) };
        Ok(())
    }

    /// Publishes the restored slot count after a cold load.
    pub fn set_restored_count(&self, count: u64) {
        let mut state = self.inner.append.lock();
        self.inner.slots.store(count as u32, Ordering::Release);
        // Rebuild the tail so later appends rewrite the partial chunk.
        let tail_chunk = count / self.inner.chunk_size as u64;
        let tail_start = tail_chunk * self.inner.chunk_size as u64;
        state.tail_chunk = tail_chunk;
        state.tail.clear();
        let from = HEADER_SIZE + tail_start as usize * self.inner.dim * 4;
        let to = HEADER_SIZE + count as usize * self.inner.dim * 4;
        let bytes = self.inner.region.bytes();
        let floats = unsafe {
            std::slice::from_raw_parts(bytes[from..to].as_ptr() as *const f32, (to - from) / 4)
        };
        state.tail.extend_from_slice(floats);
        self.write_header(count);
    }

    /// Flushes the mmap and copies the file for a new branch.
    ///
    /// A reflink-capable filesystem makes this O(1) through the kernel
    /// copy path; otherwise it degrades to a byte copy.
    pub fn copy_to(&self, target: &Path) -> Result<()> {
        self.inner.region.flush()?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&self.inner.path, target)?;
        Ok(())
    }

    /// Syncs, then releases the file. The file itself is removed only when
    /// it lives in the tempdir.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.sync_flush()?;
        let _ = self.inner.file.unlock();
        let tempdir_owned = self.inner.path.starts_with(std::env::temp_dir());
        if tempdir_owned {
            if let Err(e) = std::fs::remove_file(&self.inner.path) {
                warn!(error = %e, "Failed to remove tempdir vector file");
            }
        }
        debug!(path = %self.inner.path.display(), tempdir_owned, "Vector store closed");
        Ok(())
    }
}
