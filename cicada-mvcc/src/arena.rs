//! Segmented storage for heap versions.
//!
//! Versions are never deallocated while the engine lives. A handle
//! ([`VersionId`]) is the global index of a version; the segment holding it
//! is materialized on first use. Reclaimed versions go back through a free
//! list instead of the allocator, so a stale handle always points at a
//! valid `Version`, at worst one owned by a new tenant.

use crossbeam_utils::CachePadded;
use once_cell::race::OnceBox;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{CicadaError, Result};
use crate::version::{Version, VersionId};

pub(crate) const SEGMENT_SHIFT: u32 = 12;

/// Versions per arena segment.
pub const SEGMENT_VERSIONS: usize = 1 << SEGMENT_SHIFT;

const SEGMENT_MASK: u64 = (SEGMENT_VERSIONS as u64) - 1;

struct Segment {
    versions: Box<[Version]>,
}

impl Segment {
    fn new(val_size: usize) -> Self {
        Self {
            versions: (0..SEGMENT_VERSIONS).map(|_| Version::new(val_size)).collect(),
        }
    }
}

pub struct VersionArena {
    segments: Box<[OnceBox<Segment>]>,
    /// Bump pointer over never-used handles.
    next: CachePadded<AtomicU64>,
    /// Handles released by executors that do not keep a reuse pool.
    free: Mutex<Vec<VersionId>>,
    val_size: usize,
}

impl VersionArena {
    pub fn new(segments: usize, val_size: usize) -> Self {
        Self {
            segments: (0..segments).map(|_| OnceBox::new()).collect(),
            next: CachePadded::new(AtomicU64::new(0)),
            free: Mutex::new(Vec::new()),
            val_size,
        }
    }

    /// Total number of versions the arena can hand out.
    pub fn capacity(&self) -> usize {
        self.segments.len() * SEGMENT_VERSIONS
    }

    pub fn val_size(&self) -> usize {
        self.val_size
    }

    /// Handles ever handed out by the bump pointer.
    pub fn allocated(&self) -> usize {
        self.next.load(Ordering::Relaxed) as usize
    }

    /// Length of the global free list.
    pub fn free_len(&self) -> usize {
        self.free.lock().len()
    }

    /// Hands out one unused version, preferring the global free list.
    pub fn allocate(&self) -> Result<VersionId> {
        if let Some(id) = self.free.lock().pop() {
            return Ok(id);
        }
        self.bump(1).map(VersionId::new)
    }

    /// Hands out `n` unused versions: the global free list first, the rest
    /// in one bump. On failure nothing is taken.
    pub fn allocate_block(&self, n: usize) -> Result<Vec<VersionId>> {
        let mut free = self.free.lock();
        let reused = n.min(free.len());
        let fresh = n - reused;
        let start = self.bump(fresh)?;
        let split = free.len() - reused;
        let mut block = free.split_off(split);
        block.extend((start..start + fresh as u64).map(VersionId::new));
        Ok(block)
    }

    /// Advances the bump pointer by `n` only if the whole range fits.
    fn bump(&self, n: usize) -> Result<u64> {
        let capacity = self.capacity() as u64;
        self.next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |start| {
                start.checked_add(n as u64).filter(|&end| end <= capacity)
            })
            .map_err(|_| CicadaError::ArenaExhausted {
                capacity: self.capacity(),
            })
    }

    #[inline]
    pub fn get(&self, id: VersionId) -> &Version {
        let raw = id.raw();
        let segment = self.segments[(raw >> SEGMENT_SHIFT) as usize]
            .get_or_init(|| Box::new(Segment::new(self.val_size)));
        &segment.versions[(raw & SEGMENT_MASK) as usize]
    }

    /// Returns a version to the global free list. The caller must have
    /// detached it from every chain.
    pub fn free(&self, id: VersionId) {
        self.free.lock().push(id);
    }

    pub fn free_many(&self, ids: impl IntoIterator<Item = VersionId>) {
        self.free.lock().extend(ids);
    }
}

impl std::fmt::Debug for VersionArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionArena")
            .field("capacity", &self.capacity())
            .field("allocated", &self.allocated())
            .field("val_size", &self.val_size)
            .finish()
    }
}
