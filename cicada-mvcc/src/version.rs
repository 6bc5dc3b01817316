use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use crate::timestamp::Timestamp;

/// Index of a tuple slot in the [`Table`](crate::Table).
pub type TupleId = usize;

/// Stable handle of a version living in the [`VersionArena`](crate::arena::VersionArena).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionId(u64);

impl VersionId {
    #[inline]
    pub(crate) const fn new(raw: u64) -> Self {
        VersionId(raw)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Where a version lives: embedded in its tuple, or in the shared arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VersionRef {
    Inline(TupleId),
    Heap(VersionId),
}

impl VersionRef {
    pub fn is_inline(self) -> bool {
        matches!(self, VersionRef::Inline(_))
    }
}

/// Lifecycle of a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VersionStatus {
    /// Not part of any chain (pooled, or a free inline slot).
    Unused = 0,
    /// Installed by an inflight transaction; must not be read through.
    Pending = 1,
    Committed = 2,
    /// Rolled back; stays in the chain as a tombstone readers skip.
    Aborted = 3,
}

impl VersionStatus {
    #[inline]
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => VersionStatus::Unused,
            1 => VersionStatus::Pending,
            2 => VersionStatus::Committed,
            _ => VersionStatus::Aborted,
        }
    }
}

const NULL_REF: u64 = u64::MAX;
const INLINE_TAG: u64 = 1 << 63;

#[inline]
fn encode(r: Option<VersionRef>) -> u64 {
    match r {
        None => NULL_REF,
        Some(VersionRef::Inline(tuple)) => INLINE_TAG | tuple as u64,
        Some(VersionRef::Heap(id)) => id.0,
    }
}

#[inline]
fn decode(raw: u64) -> Option<VersionRef> {
    if raw == NULL_REF {
        None
    } else if raw & INLINE_TAG != 0 {
        Some(VersionRef::Inline((raw & !INLINE_TAG) as TupleId))
    } else {
        Some(VersionRef::Heap(VersionId(raw)))
    }
}

/// An atomic, nullable [`VersionRef`] packed into one word.
///
/// Used for chain heads and `next` links. Heap handles use the low 63 bits,
/// inline references set the top bit, and all ones means null.
pub struct AtomicVersionRef {
    data: AtomicU64,
}

impl AtomicVersionRef {
    pub fn new(r: Option<VersionRef>) -> Self {
        Self {
            data: AtomicU64::new(encode(r)),
        }
    }

    pub fn null() -> Self {
        Self::new(None)
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> Option<VersionRef> {
        decode(self.data.load(order))
    }

    #[inline]
    pub fn store(&self, r: Option<VersionRef>, order: Ordering) {
        self.data.store(encode(r), order);
    }

    #[inline]
    pub fn swap(&self, r: Option<VersionRef>, order: Ordering) -> Option<VersionRef> {
        decode(self.data.swap(encode(r), order))
    }

    #[inline]
    pub fn compare_exchange(
        &self,
        current: Option<VersionRef>,
        new: Option<VersionRef>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Option<VersionRef>, Option<VersionRef>> {
        self.data
            .compare_exchange(encode(current), encode(new), success, failure)
            .map(decode)
            .map_err(decode)
    }
}

impl std::fmt::Debug for AtomicVersionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AtomicVersionRef")
            .field(&self.load(Ordering::Relaxed))
            .finish()
    }
}

/// One value of a record at a point in logical time.
///
/// Status and timestamps are atomics. The payload is plain memory: it is
/// written only while the version is exclusively owned by one executor
/// (tentative, pooled, or a checked out inline slot) and read only after
/// the version became reachable through an acquire load of a chain link.
pub struct Version {
    status: AtomicU8,
    wts: AtomicU64,
    rts: AtomicU64,
    next: AtomicVersionRef,
    payload: UnsafeCell<Box<[u8]>>,
}

// SAFETY: payload mutation is confined to the exclusive owner, see the
// type level docs; everything else is atomic.
unsafe impl Sync for Version {}

impl Version {
    pub(crate) fn new(val_size: usize) -> Self {
        Self {
            status: AtomicU8::new(VersionStatus::Unused as u8),
            wts: AtomicU64::new(0),
            rts: AtomicU64::new(0),
            next: AtomicVersionRef::null(),
            payload: UnsafeCell::new(vec![0u8; val_size].into_boxed_slice()),
        }
    }

    /// Resets every field for a new tenant writing at `wts`.
    ///
    /// # Safety
    ///
    /// The caller must own the version exclusively: it is not reachable
    /// from any chain and no other executor holds its handle.
    pub(crate) unsafe fn set(&self, wts: Timestamp) {
        self.wts.store(wts.raw(), Ordering::Relaxed);
        self.rts.store(wts.raw(), Ordering::Relaxed);
        self.next.store(None, Ordering::Relaxed);
        unsafe { (*self.payload.get()).fill(0) };
        self.status
            .store(VersionStatus::Pending as u8, Ordering::Release);
    }

    /// Overwrites the payload prefix with `data`; the rest stays zeroed by `set`.
    ///
    /// # Safety
    ///
    /// Same exclusivity contract as [`set`](Self::set).
    pub(crate) unsafe fn write_payload(&self, data: &[u8]) {
        let payload = unsafe { &mut *self.payload.get() };
        payload[..data.len()].copy_from_slice(data);
        payload[data.len()..].fill(0);
    }

    /// Copies the whole payload of `src` into this version.
    ///
    /// # Safety
    ///
    /// Same exclusivity contract as [`set`](Self::set); `src` must be
    /// reachable (its payload is immutable).
    pub(crate) unsafe fn copy_payload_from(&self, src: &Version) {
        let payload = unsafe { &mut *self.payload.get() };
        payload.copy_from_slice(src.payload());
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        // SAFETY: see the type level docs.
        unsafe { &*self.payload.get() }
    }

    #[inline]
    pub fn status(&self) -> VersionStatus {
        VersionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn store_status(&self, status: VersionStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    #[inline]
    pub fn wts(&self) -> Timestamp {
        Timestamp::from_raw(self.wts.load(Ordering::Acquire))
    }

    #[inline]
    pub fn rts(&self) -> Timestamp {
        Timestamp::from_raw(self.rts.load(Ordering::Acquire))
    }

    /// Raises `rts` to at least `ts`. Never lowers it.
    ///
    /// Returns the value of `rts` after the call.
    pub fn bump_rts(&self, ts: Timestamp) -> Timestamp {
        let mut expected = self.rts.load(Ordering::Acquire);
        loop {
            if expected >= ts.raw() {
                return Timestamp::from_raw(expected);
            }
            match self.rts.compare_exchange_weak(
                expected,
                ts.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return ts,
                Err(current) => expected = current,
            }
        }
    }

    #[inline]
    pub fn next(&self) -> Option<VersionRef> {
        self.next.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn link(&self) -> &AtomicVersionRef {
        &self.next
    }

    /// Detaches and returns the rest of the chain below this version.
    #[inline]
    pub(crate) fn take_next(&self) -> Option<VersionRef> {
        self.next.swap(None, Ordering::AcqRel)
    }

    pub(crate) fn is_visible_at(&self, as_of: Timestamp) -> bool {
        self.status() == VersionStatus::Committed && self.wts() <= as_of
    }
}

impl std::fmt::Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Version")
            .field("status", &self.status())
            .field("wts", &self.wts())
            .field("rts", &self.rts())
            .field("next", &self.next())
            .finish()
    }
}
