//! Tuples and their newest-first version chains.

use crossbeam_utils::{Backoff, CachePadded};
use std::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, AtomicU64, Ordering};

use crate::arena::VersionArena;
use crate::error::{ConflictKind, Result};
use crate::timestamp::Timestamp;
use crate::version::{AtomicVersionRef, TupleId, Version, VersionRef, VersionStatus};

/// Ownership state of a tuple's embedded version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InlineState {
    Free = 0,
    /// Held by a write set, or linked into the chain.
    CheckedOut = 1,
}

const NO_GC_OWNER: u16 = 0;

/// One record slot.
pub struct Tuple {
    latest: AtomicVersionRef,
    inline: Version,
    inline_state: AtomicU8,
    /// Consecutive commits touching this tuple, saturating.
    continuing_commit: AtomicU32,
    /// Thread id + 1 of the executor collecting this chain, 0 when free.
    gc_owner: AtomicU16,
    /// wts of the version the last collection cut below.
    min_wts: AtomicU64,
}

impl Tuple {
    fn new(val_size: usize) -> Self {
        Self {
            latest: AtomicVersionRef::null(),
            inline: Version::new(val_size),
            inline_state: AtomicU8::new(InlineState::Free as u8),
            continuing_commit: AtomicU32::new(0),
            gc_owner: AtomicU16::new(NO_GC_OWNER),
            min_wts: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn latest(&self) -> Option<VersionRef> {
        self.latest.load(Ordering::Acquire)
    }

    pub fn inline_state(&self) -> InlineState {
        match self.inline_state.load(Ordering::Acquire) {
            0 => InlineState::Free,
            _ => InlineState::CheckedOut,
        }
    }

    pub(crate) fn try_checkout_inline(&self) -> bool {
        self.inline_state.load(Ordering::Relaxed) == InlineState::Free as u8
            && self
                .inline_state
                .compare_exchange(
                    InlineState::Free as u8,
                    InlineState::CheckedOut as u8,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
    }

    /// Marks the inline version unused and lets the next writer take it.
    pub(crate) fn return_inline(&self) {
        self.inline.store_status(VersionStatus::Unused);
        self.inline_state
            .store(InlineState::Free as u8, Ordering::Release);
    }

    pub fn continuing_commit(&self) -> u32 {
        self.continuing_commit.load(Ordering::Relaxed)
    }

    pub(crate) fn record_commit(&self) {
        let _ = self
            .continuing_commit
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                n.checked_add(1)
            });
    }

    pub(crate) fn reset_continuing_commit(&self) {
        if self.continuing_commit.load(Ordering::Relaxed) != 0 {
            self.continuing_commit.store(0, Ordering::Relaxed);
        }
    }

    /// Takes the right to collect this chain. Re-entrant for the holder.
    pub(crate) fn try_acquire_gc(&self, thread_id: usize) -> bool {
        let me = thread_id as u16 + 1;
        match self.gc_owner.compare_exchange(
            NO_GC_OWNER,
            me,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(owner) => owner == me,
        }
    }

    pub(crate) fn release_gc(&self, thread_id: usize) {
        let _ = self.gc_owner.compare_exchange(
            thread_id as u16 + 1,
            NO_GC_OWNER,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    pub fn min_wts(&self) -> Timestamp {
        Timestamp::from_raw(self.min_wts.load(Ordering::Acquire))
    }

    pub(crate) fn raise_min_wts(&self, ts: Timestamp) {
        self.min_wts.fetch_max(ts.raw(), Ordering::AcqRel);
    }
}

impl std::fmt::Debug for Tuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tuple")
            .field("latest", &self.latest())
            .field("inline_state", &self.inline_state())
            .field("continuing_commit", &self.continuing_commit())
            .field("min_wts", &self.min_wts())
            .finish()
    }
}

/// Outcome of resolving what a reader at some timestamp sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// A committed version with `wts <= as_of`.
    Visible(VersionRef),
    /// The first candidate is still pending; its fate decides the answer.
    Pending(VersionRef),
    Missing,
}

/// The single table: tuple slots plus the arena their heap versions live in.
pub struct Table {
    tuples: Box<[CachePadded<Tuple>]>,
    arena: VersionArena,
}

impl Table {
    pub fn new(tuples: usize, arena: VersionArena) -> Self {
        let val_size = arena.val_size();
        Self {
            tuples: (0..tuples)
                .map(|_| CachePadded::new(Tuple::new(val_size)))
                .collect(),
            arena,
        }
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    #[inline]
    pub fn tuple(&self, tid: TupleId) -> &Tuple {
        &self.tuples[tid]
    }

    #[inline]
    pub fn arena(&self) -> &VersionArena {
        &self.arena
    }

    #[inline]
    pub fn version(&self, r: VersionRef) -> &Version {
        match r {
            VersionRef::Inline(tid) => &self.tuples[tid].inline,
            VersionRef::Heap(id) => self.arena.get(id),
        }
    }

    /// Walks the chain of `tid` from its head.
    pub fn chain(&self, tid: TupleId) -> Chain<'_> {
        Chain {
            table: self,
            cursor: self.tuple(tid).latest(),
        }
    }

    /// First committed version with `wts <= as_of`, skipping everything else.
    pub fn find_visible(&self, tid: TupleId, as_of: Timestamp) -> Option<VersionRef> {
        self.chain(tid)
            .find(|(_, v)| v.is_visible_at(as_of))
            .map(|(r, _)| r)
    }

    /// Like [`find_visible`](Self::find_visible), but stops at a pending
    /// candidate instead of reading past it.
    pub fn resolve_visible(&self, tid: TupleId, as_of: Timestamp) -> Visibility {
        for (r, v) in self.chain(tid) {
            if v.wts() > as_of {
                continue;
            }
            match v.status() {
                VersionStatus::Committed => return Visibility::Visible(r),
                VersionStatus::Pending => return Visibility::Pending(r),
                VersionStatus::Aborted | VersionStatus::Unused => {}
            }
        }
        Visibility::Missing
    }

    /// Splices `new` into the chain of `tid`, keeping it sorted by wts.
    ///
    /// Versions with a larger wts stay in front. A read-modify-write that
    /// has to pass a pending or committed one fails with
    /// [`ConflictKind::WriteWrite`]; a blind write is ordered beneath it.
    pub fn install_tentative(
        &self,
        tid: TupleId,
        new: VersionRef,
        wts: Timestamp,
        rmw: bool,
    ) -> std::result::Result<(), ConflictKind> {
        let tuple = self.tuple(tid);
        let new_version = self.version(new);
        let backoff = Backoff::new();

        loop {
            let mut link = &tuple.latest;
            let mut expected = link.load(Ordering::Acquire);

            while let Some(r) = expected {
                let current = self.version(r);
                if current.wts() < wts {
                    break;
                }
                if rmw
                    && matches!(
                        current.status(),
                        VersionStatus::Pending | VersionStatus::Committed
                    )
                {
                    return Err(ConflictKind::WriteWrite);
                }
                link = current.link();
                expected = link.load(Ordering::Acquire);
            }

            new_version.link().store(expected, Ordering::Relaxed);
            match link.compare_exchange(expected, Some(new), Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(()),
                Err(_) => backoff.spin(),
            }
        }
    }

    /// Installs the initial committed version of an empty tuple at wts 0.
    ///
    /// Only valid before any executor runs against the table.
    pub fn load(&self, tid: TupleId, payload: &[u8], use_inline: bool) -> Result<VersionRef> {
        let tuple = self.tuple(tid);
        let r = if use_inline && tuple.try_checkout_inline() {
            VersionRef::Inline(tid)
        } else {
            VersionRef::Heap(self.arena.allocate()?)
        };
        let version = self.version(r);
        // SAFETY: the tuple is not reachable by any executor yet.
        unsafe {
            version.set(Timestamp::ZERO);
            version.write_payload(payload);
        }
        version.store_status(VersionStatus::Committed);
        tuple.latest.store(Some(r), Ordering::Release);
        Ok(r)
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("tuples", &self.tuples.len())
            .field("arena", &self.arena)
            .finish()
    }
}

/// Iterator over one version chain, newest first.
pub struct Chain<'a> {
    table: &'a Table,
    cursor: Option<VersionRef>,
}

impl<'a> Iterator for Chain<'a> {
    type Item = (VersionRef, &'a Version);

    fn next(&mut self) -> Option<Self::Item> {
        let r = self.cursor?;
        let version = self.table.version(r);
        self.cursor = version.next();
        Some((r, version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(tuples: usize) -> Table {
        Table::new(tuples, VersionArena::new(1, 4))
    }

    fn heap_version(table: &Table, wts: Timestamp, status: VersionStatus) -> VersionRef {
        let r = VersionRef::Heap(table.arena().allocate().unwrap());
        unsafe { table.version(r).set(wts) };
        table.version(r).store_status(status);
        r
    }

    fn wts_of_chain(table: &Table, tid: TupleId) -> Vec<Timestamp> {
        table.chain(tid).map(|(_, v)| v.wts()).collect()
    }

    #[test]
    fn load_prefers_inline_slot() {
        let t = table(2);
        assert_eq!(t.load(0, &[1], true).unwrap(), VersionRef::Inline(0));
        assert_eq!(t.tuple(0).inline_state(), InlineState::CheckedOut);
        assert!(matches!(t.load(1, &[1], false).unwrap(), VersionRef::Heap(_)));
        assert_eq!(t.version(VersionRef::Inline(0)).payload(), &[1, 0, 0, 0]);
    }

    #[test]
    fn install_keeps_chain_sorted() {
        let t = table(1);
        t.load(0, &[0], true).unwrap();
        for epoch in [10, 30, 20] {
            let r = heap_version(&t, Timestamp::new(epoch, 0), VersionStatus::Pending);
            t.install_tentative(0, r, Timestamp::new(epoch, 0), false)
                .unwrap();
        }
        assert_eq!(
            wts_of_chain(&t, 0),
            vec![
                Timestamp::new(30, 0),
                Timestamp::new(20, 0),
                Timestamp::new(10, 0),
                Timestamp::ZERO
            ]
        );
    }

    #[test]
    fn rmw_cannot_pass_newer_version() {
        let t = table(1);
        t.load(0, &[0], true).unwrap();
        let newer = heap_version(&t, Timestamp::new(9, 1), VersionStatus::Committed);
        t.install_tentative(0, newer, Timestamp::new(9, 1), false)
            .unwrap();

        let mine = heap_version(&t, Timestamp::new(5, 0), VersionStatus::Pending);
        assert_eq!(
            t.install_tentative(0, mine, Timestamp::new(5, 0), true),
            Err(ConflictKind::WriteWrite)
        );
        t.version(newer).store_status(VersionStatus::Aborted);
        assert!(t.install_tentative(0, mine, Timestamp::new(5, 0), true).is_ok());
    }

    #[test]
    fn visibility_skips_aborted_and_stops_at_pending() {
        let t = table(1);
        t.load(0, &[0], true).unwrap();
        let committed = heap_version(&t, Timestamp::new(4, 0), VersionStatus::Committed);
        t.install_tentative(0, committed, Timestamp::new(4, 0), false)
            .unwrap();
        let aborted = heap_version(&t, Timestamp::new(6, 0), VersionStatus::Aborted);
        t.install_tentative(0, aborted, Timestamp::new(6, 0), false)
            .unwrap();

        let at = Timestamp::new(7, 0);
        assert_eq!(t.find_visible(0, at), Some(committed));
        assert_eq!(t.resolve_visible(0, at), Visibility::Visible(committed));

        let pending = heap_version(&t, Timestamp::new(5, 0), VersionStatus::Pending);
        t.install_tentative(0, pending, Timestamp::new(5, 0), false)
            .unwrap();
        assert_eq!(t.resolve_visible(0, at), Visibility::Pending(pending));
        assert_eq!(t.find_visible(0, at), Some(committed));
        assert_eq!(
            t.resolve_visible(0, Timestamp::new(3, 0)),
            Visibility::Visible(VersionRef::Inline(0))
        );
    }

    #[test]
    fn empty_tuple_is_missing() {
        let t = table(1);
        assert_eq!(t.find_visible(0, Timestamp::MAX), None);
        assert_eq!(t.resolve_visible(0, Timestamp::MAX), Visibility::Missing);
    }

    #[test]
    fn inline_slot_round_trip() {
        let t = table(1);
        let tuple = t.tuple(0);
        assert!(tuple.try_checkout_inline());
        assert!(!tuple.try_checkout_inline());
        tuple.return_inline();
        assert_eq!(t.version(VersionRef::Inline(0)).status(), VersionStatus::Unused);
        assert!(tuple.try_checkout_inline());
    }

    #[test]
    fn gc_right_is_exclusive() {
        let t = table(1);
        let tuple = t.tuple(0);
        assert!(tuple.try_acquire_gc(3));
        assert!(tuple.try_acquire_gc(3));
        assert!(!tuple.try_acquire_gc(4));
        tuple.release_gc(4);
        assert!(!tuple.try_acquire_gc(4));
        tuple.release_gc(3);
        assert!(tuple.try_acquire_gc(4));
    }

    #[test]
    fn continuing_commit_saturates() {
        let t = table(1);
        let tuple = t.tuple(0);
        tuple.continuing_commit.store(u32::MAX, Ordering::Relaxed);
        tuple.record_commit();
        assert_eq!(tuple.continuing_commit(), u32::MAX);
        tuple.reset_continuing_commit();
        assert_eq!(tuple.continuing_commit(), 0);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn concurrent_commits_are_all_counted() {
        let t = std::sync::Arc::new(table(1));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let t = t.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        t.tuple(0).record_commit();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(t.tuple(0).continuing_commit(), 4_000);
    }

    #[test]
    fn min_wts_only_rises() {
        let t = table(1);
        let tuple = t.tuple(0);
        tuple.raise_min_wts(Timestamp::new(8, 0));
        tuple.raise_min_wts(Timestamp::new(2, 0));
        assert_eq!(tuple.min_wts(), Timestamp::new(8, 0));
    }
}
