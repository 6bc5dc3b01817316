//! Per-thread timestamp slots and the global MinWts / MinRts watermarks.
//!
//! Each executor owns exactly one slot and is the only writer of it. Any
//! thread may scan all slots; the scan result is only ever used as a lower
//! bound, so a stale read is harmless. The cached watermarks are raised with
//! `fetch_max` and never move backwards.

use crossbeam_utils::{Backoff, CachePadded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::error::{CicadaError, Result};
use crate::timestamp::{Timestamp, TimestampOracle};

/// Watermark value of a freshly started engine.
pub(crate) const INITIAL_MIN_WTS: Timestamp = Timestamp::from_raw(1 << crate::timestamp::THREAD_BITS);

struct ThreadSlot {
    wts: AtomicU64,
    rts: AtomicU64,
    owned: AtomicBool,
}

impl ThreadSlot {
    fn new() -> Self {
        Self {
            wts: AtomicU64::new(0),
            rts: AtomicU64::new(0),
            owned: AtomicBool::new(false),
        }
    }
}

/// Timestamp allocation plus watermark publication.
pub struct TimestampAuthority {
    oracle: Arc<dyn TimestampOracle>,
    slots: Box<[CachePadded<ThreadSlot>]>,
    min_wts: CachePadded<AtomicU64>,
    min_rts: CachePadded<AtomicU64>,
    first_allocated: AtomicUsize,
}

impl std::fmt::Debug for TimestampAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimestampAuthority")
            .field("threads", &self.slots.len())
            .field("min_wts", &self.min_wts())
            .field("min_rts", &self.min_rts())
            .finish()
    }
}

impl TimestampAuthority {
    /// Creates an authority with `threads` slots. Watermarks stay at zero
    /// (not live) until [`go_live`](Self::go_live) is called.
    pub fn new(threads: usize, oracle: Arc<dyn TimestampOracle>) -> Self {
        Self {
            oracle,
            slots: (0..threads).map(|_| CachePadded::new(ThreadSlot::new())).collect(),
            min_wts: CachePadded::new(AtomicU64::new(0)),
            min_rts: CachePadded::new(AtomicU64::new(0)),
            first_allocated: AtomicUsize::new(0),
        }
    }

    pub fn threads(&self) -> usize {
        self.slots.len()
    }

    /// Publishes the initial watermark. Executors block in
    /// [`wait_until_live`](Self::wait_until_live) until this has happened.
    pub fn go_live(&self) {
        self.min_wts.fetch_max(INITIAL_MIN_WTS.raw(), Ordering::AcqRel);
        self.min_rts.fetch_max(INITIAL_MIN_WTS.prev().raw(), Ordering::AcqRel);
    }

    pub fn is_live(&self) -> bool {
        self.min_wts.load(Ordering::Acquire) != 0
    }

    /// Spins until some thread published the initial watermark.
    ///
    /// Liveness depends on another thread calling `go_live`; the wait is
    /// bounded by `limit` so a missing bootstrap surfaces as an error.
    pub fn wait_until_live(&self, limit: Duration) -> Result<()> {
        let backoff = Backoff::new();
        let start = Instant::now();
        while !self.is_live() {
            if backoff.is_completed() {
                if start.elapsed() >= limit {
                    return Err(CicadaError::WatermarkNotLive {
                        waited: start.elapsed(),
                    });
                }
                std::thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
        Ok(())
    }

    /// Claims the slot of `thread_id` for one executor.
    pub(crate) fn claim(&self, thread_id: usize) -> Result<()> {
        let slot = self.slot(thread_id)?;
        slot.owned
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| CicadaError::ThreadSlotTaken { thread_id })
    }

    pub(crate) fn release(&self, thread_id: usize) {
        if let Some(slot) = self.slots.get(thread_id) {
            slot.owned.store(false, Ordering::Release);
        }
    }

    /// Allocates a fresh timestamp for `thread_id` and publishes it as the
    /// slot's write timestamp.
    pub fn allocate(&self, thread_id: usize) -> Timestamp {
        let ts = self.next_timestamp(thread_id);
        self.publish_wts(thread_id, ts);
        ts
    }

    /// Allocates a fresh timestamp without publishing it. The caller
    /// publishes whatever bound it has to hold.
    pub(crate) fn next_timestamp(&self, thread_id: usize) -> Timestamp {
        Timestamp::new(self.oracle.next_epoch(), thread_id)
    }

    /// First allocation of a new executor. Also counts registered threads.
    pub(crate) fn allocate_first(&self, thread_id: usize) -> Timestamp {
        let ts = self.allocate(thread_id);
        self.first_allocated.fetch_add(1, Ordering::AcqRel);
        ts
    }

    /// Number of executors that completed their first allocation.
    pub fn registered(&self) -> usize {
        self.first_allocated.load(Ordering::Acquire)
    }

    #[inline]
    pub fn publish_wts(&self, thread_id: usize, ts: Timestamp) {
        self.slots[thread_id].wts.store(ts.raw(), Ordering::Release);
    }

    #[inline]
    pub fn publish_rts(&self, thread_id: usize, ts: Timestamp) {
        self.slots[thread_id].rts.store(ts.raw(), Ordering::Release);
    }

    /// Minimum write timestamp over owned slots, or `None` if no executor
    /// is registered.
    pub fn current_min_wts(&self) -> Option<Timestamp> {
        self.scan(|slot| &slot.wts)
    }

    /// Minimum read timestamp over owned slots.
    pub fn current_min_rts(&self) -> Option<Timestamp> {
        self.scan(|slot| &slot.rts)
    }

    fn scan(&self, field: impl Fn(&ThreadSlot) -> &AtomicU64) -> Option<Timestamp> {
        self.slots
            .iter()
            .filter(|slot| slot.owned.load(Ordering::Acquire))
            .map(|slot| field(slot).load(Ordering::Acquire))
            .filter(|&raw| raw != 0)
            .min()
            .map(Timestamp::from_raw)
    }

    /// Rescans all slots and raises the cached watermarks.
    pub fn refresh(&self) {
        if !self.is_live() {
            return;
        }
        if let Some(wts) = self.current_min_wts() {
            self.min_wts.fetch_max(wts.raw(), Ordering::AcqRel);
        }
        if let Some(rts) = self.current_min_rts() {
            // MinRts never overtakes MinWts; readers snapshot at MinWts - 1.
            let bound = self.min_wts().prev().raw();
            self.min_rts.fetch_max(rts.raw().min(bound), Ordering::AcqRel);
        }
    }

    /// Cached MinWts.
    #[inline]
    pub fn min_wts(&self) -> Timestamp {
        Timestamp::from_raw(self.min_wts.load(Ordering::Acquire))
    }

    /// Cached MinRts.
    #[inline]
    pub fn min_rts(&self) -> Timestamp {
        Timestamp::from_raw(self.min_rts.load(Ordering::Acquire))
    }

    fn slot(&self, thread_id: usize) -> Result<&ThreadSlot> {
        self.slots
            .get(thread_id)
            .map(|slot| &**slot)
            .ok_or(CicadaError::InvalidThread {
                thread_id,
                threads: self.slots.len(),
            })
    }
}
