use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bits of a timestamp reserved for the thread id.
pub const THREAD_BITS: u32 = 8;

/// Maximum number of executor threads a timestamp can tell apart.
pub const MAX_THREADS: usize = 1 << THREAD_BITS;

const THREAD_MASK: u64 = (1 << THREAD_BITS) - 1;

/// A transaction timestamp: an epoch in the high bits and the allocating
/// thread id in the low `THREAD_BITS` bits.
///
/// Two threads never produce equal timestamps, and the packed `u64`
/// comparison is the total order used for versions and watermarks.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    #[inline]
    pub fn new(epoch: u64, thread_id: usize) -> Self {
        debug_assert!(thread_id < MAX_THREADS);
        Timestamp((epoch << THREAD_BITS) | (thread_id as u64 & THREAD_MASK))
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Timestamp(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn epoch(self) -> u64 {
        self.0 >> THREAD_BITS
    }

    #[inline]
    pub fn thread_id(self) -> usize {
        (self.0 & THREAD_MASK) as usize
    }

    /// The timestamp immediately below this one, saturating at zero.
    #[inline]
    pub fn prev(self) -> Self {
        Timestamp(self.0.saturating_sub(1))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.epoch(), self.thread_id())
    }
}

/// Source of timestamp epochs.
///
/// Implementations must hand out strictly increasing values to keep
/// watermarks conservative.
pub trait TimestampOracle: Send + Sync {
    fn next_epoch(&self) -> u64;
}

/// Process-local oracle backed by a single fetch-and-add counter.
#[derive(Debug, Default)]
pub struct LocalTimestampOracle {
    counter: AtomicU64,
}

impl LocalTimestampOracle {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    pub fn with_initial(initial: u64) -> Self {
        Self {
            counter: AtomicU64::new(initial),
        }
    }
}

impl TimestampOracle for LocalTimestampOracle {
    fn next_epoch(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Oracle for tests: the next epoch can be forced with [`set`](Self::set).
#[derive(Debug, Default)]
pub struct MockTimestampOracle {
    counter: AtomicU64,
}

impl MockTimestampOracle {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// The next call to `next_epoch` returns `epoch + 1`.
    pub fn set(&self, epoch: u64) {
        self.counter.store(epoch, Ordering::SeqCst);
    }
}

impl TimestampOracle for MockTimestampOracle {
    fn next_epoch(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}
