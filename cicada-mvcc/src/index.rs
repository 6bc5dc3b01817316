use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::version::TupleId;

/// Key resolution: maps an application key to a tuple slot.
///
/// The engine never owns this mapping; it only consults it.
pub trait TupleIndex: Send + Sync {
    fn lookup(&self, key: u64) -> Option<TupleId>;

    /// Resolves `key` for loading, assigning a slot if the index can.
    fn insert(&self, key: u64) -> Option<TupleId> {
        self.lookup(key)
    }
}

/// Identity mapping over `0..tuples`.
#[derive(Debug, Clone, Copy)]
pub struct DenseIndex {
    tuples: usize,
}

impl DenseIndex {
    pub fn new(tuples: usize) -> Self {
        Self { tuples }
    }
}

impl TupleIndex for DenseIndex {
    #[inline]
    fn lookup(&self, key: u64) -> Option<TupleId> {
        let tid = usize::try_from(key).ok()?;
        (tid < self.tuples).then_some(tid)
    }
}

/// Sparse keys, slots assigned in insertion order.
#[derive(Debug)]
pub struct HashIndex {
    slots: DashMap<u64, TupleId>,
    next: AtomicUsize,
    tuples: usize,
}

impl HashIndex {
    pub fn new(tuples: usize) -> Self {
        Self {
            slots: DashMap::with_capacity(tuples),
            next: AtomicUsize::new(0),
            tuples,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl TupleIndex for HashIndex {
    fn lookup(&self, key: u64) -> Option<TupleId> {
        self.slots.get(&key).map(|slot| *slot)
    }

    fn insert(&self, key: u64) -> Option<TupleId> {
        if let Some(tid) = self.lookup(key) {
            return Some(tid);
        }
        let entry = self.slots.entry(key).or_insert_with(|| {
            self.next.fetch_add(1, Ordering::Relaxed)
        });
        let tid = *entry;
        drop(entry);
        if tid < self.tuples {
            Some(tid)
        } else {
            self.slots.remove(&key);
            None
        }
    }
}
