//! Write-path emulation: group commit batches and a spinning log buffer.
//!
//! Nothing here is durable. The log only models the cost of persisting
//! committed writes, and the batch only delays the pending to committed
//! flip. Neither reorders commits of one executor.

use std::time::{Duration, Instant};

use crate::timestamp::Timestamp;
use crate::version::{TupleId, VersionRef};

/// One committed write parked in an open batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingWrite {
    pub(crate) key: u64,
    pub(crate) tuple: TupleId,
    pub(crate) version: VersionRef,
    pub(crate) wts: Timestamp,
}

/// Transactions that passed validation but whose versions are still pending.
#[derive(Debug)]
pub(crate) struct GroupCommit {
    batch_size: usize,
    timeout: Duration,
    opened: Option<Instant>,
    transactions: usize,
    writes: Vec<PendingWrite>,
}

impl GroupCommit {
    pub(crate) fn new(batch_size: usize, timeout: Duration) -> Self {
        Self {
            batch_size,
            timeout,
            opened: None,
            transactions: 0,
            writes: Vec::new(),
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.batch_size > 0
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.transactions == 0
    }

    /// Parks the writes of one validated transaction.
    pub(crate) fn precommit_pending(&mut self, writes: impl IntoIterator<Item = PendingWrite>) {
        if self.opened.is_none() {
            self.opened = Some(Instant::now());
        }
        self.writes.extend(writes);
        self.transactions += 1;
    }

    pub(crate) fn is_full(&self) -> bool {
        self.transactions >= self.batch_size
    }

    /// Full, or open for longer than the timeout.
    pub(crate) fn is_due(&self) -> bool {
        match self.opened {
            Some(opened) => self.is_full() || opened.elapsed() >= self.timeout,
            None => false,
        }
    }

    /// wts of the first parked write; later ones are larger.
    pub(crate) fn oldest(&self) -> Option<Timestamp> {
        self.writes.first().map(|w| w.wts)
    }

    pub(crate) fn take(&mut self) -> Vec<PendingWrite> {
        self.opened = None;
        self.transactions = 0;
        std::mem::take(&mut self.writes)
    }

    pub(crate) fn len(&self) -> usize {
        self.transactions
    }
}

/// A log record: which key, at which timestamp, how many payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRecord {
    pub key: u64,
    pub wts: Timestamp,
    pub len: u32,
}

impl LogRecord {
    const HEADER_LEN: u64 = 16;

    pub fn encoded_len(&self) -> u64 {
        Self::HEADER_LEN + u64::from(self.len)
    }
}

/// Buffered log with an emulated persist.
#[derive(Debug)]
pub struct LogBuffer {
    records: Vec<LogRecord>,
    capacity: usize,
    persist_latency: Duration,
    persisted_records: u64,
    persists: u64,
    max_persisted: Timestamp,
}

impl LogBuffer {
    pub fn new(capacity: usize, persist_latency: Duration) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            capacity,
            persist_latency,
            persisted_records: 0,
            persists: 0,
            max_persisted: Timestamp::ZERO,
        }
    }

    /// Buffers `record`, persisting first when the buffer is full.
    /// Returns true if a persist happened.
    pub fn append(&mut self, record: LogRecord) -> bool {
        let flushed = self.records.len() >= self.capacity && self.persist() > 0;
        self.records.push(record);
        flushed
    }

    /// Spins for the configured latency and drops the buffered records.
    /// Returns the number of records persisted.
    pub fn persist(&mut self) -> usize {
        if self.records.is_empty() {
            return 0;
        }
        let start = Instant::now();
        while start.elapsed() < self.persist_latency {
            std::hint::spin_loop();
        }
        let n = self.records.len();
        if let Some(max) = self.records.iter().map(|r| r.wts).max() {
            self.max_persisted = self.max_persisted.max(max);
        }
        self.records.clear();
        self.persisted_records += n as u64;
        self.persists += 1;
        tracing::debug!(records = n, "log persisted");
        n
    }

    /// Records buffered and not yet persisted.
    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    pub fn persisted_records(&self) -> u64 {
        self.persisted_records
    }

    pub fn persists(&self) -> u64 {
        self.persists
    }

    /// Largest wts any persisted record carried.
    pub fn max_persisted(&self) -> Timestamp {
        self.max_persisted
    }
}
