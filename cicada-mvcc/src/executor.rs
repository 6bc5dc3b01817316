//! The per-thread transaction executor.
//!
//! An attempt moves `Invalid -> Inflight -> {Commit, Abort}` and the next
//! [`begin`](TxExecutor::begin) starts over. Reads resolve against the
//! version chains at the attempt's timestamp; writes build tentative
//! versions that only become reachable during validation.
//!
//! Validation runs in three steps:
//!
//! 1. **Precheck** - for every written tuple still under contention, the
//!    version the write would be ordered after must not have been read by a
//!    later transaction. Tuples with a long run of clean commits skip it.
//! 2. **Install** - every tentative version is spliced into its chain as
//!    `Pending`, and every read version gets its `rts` raised to our wts.
//! 3. **Check** - each read must still be what our wts sees, and the
//!    version right below each install must not have been read by a later
//!    transaction.
//!
//! On success the installed versions flip to `Committed` (directly, or
//! through a group commit batch) and enter the GC queue. On failure they
//! stay in the chains as `Aborted` tombstones.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use crate::backoff::BackoffAction;
use crate::config::WalMode;
use crate::engine::Engine;
use crate::error::{CicadaError, ConflictKind, Result};
use crate::log::{GroupCommit, LogBuffer, LogRecord, PendingWrite};
use crate::pool::{Provenance, VersionPool};
use crate::procedure::{OpKind, Procedure};
use crate::stats::ExecutorStats;
use crate::timestamp::Timestamp;
use crate::tuple::Visibility;
use crate::version::{TupleId, VersionRef, VersionStatus};

/// Lifecycle of the current attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Invalid,
    Inflight,
    Commit,
    Abort,
}

#[derive(Debug, Clone, Copy)]
struct ReadElement {
    key: u64,
    tuple: TupleId,
    version: VersionRef,
}

#[derive(Debug, Clone, Copy)]
struct WriteElement {
    key: u64,
    tuple: TupleId,
    version: VersionRef,
    rmw: bool,
    installed: bool,
}

/// A committed version whose predecessors become garbage once `wts`
/// falls below MinRts.
#[derive(Debug, Clone, Copy)]
struct GcElement {
    tuple: TupleId,
    version: VersionRef,
    wts: Timestamp,
}

pub struct TxExecutor {
    engine: Arc<Engine>,
    thread_id: usize,
    status: TxStatus,
    read_only: bool,
    wts: Timestamp,
    rts: Timestamp,
    read_set: Vec<ReadElement>,
    write_set: Vec<WriteElement>,
    gc_queue: VecDeque<GcElement>,
    pool: VersionPool,
    batch: GroupCommit,
    wal: Option<LogBuffer>,
    last_maintenance: Instant,
    stats: ExecutorStats,
}

impl TxExecutor {
    pub(crate) fn new(engine: Arc<Engine>, thread_id: usize) -> Result<Self> {
        let authority = &engine.authority;
        authority.claim(thread_id)?;
        if let Err(e) = authority.wait_until_live(engine.config.startup_wait) {
            authority.release(thread_id);
            return Err(e);
        }

        let config = &engine.config;
        let mut pool = VersionPool::new(config.reuse_version);
        if let Err(e) = pool.reserve(engine.table.arena(), config.pre_reserve_version) {
            authority.release(thread_id);
            return Err(e);
        }

        // The read slot has to hold the snapshot bound before the first
        // timestamp makes this slot count towards MinWts.
        let rts = authority.min_wts().prev();
        authority.publish_rts(thread_id, rts);
        let wts = authority.allocate_first(thread_id);

        tracing::debug!(
            thread_id,
            %wts,
            reserved = pool.len(),
            "executor started"
        );

        Ok(Self {
            thread_id,
            status: TxStatus::Invalid,
            read_only: false,
            wts,
            rts,
            read_set: Vec::with_capacity(config.max_ope),
            write_set: Vec::with_capacity(config.max_ope),
            gc_queue: VecDeque::new(),
            pool,
            batch: GroupCommit::new(config.group_commit, config.group_commit_timeout),
            wal: (config.wal == WalMode::Parallel)
                .then(|| LogBuffer::new(config.log_buffer_records, config.persist_latency)),
            last_maintenance: Instant::now(),
            stats: ExecutorStats::default(),
            engine,
        })
    }

    pub fn thread_id(&self) -> usize {
        self.thread_id
    }

    pub fn status(&self) -> TxStatus {
        self.status
    }

    pub fn wts(&self) -> Timestamp {
        self.wts
    }

    pub fn rts(&self) -> Timestamp {
        self.rts
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn read_set_len(&self) -> usize {
        self.read_set.len()
    }

    pub fn write_set_len(&self) -> usize {
        self.write_set.len()
    }

    pub fn gc_queue_len(&self) -> usize {
        self.gc_queue.len()
    }

    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    /// Transactions parked in the open group commit batch.
    pub fn batched(&self) -> usize {
        self.batch.len()
    }

    pub fn stats(&self) -> &ExecutorStats {
        &self.stats
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// This executor's log in [`WalMode::Parallel`].
    pub fn log(&self) -> Option<&LogBuffer> {
        self.wal.as_ref()
    }

    /// Starts a read-write attempt with a fresh timestamp.
    pub fn begin(&mut self) -> Result<()> {
        self.start(false)
    }

    /// Starts a read-only attempt. It reads the snapshot just below MinWts,
    /// never validates and cannot write.
    pub fn begin_read_only(&mut self) -> Result<()> {
        self.start(true)
    }

    fn start(&mut self, read_only: bool) -> Result<()> {
        if self.status == TxStatus::Inflight {
            return Err(CicadaError::InvalidState {
                expected: TxStatus::Invalid,
                found: TxStatus::Inflight,
            });
        }
        if self.batch.is_due() {
            self.group_commit_pending();
        }

        let authority = &self.engine.authority;
        self.wts = authority.next_timestamp(self.thread_id);
        authority.publish_wts(self.thread_id, self.held_wts());
        if read_only {
            authority.refresh();
        }
        self.rts = authority.min_wts().prev();
        authority.publish_rts(self.thread_id, self.rts);

        self.read_set.clear();
        self.write_set.clear();
        self.read_only = read_only;
        self.status = TxStatus::Inflight;
        Ok(())
    }

    /// Lower bound this slot has to publish: the oldest batched write while
    /// a batch is open, else the current wts.
    fn held_wts(&self) -> Timestamp {
        match self.batch.oldest() {
            Some(oldest) => oldest.min(self.wts),
            None => self.wts,
        }
    }

    fn ensure_inflight(&self) -> Result<()> {
        if self.status == TxStatus::Inflight {
            Ok(())
        } else {
            Err(CicadaError::InvalidState {
                expected: TxStatus::Inflight,
                found: self.status,
            })
        }
    }

    /// Reads `key`. A missing record or an unresolved pending version ends
    /// the attempt through [`early_abort`](Self::early_abort).
    pub fn read(&mut self, key: u64) -> Result<&[u8]> {
        self.ensure_inflight()?;

        let Some(tuple) = self.engine.index.lookup(key) else {
            return Err(self.early_abort(CicadaError::NotFound { key }));
        };

        let cached = self
            .write_set
            .iter()
            .find(|we| we.key == key)
            .map(|we| we.version)
            .or_else(|| {
                self.read_set
                    .iter()
                    .find(|re| re.key == key)
                    .map(|re| re.version)
            });
        if let Some(r) = cached {
            return Ok(self.engine.table.version(r).payload());
        }

        let as_of = if self.read_only { self.rts } else { self.wts };
        let version = match self.resolve(tuple, as_of) {
            Ok(Some(r)) => r,
            Ok(None) => return Err(self.early_abort(CicadaError::NotFound { key })),
            Err(kind) => return Err(self.early_abort(CicadaError::Conflict(kind))),
        };

        if !self.read_only {
            self.read_set.push(ReadElement {
                key,
                tuple,
                version,
            });
            if self.engine.config.inline_version {
                self.promote_inline(key, tuple, version);
            }
        }
        Ok(self.engine.table.version(version).payload())
    }

    /// Buffers a write of `payload` to `key`; writing a key twice keeps one
    /// entry holding the latest payload.
    pub fn write(&mut self, key: u64, payload: &[u8]) -> Result<()> {
        self.ensure_inflight()?;
        if self.read_only {
            return Err(CicadaError::ReadOnlyWrite { key });
        }
        let max = self.engine.config.val_size;
        if payload.len() > max {
            return Err(CicadaError::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }

        if let Some(we) = self.write_set.iter().find(|we| we.key == key) {
            // SAFETY: tentative versions are owned by this write set.
            unsafe { self.engine.table.version(we.version).write_payload(payload) };
            return Ok(());
        }

        let Some(tuple) = self.engine.index.lookup(key) else {
            return Err(self.early_abort(CicadaError::NotFound { key }));
        };
        let rmw = self.read_set.iter().any(|re| re.key == key);
        let version = match self.new_version(tuple) {
            Ok(r) => r,
            Err(e) => return Err(self.early_abort(e)),
        };
        // SAFETY: `new_version` handed out an unreachable version.
        unsafe { self.engine.table.version(version).write_payload(payload) };

        self.write_set.push(WriteElement {
            key,
            tuple,
            version,
            rmw,
            installed: false,
        });
        Ok(())
    }

    /// Tentative version for `tuple`: the inline slot when free, else a
    /// pooled or fresh heap version. Initialized for our wts.
    fn new_version(&mut self, tuple: TupleId) -> Result<VersionRef> {
        let table = &self.engine.table;
        let r = if self.engine.config.inline_version && table.tuple(tuple).try_checkout_inline() {
            VersionRef::Inline(tuple)
        } else {
            let (id, provenance) = self.pool.acquire(table.arena())?;
            match provenance {
                Provenance::Reused => self.stats.version_reuse += 1,
                Provenance::Fresh => self.stats.version_malloc += 1,
            }
            VersionRef::Heap(id)
        };
        // SAFETY: checked out or taken from the pool, so exclusively ours.
        unsafe { table.version(r).set(self.wts) };
        Ok(r)
    }

    /// Rewrites an old heap version into the tuple's free inline slot.
    fn promote_inline(&mut self, key: u64, tuple: TupleId, read: VersionRef) {
        if read.is_inline() {
            return;
        }
        let table = &self.engine.table;
        let source = table.version(read);
        if source.wts() >= self.engine.authority.min_rts() {
            return;
        }
        let slot = table.tuple(tuple);
        if !slot.try_checkout_inline() {
            return;
        }
        let inline = VersionRef::Inline(tuple);
        let target = table.version(inline);
        // SAFETY: the inline slot was just checked out; `source` is
        // reachable and older than MinRts, so nobody recycles it under us.
        unsafe {
            target.set(self.wts);
            target.copy_payload_from(source);
        }
        self.write_set.push(WriteElement {
            key,
            tuple,
            version: inline,
            rmw: false,
            installed: false,
        });
        self.stats.inline_promotions += 1;
        tracing::trace!(thread_id = self.thread_id, key, "inline promotion");
    }

    /// Visible version of `tuple` at `as_of`, waiting on pending candidates.
    fn resolve(
        &mut self,
        tuple: TupleId,
        as_of: Timestamp,
    ) -> std::result::Result<Option<VersionRef>, ConflictKind> {
        let mut attempt = 0;
        loop {
            match self.engine.table.resolve_visible(tuple, as_of) {
                Visibility::Visible(r) => return Ok(Some(r)),
                Visibility::Missing => return Ok(None),
                Visibility::Pending(r) => {
                    let owner = self.engine.table.version(r).wts().thread_id();
                    if owner == self.thread_id && !self.batch.is_empty() {
                        self.group_commit_pending();
                        continue;
                    }
                    match self.engine.backoff.backoff(attempt) {
                        BackoffAction::Retry => {}
                        BackoffAction::Yield => std::thread::yield_now(),
                        BackoffAction::Abort => return Err(ConflictKind::PendingVersion),
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Validates and, on success, makes the writes visible. Returns the
    /// commit timestamp; read-only attempts return their snapshot.
    pub fn commit(&mut self) -> Result<Timestamp> {
        self.ensure_inflight()?;

        if self.read_only {
            self.status = TxStatus::Commit;
            self.stats.commit_counts += 1;
            return Ok(self.rts);
        }

        if let Err(kind) = self.validate() {
            self.abort_with(kind);
            return Err(CicadaError::Conflict(kind));
        }
        self.write_phase();
        self.maintenance();
        Ok(self.wts)
    }

    fn validate(&mut self) -> std::result::Result<(), ConflictKind> {
        if !self.precheck() {
            return Err(ConflictKind::Precheck);
        }

        let wts = self.wts;
        let table = &self.engine.table;
        for we in self.write_set.iter_mut() {
            table.install_tentative(we.tuple, we.version, wts, we.rmw)?;
            we.installed = true;
        }

        for re in &self.read_set {
            table.version(re.version).bump_rts(wts);
        }

        // Our own installs carry exactly `wts`, so `wts.prev()` sees past them.
        let below = wts.prev();
        for i in 0..self.read_set.len() {
            let re = self.read_set[i];
            if self.resolve(re.tuple, below)? != Some(re.version) {
                return Err(ConflictKind::ReadValidation);
            }
        }

        for i in 0..self.write_set.len() {
            let tuple = self.write_set[i].tuple;
            if let Some(r) = self.resolve(tuple, below)? {
                if self.engine.table.version(r).rts() > wts {
                    return Err(ConflictKind::WriteValidation);
                }
            }
        }
        Ok(())
    }

    /// Cheap pass that rejects writes ordered after a version already read
    /// by a later transaction, before anything is installed.
    fn precheck(&mut self) -> bool {
        let wts = self.wts;
        let table = &self.engine.table;
        let threshold = self.engine.config.precheck_elision;

        // Most contended tuples first.
        self.write_set
            .sort_by_key(|we| table.tuple(we.tuple).continuing_commit());

        for we in &self.write_set {
            if threshold.is_some_and(|t| table.tuple(we.tuple).continuing_commit() >= t) {
                self.stats.precheck_elided += 1;
                continue;
            }
            let mut chain = table
                .chain(we.tuple)
                .filter(|(_, v)| v.status() == VersionStatus::Committed);
            let visible = if we.rmw {
                chain.next()
            } else {
                chain.find(|(_, v)| v.wts() <= wts)
            };
            if let Some((_, v)) = visible {
                if v.rts() > wts {
                    return false;
                }
            }
        }
        true
    }

    fn write_phase(&mut self) {
        let table = &self.engine.table;
        for re in &self.read_set {
            table.tuple(re.tuple).record_commit();
        }
        for we in &self.write_set {
            table.tuple(we.tuple).record_commit();
        }

        let wts = self.wts;
        let writes: Vec<PendingWrite> = self
            .write_set
            .iter()
            .map(|we| PendingWrite {
                key: we.key,
                tuple: we.tuple,
                version: we.version,
                wts,
            })
            .collect();

        if self.batch.is_enabled() {
            self.batch.precommit_pending(writes);
            if self.batch.is_full() {
                self.group_commit_pending();
            }
        } else {
            for w in writes {
                self.commit_write(w);
            }
        }

        self.read_set.clear();
        self.write_set.clear();
        self.status = TxStatus::Commit;
        self.stats.commit_counts += 1;
    }

    fn commit_write(&mut self, w: PendingWrite) {
        self.engine
            .table
            .version(w.version)
            .store_status(VersionStatus::Committed);
        self.gc_queue.push_back(GcElement {
            tuple: w.tuple,
            version: w.version,
            wts: w.wts,
        });
        self.wal_append(w.key, w.wts);
    }

    /// Flips every batched version to committed, oldest first, and releases
    /// the watermark the batch was holding.
    pub fn group_commit_pending(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let transactions = self.batch.len();
        let writes = self.batch.take();
        let count = writes.len();
        for w in writes {
            self.commit_write(w);
        }
        self.engine
            .authority
            .publish_wts(self.thread_id, self.held_wts());
        self.stats.group_commits += 1;
        tracing::trace!(
            thread_id = self.thread_id,
            transactions,
            writes = count,
            "group commit"
        );
    }

    fn wal_append(&mut self, key: u64, wts: Timestamp) {
        let record = LogRecord {
            key,
            wts,
            len: self.engine.config.val_size as u32,
        };
        let persisted = match self.engine.config.wal {
            WalMode::Off => return,
            WalMode::Parallel => match self.wal.as_mut() {
                Some(log) => log.append(record),
                None => return,
            },
            WalMode::Serial => self.engine.serial_wal.lock().append(record),
        };
        self.stats.wal_records += 1;
        self.stats.wal_bytes += record.encoded_len();
        if persisted {
            self.stats.wal_persists += 1;
        }
    }

    /// Abandons the attempt. Installed versions become tombstones, the rest
    /// return to the inline slot or the pool.
    pub fn abort(&mut self) -> Result<()> {
        self.ensure_inflight()?;
        self.finish_abort();
        Ok(())
    }

    fn abort_with(&mut self, kind: ConflictKind) {
        self.stats.record_conflict(kind);
        tracing::trace!(thread_id = self.thread_id, wts = %self.wts, ?kind, "abort");
        self.finish_abort();
    }

    fn finish_abort(&mut self) {
        let table = &self.engine.table;
        for re in &self.read_set {
            table.tuple(re.tuple).reset_continuing_commit();
        }
        for we in &self.write_set {
            table.tuple(we.tuple).reset_continuing_commit();
        }
        self.write_set_clean();
        self.read_set.clear();
        self.status = TxStatus::Abort;
        self.stats.abort_counts += 1;
        if self.batch.is_due() {
            self.group_commit_pending();
        }
        self.maintenance();
    }

    /// Ends the attempt before validation. Returns `err` for the caller to
    /// propagate.
    pub fn early_abort(&mut self, err: CicadaError) -> CicadaError {
        match &err {
            CicadaError::NotFound { .. } => self.stats.not_found_counts += 1,
            CicadaError::Conflict(kind) => self.stats.record_conflict(*kind),
            _ => {}
        }
        tracing::trace!(thread_id = self.thread_id, wts = %self.wts, %err, "early abort");
        self.write_set_clean();
        self.read_set.clear();
        self.status = TxStatus::Abort;
        self.stats.abort_counts += 1;
        err
    }

    fn write_set_clean(&mut self) {
        let table = &self.engine.table;
        for we in self.write_set.drain(..) {
            if we.installed {
                table.version(we.version).store_status(VersionStatus::Aborted);
                continue;
            }
            match we.version {
                VersionRef::Inline(tid) => table.tuple(tid).return_inline(),
                VersionRef::Heap(id) => {
                    table.version(we.version).store_status(VersionStatus::Unused);
                    self.pool.release(table.arena(), id);
                }
            }
        }
    }

    /// Refreshes the watermarks and collects garbage, at most once per
    /// `gc_interval`.
    pub fn maintenance(&mut self) {
        if self.last_maintenance.elapsed() < self.engine.config.gc_interval {
            return;
        }
        self.last_maintenance = Instant::now();
        self.engine.authority.refresh();
        self.collect_garbage();
    }

    /// Processes the GC queue front while entries are older than MinRts.
    /// Returns the number of versions reclaimed.
    pub fn collect_garbage(&mut self) -> usize {
        let engine = Arc::clone(&self.engine);
        let min_rts = engine.authority.min_rts();
        let mut reclaimed = 0;

        while let Some(front) = self.gc_queue.front().copied() {
            if front.wts >= min_rts {
                break;
            }
            self.gc_queue.pop_front();

            let tuple = engine.table.tuple(front.tuple);
            if !tuple.try_acquire_gc(self.thread_id) {
                continue;
            }
            if front.wts <= tuple.min_wts() {
                tuple.release_gc(self.thread_id);
                continue;
            }
            reclaimed += self.gc_after_this_version(front.version);
            tuple.raise_min_wts(front.wts);
            tuple.release_gc(self.thread_id);
        }

        if reclaimed > 0 {
            self.stats.gc_sweeps += 1;
            self.stats.gc_version_counts += reclaimed as u64;
            tracing::debug!(thread_id = self.thread_id, reclaimed, %min_rts, "gc sweep");
        }
        reclaimed
    }

    /// Detaches everything below `version` and reclaims it.
    fn gc_after_this_version(&mut self, version: VersionRef) -> usize {
        let table = &self.engine.table;
        let mut cursor = table.version(version).take_next();
        let mut reclaimed = 0;
        while let Some(r) = cursor {
            let v = table.version(r);
            cursor = v.next();
            match r {
                VersionRef::Inline(tid) => table.tuple(tid).return_inline(),
                VersionRef::Heap(id) => {
                    v.store_status(VersionStatus::Unused);
                    self.pool.release(table.arena(), id);
                }
            }
            reclaimed += 1;
        }
        reclaimed
    }

    /// Runs one attempt of `procedures`: read-only when every step is a
    /// plain read, writing `payload` for every write. Retrying is left to
    /// the caller.
    pub fn execute(&mut self, procedures: &[Procedure], payload: &[u8]) -> Result<Timestamp> {
        if Procedure::is_read_only(procedures) {
            self.begin_read_only()?;
        } else {
            self.begin()?;
        }

        for p in procedures {
            let step = match p.kind {
                OpKind::Read => self.read(p.key).map(|_| ()),
                OpKind::Write if p.rmw => {
                    self.read(p.key).map(|_| ()).and_then(|()| self.write(p.key, payload))
                }
                OpKind::Write => self.write(p.key, payload),
            };
            if let Err(e) = step {
                if self.status == TxStatus::Inflight {
                    self.finish_abort();
                }
                return Err(e);
            }
        }
        self.commit()
    }
}

impl Drop for TxExecutor {
    fn drop(&mut self) {
        if self.status == TxStatus::Inflight {
            self.finish_abort();
        }
        self.group_commit_pending();
        if let Some(log) = self.wal.as_mut() {
            if log.persist() > 0 {
                self.stats.wal_persists += 1;
            }
        }
        self.pool.drain_into(self.engine.table.arena());
        self.engine.authority.release(self.thread_id);
        tracing::debug!(
            thread_id = self.thread_id,
            commits = self.stats.commit_counts,
            aborts = self.stats.abort_counts,
            "executor stopped"
        );
    }
}

impl std::fmt::Debug for TxExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxExecutor")
            .field("thread_id", &self.thread_id)
            .field("status", &self.status)
            .field("wts", &self.wts)
            .field("rts", &self.rts)
            .field("read_set", &self.read_set.len())
            .field("write_set", &self.write_set.len())
            .finish()
    }
}
