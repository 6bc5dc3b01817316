use serde::Serialize;

use crate::error::ConflictKind;

/// Counters one executor increments while running transactions.
///
/// Read them through [`TxExecutor::stats`](crate::TxExecutor::stats) and
/// sum them across threads with [`merge`](Self::merge).
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub commit_counts: u64,
    pub abort_counts: u64,
    /// Aborts by [`ConflictKind`], indexed by declaration order.
    pub conflict_counts: [u64; ConflictKind::ALL.len()],
    pub not_found_counts: u64,
    /// Heap versions taken from the arena.
    pub version_malloc: u64,
    /// Heap versions served from the reuse pool.
    pub version_reuse: u64,
    pub gc_version_counts: u64,
    pub gc_sweeps: u64,
    pub precheck_elided: u64,
    pub inline_promotions: u64,
    pub group_commits: u64,
    pub wal_records: u64,
    pub wal_bytes: u64,
    pub wal_persists: u64,
}

impl ExecutorStats {
    pub fn conflicts(&self, kind: ConflictKind) -> u64 {
        self.conflict_counts[kind.index()]
    }

    pub(crate) fn record_conflict(&mut self, kind: ConflictKind) {
        self.conflict_counts[kind.index()] += 1;
    }

    pub fn merge(&mut self, other: &ExecutorStats) {
        self.commit_counts += other.commit_counts;
        self.abort_counts += other.abort_counts;
        for (mine, theirs) in self.conflict_counts.iter_mut().zip(other.conflict_counts) {
            *mine += theirs;
        }
        self.not_found_counts += other.not_found_counts;
        self.version_malloc += other.version_malloc;
        self.version_reuse += other.version_reuse;
        self.gc_version_counts += other.gc_version_counts;
        self.gc_sweeps += other.gc_sweeps;
        self.precheck_elided += other.precheck_elided;
        self.inline_promotions += other.inline_promotions;
        self.group_commits += other.group_commits;
        self.wal_records += other.wal_records;
        self.wal_bytes += other.wal_bytes;
        self.wal_persists += other.wal_persists;
    }

    /// Fraction of finished attempts that aborted.
    pub fn abort_rate(&self) -> f64 {
        let total = self.commit_counts + self.abort_counts;
        if total == 0 {
            0.0
        } else {
            self.abort_counts as f64 / total as f64
        }
    }
}
