use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{CicadaError, Result};
use crate::timestamp::MAX_THREADS;

/// Where committed writes are recorded by the log emulation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalMode {
    /// No log emulation.
    #[default]
    Off,
    /// Every executor owns its log buffer.
    Parallel,
    /// All executors append to one buffer behind a mutex.
    Serial,
}

/// Engine configuration, fixed for the lifetime of an [`Engine`](crate::Engine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of executor threads (watermark slots).
    pub threads: usize,
    /// Number of tuple slots in the table.
    pub tuples: usize,
    /// Expected operations per transaction, used to size read/write sets.
    pub max_ope: usize,
    /// Fixed payload size of every version.
    pub val_size: usize,
    /// Versions handed to each executor's reuse pool at construction.
    pub pre_reserve_version: usize,
    /// Upper bound of arena segments. Each segment holds `SEGMENT_VERSIONS` versions.
    pub arena_segments: usize,
    /// Use the version embedded in each tuple when it is free.
    pub inline_version: bool,
    /// Recycle garbage collected versions through the executor pool
    /// instead of the arena's global free list.
    pub reuse_version: bool,
    /// Skip precheck on tuples with at least this many consecutive commits.
    /// `None` always runs precheck.
    pub precheck_elision: Option<u32>,
    /// Minimum time between maintenance passes of one executor.
    pub gc_interval: Duration,
    /// Transactions per group commit batch. 0 disables group commit.
    pub group_commit: usize,
    /// An open batch older than this is flushed at the next begin or abort.
    pub group_commit_timeout: Duration,
    pub wal: WalMode,
    /// Records buffered before an emulated persist.
    pub log_buffer_records: usize,
    /// Time spent spinning for each emulated persist.
    pub persist_latency: Duration,
    /// Backoff steps a reader waits on a pending version before aborting.
    pub pending_spin_limit: u32,
    /// How long executor construction waits for the watermark to go live.
    pub startup_wait: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            tuples: 1_000,
            max_ope: 10,
            val_size: 4,
            pre_reserve_version: 10_000,
            arena_segments: 4_096,
            inline_version: true,
            reuse_version: true,
            precheck_elision: Some(5),
            gc_interval: Duration::from_micros(10),
            group_commit: 0,
            group_commit_timeout: Duration::from_millis(2),
            wal: WalMode::Off,
            log_buffer_records: 1_024,
            persist_latency: Duration::ZERO,
            pending_spin_limit: 64,
            startup_wait: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 || self.threads > MAX_THREADS {
            return Err(CicadaError::Config(format!(
                "threads must be in 1..={MAX_THREADS}, got {}",
                self.threads
            )));
        }
        if self.val_size == 0 {
            return Err(CicadaError::Config("val_size must be non-zero".into()));
        }
        if self.arena_segments == 0 {
            return Err(CicadaError::Config("arena_segments must be non-zero".into()));
        }
        if self.wal != WalMode::Off && self.log_buffer_records == 0 {
            return Err(CicadaError::Config(
                "log_buffer_records must be non-zero when the WAL is enabled".into(),
            ));
        }
        if self.group_commit > 0 && self.group_commit_timeout.is_zero() {
            tracing::warn!(
                batch = self.group_commit,
                "group commit without timeout flushes only on full batches"
            );
        }
        Ok(())
    }
}
