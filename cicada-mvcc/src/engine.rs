use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

use crate::arena::VersionArena;
use crate::backoff::{BackoffStrategy, SpinThenYield};
use crate::config::EngineConfig;
use crate::error::{CicadaError, Result};
use crate::executor::TxExecutor;
use crate::index::{DenseIndex, TupleIndex};
use crate::log::LogBuffer;
use crate::timestamp::{LocalTimestampOracle, Timestamp, TimestampOracle};
use crate::tuple::Table;
use crate::version::VersionStatus;
use crate::watermark::TimestampAuthority;

/// Snapshot of one version, for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    pub wts: Timestamp,
    pub rts: Timestamp,
    pub status: VersionStatus,
    /// Stored in the tuple's embedded slot.
    pub inline: bool,
}

/// Shared state of one engine: the table, key resolution, the watermark
/// authority and the serial log.
///
/// Wrap it in an [`Arc`] and hand out one [`TxExecutor`] per worker thread
/// with [`executor`](Self::executor).
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) table: Table,
    pub(crate) index: Box<dyn TupleIndex>,
    pub(crate) authority: TimestampAuthority,
    pub(crate) serial_wal: Mutex<LogBuffer>,
    pub(crate) backoff: Arc<dyn BackoffStrategy>,
}

impl Engine {
    /// Engine with a dense index over `0..config.tuples` and a process
    /// local timestamp oracle.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_oracle(config, Arc::new(LocalTimestampOracle::new()))
    }

    pub fn with_oracle(config: EngineConfig, oracle: Arc<dyn TimestampOracle>) -> Result<Self> {
        let index = Box::new(DenseIndex::new(config.tuples));
        Self::with_parts(config, oracle, index)
    }

    pub fn with_parts(
        config: EngineConfig,
        oracle: Arc<dyn TimestampOracle>,
        index: Box<dyn TupleIndex>,
    ) -> Result<Self> {
        config.validate()?;

        let arena = VersionArena::new(config.arena_segments, config.val_size);
        let table = Table::new(config.tuples, arena);
        let authority = TimestampAuthority::new(config.threads, oracle);
        authority.go_live();

        tracing::debug!(
            threads = config.threads,
            tuples = config.tuples,
            val_size = config.val_size,
            "engine created"
        );

        Ok(Self {
            serial_wal: Mutex::new(LogBuffer::new(
                config.log_buffer_records,
                config.persist_latency,
            )),
            backoff: Arc::new(SpinThenYield::new(config.pending_spin_limit)),
            config,
            table,
            index,
            authority,
        })
    }

    /// Replaces the strategy used while waiting on pending versions.
    pub fn set_backoff(&mut self, strategy: impl BackoffStrategy + 'static) {
        self.backoff = Arc::new(strategy);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn authority(&self) -> &TimestampAuthority {
        &self.authority
    }

    /// Loads the initial value of `key` as a committed version at wts 0.
    ///
    /// Must run before executors touch the key. Each key loads once.
    pub fn load(&self, key: u64, payload: &[u8]) -> Result<()> {
        if payload.len() > self.config.val_size {
            return Err(CicadaError::PayloadTooLarge {
                len: payload.len(),
                max: self.config.val_size,
            });
        }
        let tid = self.index.insert(key).ok_or(CicadaError::NotFound { key })?;
        if self.table.tuple(tid).latest().is_some() {
            return Err(CicadaError::Config(format!("key {key} is already loaded")));
        }
        self.table.load(tid, payload, self.config.inline_version)?;
        Ok(())
    }

    /// Loads every key in `keys` with the same payload.
    pub fn load_all(&self, keys: impl IntoIterator<Item = u64>, payload: &[u8]) -> Result<()> {
        keys.into_iter().try_for_each(|key| self.load(key, payload))
    }

    /// Creates the executor owning watermark slot `thread_id`.
    pub fn executor(self: &Arc<Self>, thread_id: usize) -> Result<TxExecutor> {
        TxExecutor::new(self.clone(), thread_id)
    }

    /// Payload of the newest committed version of `key`.
    pub fn committed_value(&self, key: u64) -> Option<Vec<u8>> {
        let tid = self.index.lookup(key)?;
        let r = self.table.find_visible(tid, Timestamp::MAX)?;
        Some(self.table.version(r).payload().to_vec())
    }

    /// Every version currently linked into the chain of `key`, newest first.
    pub fn version_chain(&self, key: u64) -> Vec<VersionInfo> {
        let Some(tid) = self.index.lookup(key) else {
            return Vec::new();
        };
        self.table
            .chain(tid)
            .map(|(r, v)| VersionInfo {
                wts: v.wts(),
                rts: v.rts(),
                status: v.status(),
                inline: r.is_inline(),
            })
            .collect()
    }

    /// The log shared by all executors in [`WalMode::Serial`](crate::WalMode::Serial).
    pub fn serial_log(&self) -> MutexGuard<'_, LogBuffer> {
        self.serial_wal.lock()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("table", &self.table)
            .field("authority", &self.authority)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::HashIndex;

    fn config() -> EngineConfig {
        EngineConfig {
            threads: 2,
            tuples: 8,
            val_size: 4,
            pre_reserve_version: 16,
            arena_segments: 1,
            ..Default::default()
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cfg = EngineConfig {
            threads: 0,
            ..config()
        };
        assert!(matches!(Engine::new(cfg), Err(CicadaError::Config(_))));
    }

    #[test]
    fn load_installs_committed_version_at_zero() {
        let engine = Engine::new(config()).unwrap();
        engine.load(3, &[1, 2]).unwrap();

        let chain = engine.version_chain(3);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].wts, Timestamp::ZERO);
        assert_eq!(chain[0].status, VersionStatus::Committed);
        assert!(chain[0].inline);
        assert_eq!(engine.committed_value(3), Some(vec![1, 2, 0, 0]));
        assert_eq!(engine.committed_value(4), None);
    }

    #[test]
    fn load_rejects_bad_input() {
        let engine = Engine::new(config()).unwrap();
        assert!(matches!(
            engine.load(0, &[0; 5]),
            Err(CicadaError::PayloadTooLarge { len: 5, max: 4 })
        ));
        assert_eq!(engine.load(8, &[0]), Err(CicadaError::NotFound { key: 8 }));
        engine.load(0, &[0]).unwrap();
        assert!(matches!(engine.load(0, &[0]), Err(CicadaError::Config(_))));
    }

    #[test]
    fn sparse_keys_through_hash_index() {
        let cfg = config();
        let engine = Engine::with_parts(
            cfg.clone(),
            Arc::new(LocalTimestampOracle::new()),
            Box::new(HashIndex::new(cfg.tuples)),
        )
        .unwrap();
        engine.load_all([u64::MAX, 1 << 40, 17], &[9]).unwrap();
        assert_eq!(engine.committed_value(1 << 40), Some(vec![9, 0, 0, 0]));
        assert_eq!(engine.committed_value(18), None);
    }

    #[test]
    fn executor_slots_are_exclusive() {
        let engine = Arc::new(Engine::new(config()).unwrap());
        let first = engine.executor(0).unwrap();
        assert!(matches!(
            engine.executor(0),
            Err(CicadaError::ThreadSlotTaken { thread_id: 0 })
        ));
        assert!(matches!(
            engine.executor(2),
            Err(CicadaError::InvalidThread { thread_id: 2, .. })
        ));
        drop(first);
        assert!(engine.executor(0).is_ok());
    }

    #[test]
    fn failed_reservation_keeps_arena_usable() {
        let engine = Arc::new(
            Engine::new(EngineConfig {
                pre_reserve_version: 3_000,
                ..config()
            })
            .unwrap(),
        );
        let first = engine.executor(0).unwrap();
        assert!(matches!(
            engine.executor(1),
            Err(CicadaError::ArenaExhausted { .. })
        ));
        // The slot was released and the untouched range is still there.
        assert!(matches!(
            engine.executor(1),
            Err(CicadaError::ArenaExhausted { .. })
        ));
        assert_eq!(engine.table().arena().allocated(), 3_000);
        assert!(engine.table().arena().allocate().is_ok());

        drop(first);
        assert!(engine.executor(1).is_ok());
    }
}
