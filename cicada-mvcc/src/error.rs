use std::time::Duration;
use thiserror::Error;

use crate::executor::TxStatus;

/// Which certification step rejected a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictKind {
    /// Precheck saw a visible version already read by a later transaction.
    Precheck,
    /// A read-modify-write met a newer pending or committed version while splicing.
    WriteWrite,
    /// A read set entry is no longer the visible version at commit time.
    ReadValidation,
    /// The version below an installed write was read by a later transaction.
    WriteValidation,
    /// A pending version did not resolve within the spin limit.
    PendingVersion,
}

impl ConflictKind {
    pub const ALL: [ConflictKind; 5] = [
        ConflictKind::Precheck,
        ConflictKind::WriteWrite,
        ConflictKind::ReadValidation,
        ConflictKind::WriteValidation,
        ConflictKind::PendingVersion,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Typed errors for engine operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CicadaError {
    /// Serialization conflict. The attempt is aborted and may be retried
    /// with a fresh timestamp.
    #[error("serialization conflict: {0:?}")]
    Conflict(ConflictKind),

    /// No visible version exists for the key.
    #[error("record not found for key {key}")]
    NotFound { key: u64 },

    /// The version arena ran out of slots.
    #[error("version arena exhausted ({capacity} versions)")]
    ArenaExhausted { capacity: usize },

    #[error("payload of {len} bytes exceeds value size {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("thread id {thread_id} out of range (engine has {threads} threads)")]
    InvalidThread { thread_id: usize, threads: usize },

    #[error("thread slot {thread_id} is already owned by a live executor")]
    ThreadSlotTaken { thread_id: usize },

    /// The global write watermark was never published.
    #[error("watermark not live after waiting {waited:?}")]
    WatermarkNotLive { waited: Duration },

    /// An operation was issued in the wrong transaction state.
    #[error("invalid transaction state: expected {expected:?}, found {found:?}")]
    InvalidState { expected: TxStatus, found: TxStatus },

    /// A write was issued inside a read-only transaction.
    #[error("write to key {key} inside a read-only transaction")]
    ReadOnlyWrite { key: u64 },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CicadaError {
    /// True for outcomes a driver should answer by starting a new attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CicadaError::Conflict(_))
    }
}

pub type Result<T> = std::result::Result<T, CicadaError>;
