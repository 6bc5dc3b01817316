//! # Cicada MVCC
//!
//! `cicada-mvcc` is an in-memory, optimistic Multi-Version Concurrency Control
//! engine for a single key-value table, following the Cicada protocol.
//!
//! Worker threads run transactions through one [`TxExecutor`] each. Ordering
//! comes from per-transaction timestamps, not locks: every version carries the
//! write timestamp of its creator and the highest read timestamp that observed
//! it, and commit certification compares the two.
//!
//! ## How it works
//!
//! - **Timestamps**: each executor owns a watermark slot in the
//!   [`TimestampAuthority`]. The minimum write timestamp in flight (MinWts)
//!   and the minimum read timestamp (MinRts) bound visibility and reclamation.
//! - **Versions**: every tuple keeps a newest-first chain of versions. One
//!   version per tuple is embedded inline; the rest live in a segmented
//!   [`VersionArena`] and are addressed by stable handles.
//! - **Reads** return the newest committed version at the transaction's
//!   timestamp.
//! - **Writes** are buffered as tentative versions and installed during
//!   validation, after an adaptive precheck that is skipped for tuples with a
//!   run of clean commits.
//! - **Garbage collection** runs inside each executor: versions shadowed by a
//!   committed version older than MinRts go back to the executor's reuse pool
//!   or to the tuple's inline slot.
//! - **Write path**: optional group commit and log emulation model the cost of
//!   durability without reordering commits.
//!
//! ## Example
//!
//! ```rust
//! use cicada_mvcc::{Engine, EngineConfig};
//! use std::sync::Arc;
//!
//! let engine = Engine::new(EngineConfig {
//!     threads: 1,
//!     tuples: 16,
//!     pre_reserve_version: 64,
//!     ..Default::default()
//! })
//! .unwrap();
//! engine.load(1, b"v0").unwrap();
//! let engine = Arc::new(engine);
//!
//! let mut tx = engine.executor(0).unwrap();
//!
//! // 1. Read-modify-write
//! tx.begin().unwrap();
//! assert_eq!(&tx.read(1).unwrap()[..2], b"v0");
//! tx.write(1, b"v1").unwrap();
//! tx.commit().unwrap();
//!
//! // 2. Read it back
//! tx.begin().unwrap();
//! assert_eq!(&tx.read(1).unwrap()[..2], b"v1");
//! tx.commit().unwrap();
//! ```

pub mod arena;
mod backoff;
mod config;
mod engine;
mod error;
mod executor;
mod index;
pub mod log;
mod pool;
mod procedure;
mod stats;
pub mod timestamp;
pub mod tuple;
pub mod version;
mod watermark;

pub use crate::arena::{SEGMENT_VERSIONS, VersionArena};
pub use crate::backoff::{BackoffAction, BackoffStrategy, NoWait, SpinThenYield};
pub use crate::config::{EngineConfig, WalMode};
pub use crate::engine::{Engine, VersionInfo};
pub use crate::error::{CicadaError, ConflictKind, Result};
pub use crate::executor::{TxExecutor, TxStatus};
pub use crate::index::{DenseIndex, HashIndex, TupleIndex};
pub use crate::log::{LogBuffer, LogRecord};
pub use crate::pool::{Provenance, VersionPool};
pub use crate::procedure::{OpKind, Procedure};
pub use crate::stats::ExecutorStats;
pub use crate::timestamp::{LocalTimestampOracle, MockTimestampOracle, Timestamp, TimestampOracle};
pub use crate::tuple::{InlineState, Table, Tuple, Visibility};
pub use crate::version::{TupleId, Version, VersionId, VersionRef, VersionStatus};
pub use crate::watermark::TimestampAuthority;
