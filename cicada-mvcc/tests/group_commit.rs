use cicada_mvcc::{
    CicadaError, ConflictKind, Engine, EngineConfig, NoWait, VersionStatus, WalMode,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const VAL_SIZE: usize = 8;

fn config(group_commit: usize) -> EngineConfig {
    EngineConfig {
        threads: 2,
        tuples: 8,
        val_size: VAL_SIZE,
        pre_reserve_version: 32,
        arena_segments: 1,
        group_commit,
        group_commit_timeout: Duration::from_secs(60),
        gc_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

fn build(cfg: EngineConfig) -> Engine {
    let engine = Engine::new(cfg).unwrap();
    engine.load_all(0..8, &[0]).unwrap();
    engine
}

#[test]
fn batch_flips_to_committed_when_full() {
    let engine = Arc::new(build(config(3)));
    let mut tx = engine.executor(0).unwrap();

    for key in 0..2 {
        tx.begin().unwrap();
        tx.write(key, &[9]).unwrap();
        tx.commit().unwrap();
        assert_eq!(engine.version_chain(key)[0].status, VersionStatus::Pending);
    }
    assert_eq!(tx.batched(), 2);
    assert_eq!(tx.stats().commit_counts, 2);
    assert_eq!(engine.committed_value(0).unwrap()[0], 0);

    tx.begin().unwrap();
    tx.write(2, &[9]).unwrap();
    tx.commit().unwrap();

    assert_eq!(tx.batched(), 0);
    assert_eq!(tx.stats().group_commits, 1);
    for key in 0..3 {
        assert_eq!(engine.version_chain(key)[0].status, VersionStatus::Committed);
        assert_eq!(engine.committed_value(key).unwrap()[0], 9);
    }
}

#[test]
fn reading_own_pending_write_flushes_batch() {
    let engine = Arc::new(build(config(4)));
    let mut tx = engine.executor(0).unwrap();

    tx.begin().unwrap();
    tx.write(1, &[5]).unwrap();
    tx.commit().unwrap();
    assert_eq!(tx.batched(), 1);

    tx.begin().unwrap();
    assert_eq!(tx.read(1).unwrap()[0], 5);
    assert_eq!(tx.batched(), 0);
    assert_eq!(tx.stats().group_commits, 1);
    tx.commit().unwrap();
}

#[test]
fn foreign_pending_version_aborts_reader() {
    let mut engine = build(config(4));
    engine.set_backoff(NoWait);
    let engine = Arc::new(engine);
    let mut writer = engine.executor(0).unwrap();
    let mut reader = engine.executor(1).unwrap();

    writer.begin().unwrap();
    writer.write(3, &[1]).unwrap();
    writer.commit().unwrap();

    reader.begin().unwrap();
    assert_eq!(
        reader.read(3),
        Err(CicadaError::Conflict(ConflictKind::PendingVersion))
    );
    assert_eq!(reader.stats().conflicts(ConflictKind::PendingVersion), 1);

    writer.group_commit_pending();
    reader.begin().unwrap();
    assert_eq!(reader.read(3).unwrap()[0], 1);
    reader.commit().unwrap();
}

#[test]
fn open_batch_holds_the_watermark() {
    let engine = Arc::new(build(config(3)));
    let mut tx = engine.executor(0).unwrap();

    tx.begin().unwrap();
    tx.write(0, &[1]).unwrap();
    let first = tx.commit().unwrap();

    tx.begin().unwrap();
    assert!(tx.wts() > first);
    assert_eq!(engine.authority().current_min_wts(), Some(first));
    tx.write(1, &[2]).unwrap();
    tx.commit().unwrap();

    tx.begin().unwrap();
    tx.write(2, &[3]).unwrap();
    tx.commit().unwrap();
    assert_eq!(tx.batched(), 0);

    tx.begin().unwrap();
    assert_eq!(engine.authority().current_min_wts(), Some(tx.wts()));
    tx.abort().unwrap();
}

#[test]
#[cfg_attr(miri, ignore)]
fn stale_batch_is_flushed_on_begin() {
    let engine = Arc::new(build(EngineConfig {
        group_commit_timeout: Duration::from_millis(1),
        ..config(100)
    }));
    let mut tx = engine.executor(0).unwrap();

    tx.begin().unwrap();
    tx.write(4, &[4]).unwrap();
    tx.commit().unwrap();
    assert_eq!(tx.batched(), 1);

    thread::sleep(Duration::from_millis(5));
    tx.begin().unwrap();
    assert_eq!(tx.batched(), 0);
    assert_eq!(engine.version_chain(4)[0].status, VersionStatus::Committed);
}

#[test]
fn dropping_executor_flushes_batch() {
    let engine = Arc::new(build(config(10)));
    let mut tx = engine.executor(0).unwrap();
    tx.begin().unwrap();
    tx.write(6, &[6]).unwrap();
    tx.commit().unwrap();
    drop(tx);
    assert_eq!(engine.committed_value(6).unwrap()[0], 6);
}

#[test]
fn parallel_log_keeps_commit_order() {
    let engine = Arc::new(build(EngineConfig {
        wal: WalMode::Parallel,
        ..config(0)
    }));
    let mut tx = engine.executor(0).unwrap();

    for i in 0..20u64 {
        tx.begin().unwrap();
        tx.write(i % 8, &i.to_le_bytes()).unwrap();
        tx.commit().unwrap();
    }

    let log = tx.log().unwrap();
    assert_eq!(log.records().len(), 20);
    assert!(log.records().windows(2).all(|w| w[0].wts < w[1].wts));
    assert_eq!(tx.stats().wal_records, 20);
    assert_eq!(tx.stats().wal_bytes, 20 * (16 + VAL_SIZE as u64));
    assert_eq!(tx.stats().wal_persists, 0);
}

#[test]
fn full_log_buffer_persists() {
    let engine = Arc::new(build(EngineConfig {
        wal: WalMode::Parallel,
        log_buffer_records: 4,
        ..config(0)
    }));
    let mut tx = engine.executor(0).unwrap();

    for i in 0..10u64 {
        tx.begin().unwrap();
        tx.write(i % 8, &[1]).unwrap();
        tx.commit().unwrap();
    }

    let log = tx.log().unwrap();
    assert_eq!(log.persists(), 2);
    assert_eq!(log.persisted_records(), 8);
    assert_eq!(log.records().len(), 2);
    assert!(log.max_persisted() < tx.wts());
    assert_eq!(tx.stats().wal_persists, 2);
}

#[test]
fn serial_log_is_shared() {
    let engine = Arc::new(build(EngineConfig {
        wal: WalMode::Serial,
        ..config(0)
    }));
    let mut a = engine.executor(0).unwrap();
    let mut b = engine.executor(1).unwrap();
    assert!(a.log().is_none());

    for tx in [&mut a, &mut b] {
        for key in 0..3 {
            tx.begin().unwrap();
            tx.write(key, &[2]).unwrap();
            tx.commit().unwrap();
        }
    }

    let log = engine.serial_log();
    assert_eq!(log.records().len(), 6);
    assert_eq!(a.stats().wal_records + b.stats().wal_records, 6);
}

#[test]
fn batched_writes_are_logged_on_flush() {
    let engine = Arc::new(build(EngineConfig {
        wal: WalMode::Parallel,
        ..config(2)
    }));
    let mut tx = engine.executor(0).unwrap();

    tx.begin().unwrap();
    tx.write(0, &[1]).unwrap();
    tx.write(1, &[1]).unwrap();
    tx.commit().unwrap();
    assert_eq!(tx.log().unwrap().records().len(), 0);

    tx.begin().unwrap();
    tx.write(2, &[1]).unwrap();
    tx.commit().unwrap();
    assert_eq!(tx.log().unwrap().records().len(), 3);
}
