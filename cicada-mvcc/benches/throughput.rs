//! Throughput benchmarks for the transaction executor

use cicada_mvcc::{Engine, EngineConfig, Procedure};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand::Rng;
use std::sync::{Arc, Barrier};
use std::thread;

const KEYS: u64 = 10_000;
const OPS: usize = 10;

fn engine(threads: usize) -> Arc<Engine> {
    let engine = Engine::new(EngineConfig {
        threads,
        tuples: KEYS as usize,
        val_size: 8,
        pre_reserve_version: 4_096,
        ..Default::default()
    })
    .unwrap();
    engine.load_all(0..KEYS, &[0; 8]).unwrap();
    Arc::new(engine)
}

fn workload(rng: &mut impl Rng, read_ratio: u32) -> Vec<Procedure> {
    (0..OPS)
        .map(|_| {
            let key = rng.random_range(0..KEYS);
            if rng.random_range(0..100) < read_ratio {
                Procedure::read(key)
            } else {
                Procedure::read_modify_write(key)
            }
        })
        .collect()
}

fn bench_single_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("execute");
    group.throughput(Throughput::Elements(1));

    for read_ratio in [50, 95, 100] {
        let engine = engine(1);
        let mut tx = engine.executor(0).unwrap();
        let mut rng = rand::rng();
        group.bench_with_input(
            BenchmarkId::new("single_thread", read_ratio),
            &read_ratio,
            |b, &ratio| {
                b.iter(|| {
                    let procedures = workload(&mut rng, ratio);
                    black_box(tx.execute(&procedures, &[1; 8]).ok());
                });
            },
        );
    }

    group.finish();
}

fn bench_concurrent(c: &mut Criterion) {
    let mut group = c.benchmark_group("execute_concurrent");
    let per_thread = 1_000;

    for threads in [2, 4, 8] {
        group.throughput(Throughput::Elements((per_thread * threads) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &num_threads| {
                let engine = engine(num_threads);
                b.iter(|| {
                    let barrier = Arc::new(Barrier::new(num_threads));
                    let handles: Vec<_> = (0..num_threads)
                        .map(|thread_id| {
                            let engine = engine.clone();
                            let barrier = barrier.clone();
                            thread::spawn(move || {
                                let mut tx = engine.executor(thread_id).unwrap();
                                let mut rng = rand::rng();
                                barrier.wait();
                                for _ in 0..per_thread {
                                    let procedures = workload(&mut rng, 95);
                                    black_box(tx.execute(&procedures, &[1; 8]).ok());
                                }
                            })
                        })
                        .collect();

                    for handle in handles {
                        handle.join().unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_single_thread, bench_concurrent);
criterion_main!(benches);
