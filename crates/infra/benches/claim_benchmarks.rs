use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::Utc;
use jobq_core::{NewJob, WorkerId};
use jobq_infra::jobs::JobStore;
use jobq_infra::store::{FileStore, MemoryStore, RecordStore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;

const LEASE: Duration = Duration::from_secs(330);

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

async fn seeded(store: Arc<dyn RecordStore>, depth: usize) -> JobStore {
    let jobs = JobStore::new(store);
    let now = Utc::now();
    for i in 0..depth {
        jobs.enqueue(NewJob::new("true").with_id(format!("bench-{i:05}")), 3, now)
            .await
            .unwrap();
    }
    jobs
}

/// Drain a queue of `depth` jobs with one claimer; only the claims are timed.
fn bench_claim_drain(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_drain");

    for depth in [10usize, 100].iter() {
        group.throughput(Throughput::Elements(*depth as u64));

        group.bench_with_input(BenchmarkId::new("memory", depth), depth, |b, &depth| {
            b.to_async(&rt).iter_custom(|iters| async move {
                let mut total = Duration::ZERO;
                for _ in 0..iters {
                    let jobs = seeded(MemoryStore::arc(), depth).await;
                    let worker = WorkerId::new();
                    let start = Instant::now();
                    while let Some(job) = jobs.claim_next(worker, Utc::now(), LEASE).await.unwrap() {
                        black_box(job);
                    }
                    total += start.elapsed();
                }
                total
            });
        });

        group.bench_with_input(BenchmarkId::new("file", depth), depth, |b, &depth| {
            b.to_async(&rt).iter_custom(|iters| async move {
                let mut total = Duration::ZERO;
                for _ in 0..iters {
                    let dir = tempfile::tempdir().unwrap();
                    let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
                    let jobs = seeded(store, depth).await;
                    let worker = WorkerId::new();
                    let start = Instant::now();
                    while let Some(job) = jobs.claim_next(worker, Utc::now(), LEASE).await.unwrap() {
                        black_box(job);
                    }
                    total += start.elapsed();
                }
                total
            });
        });
    }

    group.finish();
}

/// Several claimers racing over one file store.
fn bench_contended_claims(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("contended_claims");
    group.sample_size(10);
    const DEPTH: usize = 50;
    group.throughput(Throughput::Elements(DEPTH as u64));

    for claimers in [1usize, 4, 8].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(claimers), claimers, |b, &claimers| {
            b.to_async(&rt).iter_custom(|iters| async move {
                let mut total = Duration::ZERO;
                for _ in 0..iters {
                    let dir = tempfile::tempdir().unwrap();
                    let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
                    let jobs = seeded(store, DEPTH).await;

                    let start = Instant::now();
                    let handles: Vec<_> = (0..claimers)
                        .map(|_| {
                            let jobs = jobs.clone();
                            tokio::spawn(async move {
                                let worker = WorkerId::new();
                                let mut claimed = 0usize;
                                while jobs.claim_next(worker, Utc::now(), LEASE).await.unwrap().is_some() {
                                    claimed += 1;
                                }
                                claimed
                            })
                        })
                        .collect();
                    let mut claimed = 0;
                    for handle in handles {
                        claimed += handle.await.unwrap();
                    }
                    total += start.elapsed();
                    assert_eq!(claimed, DEPTH);
                }
                total
            });
        });
    }

    group.finish();
}

fn bench_enqueue(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("enqueue");
    group.throughput(Throughput::Elements(1));

    group.bench_function("memory", |b| {
        let jobs = JobStore::new(MemoryStore::arc());
        b.to_async(&rt).iter(|| {
            let jobs = jobs.clone();
            async move {
                black_box(jobs.enqueue(NewJob::new("true"), 3, Utc::now()).await.unwrap());
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_claim_drain,
    bench_contended_claims,
    bench_enqueue
);
criterion_main!(benches);
