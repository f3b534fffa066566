//! Task claiming benchmark
//!
//! Benchmarks the critical path: enqueue -> claim -> ack. This is the core
//! scheduling performance metric for the task queue (C4).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;
use uuid::Uuid;

use gleitzeit_kernel::model::{Priority, Task, TaskSubmission};
use gleitzeit_kernel::persistence::memory::InMemoryBackend;
use gleitzeit_kernel::persistence::PersistenceBackend;
use gleitzeit_kernel::queue::{TaskQueue, TaskQueueConfig};

fn seed_task(id: &str) -> Task {
    Task::from_submission(
        Uuid::nil(),
        TaskSubmission {
            id: id.to_string(),
            method: "llm/generate".into(),
            params: serde_json::json!({}),
            dependencies: vec![],
            priority: None,
            timeout_seconds: None,
            retry: None,
        },
    )
}

/// Single-worker claim throughput at a few batch sizes.
fn bench_claim_single(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("task_claiming/single");
    group.throughput(Throughput::Elements(1));

    for batch_size in [1usize, 5, 10] {
        group.bench_with_input(BenchmarkId::new("batch", batch_size), &batch_size, |b, &batch_size| {
            b.to_async(&rt).iter_custom(|iters| async move {
                let backend = Arc::new(InMemoryBackend::new());
                let queue = TaskQueue::new(backend.clone(), TaskQueueConfig::default());

                let task_count = (iters as usize * batch_size).max(100);
                for i in 0..task_count {
                    let id = format!("task-{i}");
                    backend.put_task(&seed_task(&id)).await.unwrap();
                    queue.enqueue(&id, Priority::Normal).await.unwrap();
                }

                let start = Instant::now();
                let mut claimed_total = 0usize;
                while claimed_total < task_count {
                    match queue.claim_next("worker-1").await.unwrap() {
                        Some(task_id) => {
                            queue.ack(&task_id).await.unwrap();
                            claimed_total += 1;
                        }
                        None => break,
                    }
                }
                start.elapsed()
            });
        });
    }

    group.finish();
}

/// Claim throughput under contention from several concurrent workers.
fn bench_claim_concurrent(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("task_claiming/concurrent");
    group.sample_size(20);

    for workers in [2usize, 4, 8] {
        let task_count = 5000usize;
        group.throughput(Throughput::Elements(task_count as u64));
        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |b, &workers| {
            b.to_async(&rt).iter(|| async move {
                let backend = Arc::new(InMemoryBackend::new());
                let queue = Arc::new(TaskQueue::new(backend.clone(), TaskQueueConfig::default()));

                for i in 0..task_count {
                    let id = format!("task-{i}");
                    backend.put_task(&seed_task(&id)).await.unwrap();
                    queue.enqueue(&id, Priority::Normal).await.unwrap();
                }

                let claimed_total = Arc::new(AtomicU64::new(0));
                let mut handles = Vec::new();
                for worker_id in 0..workers {
                    let queue = queue.clone();
                    let claimed_total = claimed_total.clone();
                    handles.push(tokio::spawn(async move {
                        let worker_name = format!("worker-{worker_id}");
                        loop {
                            if claimed_total.load(Ordering::Relaxed) >= task_count as u64 {
                                break;
                            }
                            match queue.claim_next(&worker_name).await.unwrap() {
                                Some(task_id) => {
                                    queue.ack(&task_id).await.unwrap();
                                    claimed_total.fetch_add(1, Ordering::Relaxed);
                                }
                                None => {
                                    if claimed_total.load(Ordering::Relaxed) >= task_count as u64 {
                                        break;
                                    }
                                    tokio::task::yield_now().await;
                                }
                            }
                        }
                    }));
                }
                for handle in handles {
                    handle.await.unwrap();
                }
            });
        });
    }

    group.finish();
}

/// Enqueue latency in isolation.
fn bench_enqueue(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("task_claiming/enqueue");
    group.throughput(Throughput::Elements(1));

    group.bench_function("single", |b| {
        b.to_async(&rt).iter_custom(|iters| async move {
            let backend = Arc::new(InMemoryBackend::new());
            let queue = TaskQueue::new(backend.clone(), TaskQueueConfig::default());

            let mut ids = Vec::with_capacity(iters as usize);
            for i in 0..iters {
                let id = format!("task-{i}");
                backend.put_task(&seed_task(&id)).await.unwrap();
                ids.push(id);
            }

            let start = Instant::now();
            for id in &ids {
                queue.enqueue(id, Priority::Normal).await.unwrap();
            }
            start.elapsed()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_claim_single, bench_claim_concurrent, bench_enqueue);
criterion_main!(benches);
