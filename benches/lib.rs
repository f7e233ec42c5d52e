//! # taskweave 性能基准测试
//!
//! 使用 Criterion.rs 进行性能基准测试。
//!
//! ## 基准测试分组
//! - `queue`: 优先级队列入队/出队
//! - `scheduler`: 调度往返、挂起/恢复
//! - `locks`: 有序策略与退避策略的多资源获取
//!
//! ## 使用方法
//! ```bash
//! cargo bench            # 运行所有
//! cargo bench scheduler  # 只运行调度基准
//! ```

use std::hint::black_box;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use taskweave::runtime::lock::BackoffPolicy;
use taskweave::runtime::scheduler::{TaskPriority, WorkItem, WorkQueue};
use taskweave::runtime::NullSink;
use taskweave::{LockManager, LockStrategy, Promise, Scheduler, Step};

// ============================================================================
// Queue - 队列基准
// ============================================================================

fn bench_queue(c: &mut Criterion) {
    let priorities = [
        TaskPriority::Low,
        TaskPriority::Normal,
        TaskPriority::High,
        TaskPriority::Critical,
    ];
    c.bench_function("queue/enqueue_dequeue_1k", |b| {
        let queue = WorkQueue::new();
        b.iter(|| {
            for i in 0..1000 {
                queue
                    .enqueue(WorkItem::new(priorities[i % 4], || {}))
                    .unwrap();
            }
            while let Some(item) = queue.try_dequeue() {
                black_box(item.id());
            }
        })
    });
}

// ============================================================================
// Scheduler - 调度基准
// ============================================================================

fn bench_scheduler(c: &mut Criterion) {
    let scheduler = Scheduler::builder()
        .workers(2, 4)
        .diagnostics(std::sync::Arc::new(NullSink))
        .build()
        .unwrap();

    c.bench_function("scheduler/round_trip", |b| {
        b.iter(|| scheduler.schedule(|| black_box(21) * 2).unwrap().wait().unwrap())
    });

    c.bench_function("scheduler/suspend_resume", |b| {
        b.iter(|| {
            let promise = Promise::<u64>::new();
            let awaited = promise.future();
            let task = scheduler
                .schedule_with(TaskPriority::Normal, move |cx| {
                    cx.await_on(&awaited, |v, _| Step::from(v))
                })
                .unwrap();
            promise.complete(1);
            task.wait().unwrap()
        })
    });

    let mut group = c.benchmark_group("scheduler/fan_out");
    for width in [8usize, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, &width| {
            b.iter(|| {
                let parts = (0..width as u64)
                    .map(|i| scheduler.schedule(move || i).unwrap())
                    .collect();
                scheduler.when_all(parts).unwrap().wait().unwrap()
            })
        });
    }
    group.finish();
}

// ============================================================================
// Locks - 锁管理器基准
// ============================================================================

fn bench_locks(c: &mut Criterion) {
    let strategies = [
        ("ordered", LockStrategy::Ordered),
        (
            "backoff",
            LockStrategy::Backoff(BackoffPolicy {
                per_resource_timeout: Duration::from_millis(1),
                ..BackoffPolicy::default()
            }),
        ),
    ];

    let mut group = c.benchmark_group("locks/acquire_release");
    for (name, strategy) in strategies {
        let manager = LockManager::<u32>::new(strategy);
        for key in 0..16 {
            manager.register(key).unwrap();
        }
        group.bench_function(name, |b| {
            b.iter(|| {
                let handle = manager.acquire_all(black_box(&[7u32, 3, 11, 1][..])).unwrap();
                black_box(handle.requester())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_queue, bench_scheduler, bench_locks);
criterion_main!(benches);
