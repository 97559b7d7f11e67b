//! Registry hot-path benchmarks.
//!
//! Measures both sides of the registry:
//! - register_task into empty and deep queues
//! - a full register/poll/run turn, unmerged and merged
//! - observer notification fanout

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::time::{Duration, Instant};

use loopq::{FlushType, TaskQueueRegistry};

fn bench_register(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry/register");

    group.bench_function("into_empty_queue", |b| {
        let registry = TaskQueueRegistry::new();
        let queue = registry.create_task_queue();
        let mut out = Vec::new();
        b.iter(|| {
            registry.register_task(queue, Box::new(|| {}), Instant::now());
            // Drain so the heap does not grow across iterations.
            registry.poll_expired_tasks(queue, FlushType::All, &mut out);
            out.clear();
        });
    });

    group.bench_function("into_deep_queue", |b| {
        let registry = TaskQueueRegistry::new();
        let queue = registry.create_task_queue();
        let parked = Instant::now() + Duration::from_secs(3600);
        for _ in 0..10_000 {
            registry.register_task(queue, Box::new(|| {}), parked);
        }
        b.iter(|| {
            registry.register_task(queue, Box::new(|| {}), black_box(parked));
        });
    });

    group.finish();
}

fn bench_poll(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry/poll");

    group.bench_function("empty_queue", |b| {
        let registry = TaskQueueRegistry::new();
        let queue = registry.create_task_queue();
        let mut out = Vec::new();
        b.iter(|| {
            registry.poll_expired_tasks(queue, FlushType::All, &mut out);
            black_box(out.len());
        });
    });

    group.bench_function("turn_of_100_tasks", |b| {
        let registry = TaskQueueRegistry::new();
        let queue = registry.create_task_queue();
        let mut out = Vec::with_capacity(100);
        b.iter(|| {
            let now = Instant::now();
            for _ in 0..100 {
                registry.register_task(queue, Box::new(|| {}), now);
            }
            registry.poll_expired_tasks(queue, FlushType::All, &mut out);
            for task in out.drain(..) {
                task();
            }
        });
    });

    group.bench_function("merged_turn_of_100_tasks", |b| {
        let registry = TaskQueueRegistry::new();
        let owner = registry.create_task_queue();
        let subsumed = registry.create_task_queue();
        assert!(registry.merge(owner, subsumed));
        let mut out = Vec::with_capacity(100);
        b.iter(|| {
            let now = Instant::now();
            for i in 0..100u32 {
                let target = if i % 2 == 0 { owner } else { subsumed };
                registry.register_task(target, Box::new(|| {}), now);
            }
            registry.poll_expired_tasks(owner, FlushType::All, &mut out);
            for task in out.drain(..) {
                task();
            }
        });
    });

    group.finish();
}

fn bench_notify(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry/notify");

    for observers in [1usize, 16] {
        group.bench_function(format!("{observers}_observers"), |b| {
            let registry = TaskQueueRegistry::new();
            let queue = registry.create_task_queue();
            for key in 0..observers {
                registry.add_task_observer(queue, key, Arc::new(|| {}));
            }
            b.iter(|| registry.notify_observers(queue));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_register, bench_poll, bench_notify);
criterion_main!(benches);
