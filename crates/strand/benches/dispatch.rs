//! Dispatch throughput benchmarks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use strand::{Scheduler, TaskMode};

const TASKS: usize = 10_000;

/// Re-dispatches itself from inside the worker until the shared counter
/// reaches [`TASKS`], exercising the local head-insert path.
fn chain(scheduler: &Arc<Scheduler>, done: &Arc<AtomicUsize>) {
    if done.fetch_add(1, Ordering::Relaxed) + 1 < TASKS {
        let scheduler_next = scheduler.clone();
        let done_next = done.clone();
        scheduler.dispatch(TaskMode::NonBlocking, move || {
            chain(&scheduler_next, &done_next);
        });
    }
}

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Elements(TASKS as u64));

    group.bench_function("external_nonblocking", |b| {
        let scheduler = Scheduler::new(num_cpus::get().max(2), 64).unwrap();
        b.iter(|| {
            let done = Arc::new(AtomicUsize::new(0));
            for _ in 0..TASKS {
                let done = done.clone();
                scheduler.dispatch(TaskMode::NonBlocking, move || {
                    done.fetch_add(1, Ordering::Relaxed);
                });
            }
            while done.load(Ordering::Relaxed) < TASKS {
                std::hint::spin_loop();
            }
        });
        scheduler.shutdown();
    });

    group.bench_function("worker_local_chains", |b| {
        let scheduler = Arc::new(Scheduler::new(num_cpus::get().max(2), 64).unwrap());
        b.iter(|| {
            let done = Arc::new(AtomicUsize::new(0));
            for _ in 0..scheduler.core_pool_size() {
                let scheduler_seed = scheduler.clone();
                let done_seed = done.clone();
                scheduler.dispatch(TaskMode::NonBlocking, move || {
                    chain(&scheduler_seed, &done_seed);
                });
            }
            while done.load(Ordering::Relaxed) < TASKS {
                std::hint::spin_loop();
            }
        });
        scheduler.shutdown();
    });

    group.finish();
}

criterion_group!(benches, bench_dispatch);
criterion_main!(benches);
