//! Fan-out throughput benchmark using criterion.
//!
//! Spawns a three-level tree of 128-wide job fans (2,097,152 leaves) from a
//! single root and waits for it. Exercises local LIFO pops, FIFO steals and
//! completion propagation up the tree.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use jobthief::{Job, Scheduler, Worker};
use std::sync::atomic::{AtomicUsize, Ordering};

const SPAWN_AMOUNT: u8 = 128;
const LEAVES: u64 = 128 * 128 * 128;

static LEAF_COUNT: AtomicUsize = AtomicUsize::new(0);

fn leaf_job(_: &Worker<'_>, _: &Job<'_>) {
    LEAF_COUNT.fetch_add(1, Ordering::Relaxed);
}

fn spawn_level(worker: &Worker<'_>, job: &Job<'_>) {
    let remaining = job.payload()[0];
    for _ in 0..SPAWN_AMOUNT {
        let child = if remaining == 0 {
            worker.create_child_job(job.handle(), leaf_job, &[])
        } else {
            worker.create_child_job(job.handle(), spawn_level, &[remaining - 1])
        };
        worker.submit(child, false);
    }
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");
    group.throughput(Throughput::Elements(LEAVES));
    group.sample_size(10); // each iteration runs two million jobs

    let max_workers = num_cpus::get();
    for workers in [1, 2, 4, 8].into_iter().filter(|&n| n <= max_workers) {
        let scheduler = Scheduler::with_workers(workers).expect("scheduler");
        let worker = scheduler.main_worker().expect("lease");

        group.bench_function(BenchmarkId::new("128x128x128", workers), |b| {
            b.iter(|| {
                let root = worker.create_job(spawn_level, &[2]);
                worker.submit(root, true);
                worker.wait(root);
            });
        });

        drop(worker);
        scheduler.shutdown().expect("shutdown");
    }
    group.finish();
}

criterion_group!(benches, bench_fan_out);
criterion_main!(benches);
