#![cfg(feature = "metrics")]

use jobthief::Scheduler;

const CHILDREN: u64 = 10;

#[test]
fn test_counters_follow_single_worker_run() {
    let scheduler = Scheduler::with_workers(1).expect("scheduler");

    scheduler
        .run(|worker, job| {
            for _ in 0..CHILDREN {
                let child = worker.create_child_job_with(job.handle(), |_, _| {});
                worker.submit(child, false);
            }
        })
        .expect("run");

    let m = scheduler.metrics();
    assert_eq!(m.jobs_created, CHILDREN + 1);
    assert_eq!(m.jobs_executed, CHILDREN + 1);
    assert_eq!(m.local_pushes, CHILDREN + 1);
    assert_eq!(m.local_pops, CHILDREN + 1);
    // One worker has nobody to steal from.
    assert_eq!(m.steals_success + m.steals_empty + m.steals_retry, 0);
    assert_eq!(m.job_panics, 0);
    scheduler.shutdown().expect("Shutdown failed");
}

#[test]
fn test_panicking_job_is_counted() {
    let scheduler = Scheduler::with_workers(1).expect("scheduler");

    scheduler
        .run(|worker, job| {
            let boom = worker.create_child_job_with(job.handle(), |_, _| panic!("Boom"));
            worker.submit(boom, false);
        })
        .expect("run");

    let m = scheduler.metrics();
    assert_eq!(m.job_panics, 1);
    // A panicked job still counts as executed.
    assert_eq!(m.jobs_executed, 2);
    scheduler.shutdown().expect("Shutdown failed");
}

#[test]
fn test_every_executed_job_was_popped_or_stolen() {
    let scheduler = Scheduler::with_workers(4).expect("scheduler");

    scheduler
        .run(|worker, job| {
            for _ in 0..64 {
                let child = worker.create_child_job_with(job.handle(), |worker, job| {
                    for _ in 0..64 {
                        let leaf = worker.create_child_job_with(job.handle(), |_, _| {});
                        worker.submit(leaf, false);
                    }
                });
                worker.submit(child, false);
            }
        })
        .expect("run");

    let expected = 1 + 64 + 64 * 64;
    let m = scheduler.metrics();
    assert_eq!(m.jobs_created, expected);
    assert_eq!(m.local_pushes, expected);
    assert_eq!(m.jobs_executed, expected);
    assert_eq!(m.local_pops + m.steals_success, expected);
    assert!(m.steal_ratio() <= 1.0);
    scheduler.shutdown().expect("Shutdown failed");
}
