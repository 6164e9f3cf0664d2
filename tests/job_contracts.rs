use jobthief::{Job, PAYLOAD_CAPACITY, Scheduler, SchedulerError, Worker};
use std::sync::Mutex;

static SEEN: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());

fn record_payload(_: &Worker<'_>, job: &Job<'_>) {
    SEEN.lock().expect("seen lock").push(job.payload().to_vec());
}

fn noop(_: &Worker<'_>, _: &Job<'_>) {}

#[test]
fn test_payload_is_copied_at_creation() {
    let scheduler = Scheduler::with_workers(1).expect("scheduler");
    let worker = scheduler.main_worker().expect("lease");

    let args = vec![7u8; PAYLOAD_CAPACITY];
    let job = worker.create_job(record_payload, &args);
    // The caller's buffer may go away right after creation.
    drop(args);

    worker.submit(job, true);
    worker.wait(job);

    let seen = SEEN.lock().expect("seen lock");
    assert!(seen.contains(&vec![7u8; PAYLOAD_CAPACITY]));
}

#[test]
fn test_payload_over_capacity_is_rejected() {
    let scheduler = Scheduler::with_workers(1).expect("scheduler");
    let worker = scheduler.main_worker().expect("lease");

    let result = worker.try_create_job(None, noop, &[0u8; PAYLOAD_CAPACITY + 1]);
    assert!(matches!(
        result,
        Err(SchedulerError::PayloadTooLarge { len, capacity })
            if len == PAYLOAD_CAPACITY + 1 && capacity == PAYLOAD_CAPACITY
    ));
}

#[test]
#[should_panic(expected = "exceeds")]
fn test_create_job_panics_on_oversized_payload() {
    let scheduler = Scheduler::with_workers(1).expect("scheduler");
    let worker = scheduler.main_worker().expect("lease");
    worker.create_job(noop, &[0u8; 64]);
}

#[test]
fn test_closure_capture_limit() {
    let scheduler = Scheduler::with_workers(1).expect("scheduler");
    let worker = scheduler.main_worker().expect("lease");

    let fits = [1u64; 4];
    let job = worker
        .try_create_job_with(None, move |_, _| {
            assert_eq!(fits.iter().sum::<u64>(), 4);
        })
        .expect("32 bytes of captures fit");
    worker.submit(job, true);
    worker.wait(job);

    let too_big = [1u64; 5];
    let result = worker.try_create_job_with(None, move |_, _| {
        std::hint::black_box(too_big);
    });
    assert!(matches!(result, Err(SchedulerError::PayloadTooLarge { .. })));
}

#[test]
#[should_panic(expected = "detached")]
fn test_wait_on_detached_job_panics() {
    let scheduler = Scheduler::with_workers(1).expect("scheduler");
    let worker = scheduler.main_worker().expect("lease");
    let job = worker.create_job(noop, &[]);
    worker.submit(job, false);
    worker.wait(job);
}

#[test]
#[should_panic(expected = "never submitted")]
fn test_wait_on_unsubmitted_job_panics() {
    let scheduler = Scheduler::with_workers(1).expect("scheduler");
    let worker = scheduler.main_worker().expect("lease");
    let job = worker.create_job(noop, &[]);
    worker.wait(job);
}

#[test]
#[should_panic(expected = "stale job handle")]
fn test_second_wait_on_same_handle_panics() {
    let scheduler = Scheduler::with_workers(1).expect("scheduler");
    let worker = scheduler.main_worker().expect("lease");
    let job = worker.create_job(noop, &[]);
    worker.submit(job, true);
    worker.wait(job);
    worker.wait(job);
}

#[test]
#[should_panic(expected = "stale job handle")]
fn test_stale_handle_cannot_submit_reused_slot() {
    let scheduler = Scheduler::with_workers(1).expect("scheduler");
    let worker = scheduler.main_worker().expect("lease");
    let old = worker.create_job(noop, &[]);
    worker.submit(old, true);
    worker.wait(old);

    let fresh = worker.create_job(noop, &[]);
    assert_eq!(fresh.slot(), old.slot());
    // `old` must not queue the unrelated job now living in its slot.
    worker.submit(old, true);
}

#[test]
#[should_panic(expected = "stale job handle")]
fn test_stale_parent_is_rejected() {
    let scheduler = Scheduler::with_workers(1).expect("scheduler");
    let worker = scheduler.main_worker().expect("lease");
    let parent = worker.create_job(noop, &[]);
    worker.submit(parent, true);
    worker.wait(parent);
    worker.create_child_job(parent, noop, &[]);
}

#[test]
#[should_panic(expected = "submitted exactly once")]
fn test_double_submit_panics() {
    let scheduler = Scheduler::with_workers(1).expect("scheduler");
    let worker = scheduler.main_worker().expect("lease");
    let job = worker.create_job(noop, &[]);
    worker.submit(job, true);
    worker.submit(job, true);
}

#[test]
#[should_panic(expected = "overflow")]
fn test_deque_overflow_panics() {
    let config = jobthief::SchedulerConfig {
        deque_capacity: 4,
        ..jobthief::SchedulerConfig::default().with_workers(1)
    };
    let scheduler = Scheduler::new(config).expect("scheduler");
    let worker = scheduler.main_worker().expect("lease");
    for _ in 0..5 {
        let job = worker.create_job(noop, &[]);
        worker.submit(job, false);
    }
}

#[test]
fn test_child_sees_parent_handle() {
    let scheduler = Scheduler::with_workers(2).expect("scheduler");
    let matched: &'static std::sync::atomic::AtomicBool =
        Box::leak(Box::new(std::sync::atomic::AtomicBool::new(false)));

    scheduler
        .run(move |worker, job| {
            let parent = job.handle();
            let child = worker.create_child_job_with(parent, move |_, child| {
                matched.store(child.parent() == Some(parent), std::sync::atomic::Ordering::SeqCst);
            });
            worker.submit(child, false);
        })
        .expect("run");

    assert!(matched.load(std::sync::atomic::Ordering::SeqCst));
}
