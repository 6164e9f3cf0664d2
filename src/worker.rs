//! Worker context and run loop.
//!
//! A [`Worker`] is the explicit per-thread scheduling context: its id, its
//! deque and arena, and its steal cursor. Every core operation goes through
//! one. Spawned worker threads build theirs at startup; the launching thread
//! leases worker 0 from the [`Scheduler`](crate::Scheduler), and a caller
//! blocked in [`Worker::wait`] keeps executing jobs through the same loop as
//! everybody else.

use crate::config::{IdleStrategy, VictimPolicy};
use crate::error::SchedulerError;
use crate::job::{Job, JobFn, JobNode, JobRef, JobState};
use crate::scheduler::{Registry, WorkerSlot};
use crate::trace::{self, TraceGuard};
use crossbeam::deque::Steal;
use crossbeam::utils::Backoff;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, error, trace};

/// Scheduling context of one thread.
///
/// Not `Send`: a worker's deque may only be pushed and popped by the thread
/// that owns it.
pub struct Worker<'r> {
    id: usize,
    registry: &'r Registry,
    slot: &'r WorkerSlot,
    next_victim: Cell<usize>,
    rng: RefCell<SmallRng>,
    leased: bool,
    _not_send: PhantomData<*const ()>,
}

impl<'r> Worker<'r> {
    pub(crate) fn new(id: usize, registry: &'r Registry, leased: bool) -> Self {
        Worker {
            id,
            registry,
            slot: registry.slot(id),
            next_victim: Cell::new(id),
            rng: RefCell::new(SmallRng::seed_from_u64(0x9e37_79b9_7f4a_7c15 ^ id as u64)),
            leased,
            _not_send: PhantomData,
        }
    }

    /// Index of this worker and its deque in the registry.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Number of workers in the scheduler this worker belongs to.
    pub fn num_workers(&self) -> usize {
        self.registry.num_workers()
    }

    /// Creates a root job whose function receives a copy of `payload`.
    ///
    /// # Panics
    ///
    /// Panics if the payload exceeds [`PAYLOAD_CAPACITY`](crate::PAYLOAD_CAPACITY)
    /// or this worker's arena is full.
    pub fn create_job(&self, function: JobFn, payload: &[u8]) -> JobRef {
        self.try_create_job(None, function, payload)
            .unwrap_or_else(|e| panic!("{e}"))
    }

    /// Creates a job attached to `parent`. The parent will not complete
    /// before this child does.
    ///
    /// # Panics
    ///
    /// Same as [`Worker::create_job`].
    pub fn create_child_job(&self, parent: JobRef, function: JobFn, payload: &[u8]) -> JobRef {
        self.try_create_job(Some(parent), function, payload)
            .unwrap_or_else(|e| panic!("{e}"))
    }

    /// Creates a root job running `closure`, stored inline in the node.
    ///
    /// # Panics
    ///
    /// Panics if the closure's captures do not fit the payload area or this
    /// worker's arena is full.
    pub fn create_job_with<F>(&self, closure: F) -> JobRef
    where
        F: FnOnce(&Worker<'_>, &Job<'_>) + Send + 'static,
    {
        self.try_create_job_with(None, closure)
            .unwrap_or_else(|e| panic!("{e}"))
    }

    /// Creates a child of `parent` running `closure`.
    ///
    /// # Panics
    ///
    /// Same as [`Worker::create_job_with`].
    pub fn create_child_job_with<F>(&self, parent: JobRef, closure: F) -> JobRef
    where
        F: FnOnce(&Worker<'_>, &Job<'_>) + Send + 'static,
    {
        self.try_create_job_with(Some(parent), closure)
            .unwrap_or_else(|e| panic!("{e}"))
    }

    /// Fallible form of [`Worker::create_job`] and [`Worker::create_child_job`].
    ///
    /// A `parent` whose slot has already been released is a contract
    /// violation and panics rather than returning an error.
    pub fn try_create_job(
        &self,
        parent: Option<JobRef>,
        function: JobFn,
        payload: &[u8],
    ) -> Result<JobRef, SchedulerError> {
        let parent_node = parent.map(|p| self.registry.live_node(p));
        let job = self.slot.arena.create(function, parent, payload)?;
        self.attach(parent_node);
        Ok(job)
    }

    /// Fallible form of [`Worker::create_job_with`] and
    /// [`Worker::create_child_job_with`].
    pub fn try_create_job_with<F>(
        &self,
        parent: Option<JobRef>,
        closure: F,
    ) -> Result<JobRef, SchedulerError>
    where
        F: FnOnce(&Worker<'_>, &Job<'_>) + Send + 'static,
    {
        let parent_node = parent.map(|p| self.registry.live_node(p));
        let job = self.slot.arena.create_closure(parent, closure)?;
        self.attach(parent_node);
        Ok(job)
    }

    // The child is not queued yet, so the parent cannot observe itself
    // complete between allocation and this increment.
    fn attach(&self, parent: Option<&JobNode>) {
        if let Some(parent) = parent {
            parent.add_child();
        }
        record!(self.registry, jobs_created);
    }

    /// Queues `job` on this worker's deque.
    ///
    /// With `owns_self` the caller keeps the node and must release it with
    /// [`Worker::wait`]; otherwise the scheduler frees it as soon as it and
    /// all its descendants have finished.
    ///
    /// # Panics
    ///
    /// Panics if the job was already submitted, its handle is stale, or the
    /// deque is full.
    pub fn submit(&self, job: JobRef, owns_self: bool) {
        self.registry.live_node(job).mark_queued(owns_self);
        self.slot.deque.push(job);
        record!(self.registry, local_pushes);
    }

    /// Runs other jobs until `job` and all its descendants have finished,
    /// then releases the node.
    ///
    /// # Panics
    ///
    /// Panics if `job` was submitted detached, never submitted, or already
    /// released (including a second `wait` on the same handle).
    pub fn wait(&self, job: JobRef) {
        let node = self.registry.live_node(job);
        match node.state() {
            JobState::Free => panic!("wait on a released job {job:?}"),
            JobState::Created => panic!("wait on job {job:?} that was never submitted"),
            _ => {}
        }
        assert!(
            node.owns_self(),
            "wait on detached job {job:?}; only owned jobs can be waited on"
        );

        let backoff = Backoff::new();
        while !node.is_complete() {
            if self.run_once() {
                backoff.reset();
            } else {
                self.idle(&backoff);
            }
        }
        self.registry.release(job);
    }

    /// Whether `job` and all its descendants have finished. A job whose slot
    /// has since been released counts as finished.
    pub fn is_complete(&self, job: JobRef) -> bool {
        let node = self.registry.node(job);
        !node.is_current(job) || node.is_complete()
    }

    /// One scheduling step: pop a local job or steal one from a peer, and run
    /// it. Returns whether a job ran.
    pub fn run_once(&self) -> bool {
        if let Some(job) = self.slot.deque.pop() {
            record!(self.registry, local_pops);
            self.execute(job);
            return true;
        }

        let Some(victim) = self.pick_victim() else {
            return false;
        };
        let Some(victim_slot) = self.registry.try_slot(victim) else {
            return false;
        };
        match victim_slot.deque.steal() {
            Steal::Success(job) => {
                record!(self.registry, steals_success);
                trace!(worker = self.id, victim, "stole job");
                self.execute(job);
                true
            }
            Steal::Retry => {
                record!(self.registry, steals_retry);
                false
            }
            Steal::Empty => {
                record!(self.registry, steals_empty);
                false
            }
        }
    }

    /// Loops until the scheduler shuts down. Body of every spawned thread.
    pub(crate) fn run_until_shutdown(&self) {
        let backoff = Backoff::new();
        while !self.registry.is_shutting_down() {
            if self.run_once() {
                backoff.reset();
            } else {
                self.idle(&backoff);
            }
        }
    }

    fn pick_victim(&self) -> Option<usize> {
        let n = self.registry.num_workers();
        if n < 2 {
            return None;
        }
        let victim = match self.registry.config().victim_policy {
            VictimPolicy::RoundRobin => {
                let mut v = (self.next_victim.get() + 1) % n;
                if v == self.id {
                    v = (v + 1) % n;
                }
                self.next_victim.set(v);
                v
            }
            VictimPolicy::Random => {
                let v = self.rng.borrow_mut().random_range(0..n - 1);
                if v >= self.id { v + 1 } else { v }
            }
        };
        Some(victim)
    }

    fn idle(&self, backoff: &Backoff) {
        match self.registry.config().idle_strategy {
            IdleStrategy::Spin => std::hint::spin_loop(),
            IdleStrategy::Backoff => backoff.snooze(),
        }
    }

    fn execute(&self, job: JobRef) {
        let node = self.registry.node(job);
        node.set_state(JobState::Running);
        let span = self
            .registry
            .config()
            .record_trace
            .then(|| TraceGuard::new("job", self.id));

        let function = node.function();
        let view = Job::new(job, node);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| function(self, &view))) {
            record!(self.registry, job_panics);
            error!(
                worker = self.id,
                job = ?job,
                panic = panic_message(payload.as_ref()),
                "job panicked; treating it as finished"
            );
        }

        node.set_state(JobState::Executed);
        record!(self.registry, jobs_executed);
        drop(span);
        self.complete(job);
    }

    /// Drops the finished job's own unit of work and walks up the tree while
    /// nodes reach zero, freeing detached ones on the way.
    fn complete(&self, job: JobRef) {
        let mut current = job;
        loop {
            let node = self.registry.node(current);
            // Read before the decrement: once the count hits zero an owned
            // node may be released by its waiter at any moment.
            let parent = node.parent();
            let detached = !node.owns_self();

            if !node.finish_one() {
                return;
            }
            if detached {
                self.registry.release(current);
            }
            match parent {
                Some(parent) => current = parent,
                None => return,
            }
        }
    }
}

impl Drop for Worker<'_> {
    fn drop(&mut self) {
        if self.leased {
            trace::collect_local_trace();
            self.registry.release_lease();
            debug!("main worker lease released");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use crate::{Job, Scheduler, SchedulerConfig, VictimPolicy, Worker};
    use std::sync::atomic::{AtomicUsize, Ordering};

    static LEAVES: AtomicUsize = AtomicUsize::new(0);

    fn leaf(_: &Worker<'_>, job: &Job<'_>) {
        let weight = u32::from_le_bytes(job.payload().try_into().expect("4-byte payload"));
        LEAVES.fetch_add(weight as usize, Ordering::SeqCst);
    }

    fn fan(worker: &Worker<'_>, job: &Job<'_>) {
        for i in 1..=4u32 {
            let child = worker.create_child_job(job.handle(), leaf, &i.to_le_bytes());
            worker.submit(child, false);
        }
    }

    #[test]
    fn test_payload_jobs_single_worker() {
        let scheduler = Scheduler::with_workers(1).expect("scheduler");
        let worker = scheduler.main_worker().expect("lease");

        let root = worker.create_job(fan, &[]);
        worker.submit(root, true);
        worker.wait(root);

        assert_eq!(LEAVES.load(Ordering::SeqCst), 1 + 2 + 3 + 4);
    }

    #[test]
    fn test_owner_runs_newest_job_first() {
        let scheduler = Scheduler::with_workers(1).expect("scheduler");
        let worker = scheduler.main_worker().expect("lease");
        let order: &'static std::sync::Mutex<Vec<u32>> =
            Box::leak(Box::new(std::sync::Mutex::new(Vec::new())));

        let jobs: Vec<_> = (0..3u32)
            .map(|i| {
                let job = worker.create_job_with(move |_, _| {
                    order.lock().expect("order lock").push(i);
                });
                worker.submit(job, true);
                job
            })
            .collect();
        for job in jobs {
            worker.wait(job);
        }

        assert_eq!(*order.lock().expect("order lock"), vec![2, 1, 0]);
    }

    #[test]
    fn test_round_robin_skips_self() {
        let scheduler = Scheduler::new(SchedulerConfig::default().with_workers(3)).expect("scheduler");
        let worker = scheduler.main_worker().expect("lease");
        let picks: Vec<_> = (0..4).map(|_| worker.pick_victim()).collect();
        assert_eq!(picks, vec![Some(1), Some(2), Some(1), Some(2)]);
    }

    #[test]
    fn test_random_victim_never_self() {
        let config = SchedulerConfig {
            victim_policy: VictimPolicy::Random,
            ..SchedulerConfig::default().with_workers(4)
        };
        let scheduler = Scheduler::new(config).expect("scheduler");
        let worker = scheduler.main_worker().expect("lease");
        for _ in 0..1000 {
            let v = worker.pick_victim().expect("peers exist");
            assert!(v != 0 && v < 4);
        }
    }

    #[test]
    fn test_single_worker_never_steals() {
        let scheduler = Scheduler::with_workers(1).expect("scheduler");
        let worker = scheduler.main_worker().expect("lease");
        assert_eq!(worker.pick_victim(), None);
        assert!(!worker.run_once());
    }
}
