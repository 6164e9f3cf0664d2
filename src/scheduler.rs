//! Worker registry, thread bootstrap and the process-wide scheduler.
//!
//! The registry holds one slot per worker: its deque and its job arena. Slot
//! 0 belongs to whichever thread leases the main worker; every other slot is
//! filled by its own worker thread at startup, so the backing memory is
//! first touched on the core that will use it. Slots are never resized or
//! replaced for the lifetime of the scheduler.

use crate::config::{PinningStrategy, SchedulerConfig};
use crate::deque::WorkStealingDeque;
use crate::error::SchedulerError;
use crate::job::{Job, JobArena, JobNode, JobRef};
use crate::topology::{CACHE_LINE_SIZE, Topology};
use crate::trace::CollectorGuard;
use crate::worker::Worker;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

#[cfg(feature = "metrics")]
use crate::metrics::{Metrics, MetricsSnapshot};

/// Per-worker state reachable from every thread.
pub(crate) struct WorkerSlot {
    pub(crate) deque: WorkStealingDeque<JobRef>,
    pub(crate) arena: JobArena,
}

/// State shared by all workers of one scheduler.
pub(crate) struct Registry {
    slots: Box<[OnceLock<WorkerSlot>]>,
    config: SchedulerConfig,
    shutdown: AtomicBool,
    main_leased: AtomicBool,
    registered: AtomicUsize,
    #[cfg(feature = "metrics")]
    pub(crate) metrics: Metrics,
}

impl Registry {
    fn new(num_workers: usize, config: SchedulerConfig) -> Self {
        Registry {
            slots: (0..num_workers).map(|_| OnceLock::new()).collect(),
            config,
            shutdown: AtomicBool::new(false),
            main_leased: AtomicBool::new(false),
            registered: AtomicUsize::new(0),
            #[cfg(feature = "metrics")]
            metrics: Metrics::new(),
        }
    }

    /// Allocates worker `id`'s deque and arena on the calling thread.
    fn register(&self, id: usize) {
        let slot = WorkerSlot {
            deque: WorkStealingDeque::new(self.config.deque_capacity),
            arena: JobArena::new(id, self.config.arena_capacity),
        };
        if self.slots[id].set(slot).is_err() {
            panic!("worker {id} registered twice");
        }
        self.registered.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn num_workers(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub(crate) fn try_slot(&self, id: usize) -> Option<&WorkerSlot> {
        self.slots[id].get()
    }

    pub(crate) fn slot(&self, id: usize) -> &WorkerSlot {
        self.try_slot(id)
            .unwrap_or_else(|| panic!("worker {id} has not registered"))
    }

    pub(crate) fn node(&self, job: JobRef) -> &JobNode {
        self.slot(job.worker()).arena.node(job.slot())
    }

    /// Like [`Registry::node`], for handles coming from user code.
    ///
    /// # Panics
    ///
    /// Panics if the slot has been released since `job` was created.
    pub(crate) fn live_node(&self, job: JobRef) -> &JobNode {
        let node = self.node(job);
        assert!(
            node.is_current(job),
            "stale job handle {job:?}; its slot was released (current generation {})",
            node.generation()
        );
        node
    }

    /// Returns a job's slot to the arena that owns it.
    pub(crate) fn release(&self, job: JobRef) {
        self.slot(job.worker()).arena.release(job.slot() as u32);
    }

    pub(crate) fn release_lease(&self) {
        self.main_leased.store(false, Ordering::Release);
    }
}

/// A pool of workers sharing one registry.
///
/// Worker 0 has no thread of its own: the caller leases it through
/// [`Scheduler::main_worker`] (or [`Scheduler::run`]) and executes jobs on it
/// while waiting. Workers `1..n` run on dedicated threads until the scheduler
/// is shut down or dropped.
///
/// ```
/// use jobthief::Scheduler;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// static HITS: AtomicUsize = AtomicUsize::new(0);
///
/// let scheduler = Scheduler::with_workers(2).unwrap();
/// scheduler
///     .run(|worker, job| {
///         for _ in 0..10 {
///             let child = worker.create_child_job_with(job.handle(), |_, _| {
///                 HITS.fetch_add(1, Ordering::Relaxed);
///             });
///             worker.submit(child, false);
///         }
///     })
///     .unwrap();
/// assert_eq!(HITS.load(Ordering::Relaxed), 10);
/// ```
pub struct Scheduler {
    registry: Arc<Registry>,
    threads: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Validates `config`, registers worker 0 and starts the worker threads.
    ///
    /// Returns once every worker has allocated its deque and arena.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;

        let topology = Topology::detect();
        if topology.cache_line_size != CACHE_LINE_SIZE {
            warn!(
                detected = topology.cache_line_size,
                compiled = CACHE_LINE_SIZE,
                "cache line size differs from the job node size; nodes may share lines"
            );
        }
        let num_workers = config.resolved_workers(topology.logical_cores);

        let registry = Arc::new(Registry::new(num_workers, config));
        registry.register(0);

        let mut scheduler = Scheduler {
            registry,
            threads: Vec::with_capacity(num_workers - 1),
        };

        for id in 1..num_workers {
            let registry = Arc::clone(&scheduler.registry);
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", registry.config.thread_name_prefix, id))
                .spawn(move || worker_main(registry, id));
            match spawned {
                Ok(handle) => scheduler.threads.push(handle),
                Err(source) => {
                    scheduler.stop_and_join();
                    return Err(SchedulerError::Spawn { id, source });
                }
            }
        }

        while scheduler.registry.registered.load(Ordering::Acquire) < num_workers {
            if scheduler.threads.iter().any(JoinHandle::is_finished) {
                let failed = scheduler.stop_and_join();
                return Err(SchedulerError::WorkerPanicked(failed.max(1)));
            }
            thread::yield_now();
        }

        info!(
            workers = num_workers,
            cpu = %topology.cpu_brand,
            deque_capacity = scheduler.registry.config.deque_capacity,
            arena_capacity = scheduler.registry.config.arena_capacity,
            "scheduler started"
        );
        Ok(scheduler)
    }

    /// Starts a scheduler with `num_workers` workers and default settings.
    pub fn with_workers(num_workers: usize) -> Result<Self, SchedulerError> {
        Self::new(SchedulerConfig::default().with_workers(num_workers))
    }

    /// Leases worker 0 to the calling thread. The lease ends when the
    /// returned worker is dropped.
    pub fn main_worker(&self) -> Result<Worker<'_>, SchedulerError> {
        self.registry
            .main_leased
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .map_err(|_| SchedulerError::WorkerLeased)?;
        debug!("main worker leased");
        Ok(Worker::new(0, &self.registry, true))
    }

    /// Runs `root` as an owned root job on the main worker and returns once
    /// it and every job it spawned have finished.
    pub fn run<F>(&self, root: F) -> Result<(), SchedulerError>
    where
        F: FnOnce(&Worker<'_>, &Job<'_>) + Send + 'static,
    {
        let worker = self.main_worker()?;
        let job = worker.try_create_job_with(None, root)?;
        worker.submit(job, true);
        worker.wait(job);
        Ok(())
    }

    /// Total number of workers, including worker 0.
    pub fn num_workers(&self) -> usize {
        self.registry.num_workers()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.registry.config
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Returns a snapshot of the scheduler's counters.
    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.registry.metrics.snapshot()
    }

    /// Stops the worker threads and waits for them to exit.
    ///
    /// Jobs still queued are never run. Returns an error if any worker
    /// thread panicked.
    pub fn shutdown(mut self) -> Result<(), SchedulerError> {
        let failed = self.stop_and_join();
        info!(failed, "scheduler shut down");
        if failed > 0 {
            Err(SchedulerError::WorkerPanicked(failed))
        } else {
            Ok(())
        }
    }

    fn stop_and_join(&mut self) -> usize {
        self.registry.shutdown.store(true, Ordering::Relaxed);
        let mut failed = 0;
        for (index, handle) in self.threads.drain(..).enumerate() {
            if handle.join().is_err() {
                failed += 1;
                error!(worker = index + 1, "worker thread panicked");
            }
        }
        failed
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.stop_and_join();
        }
    }
}

fn worker_main(registry: Arc<Registry>, id: usize) {
    if registry.config.pinning == PinningStrategy::Linear {
        pin_current_thread(id);
    }
    registry.register(id);

    let _collector = CollectorGuard;
    let worker = Worker::new(id, &registry, false);
    debug!(worker = id, "worker started");
    worker.run_until_shutdown();
    debug!(worker = id, "worker exiting");
}

fn pin_current_thread(id: usize) {
    match core_affinity::get_core_ids() {
        Some(core_ids) if !core_ids.is_empty() => {
            let core = core_ids[id % core_ids.len()];
            if !core_affinity::set_for_current(core) {
                warn!(worker = id, core = core.id, "failed to pin worker thread");
            }
        }
        _ => warn!(worker = id, "core ids unavailable; worker left unpinned"),
    }
}

static GLOBAL: OnceLock<Scheduler> = OnceLock::new();
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Starts the process-wide scheduler.
///
/// Only the first successful call starts workers; later calls return
/// [`SchedulerError::AlreadyInitialized`] and leave it untouched. The global
/// scheduler's workers run for the rest of the process.
pub fn initialize(config: SchedulerConfig) -> Result<&'static Scheduler, SchedulerError> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    if GLOBAL.get().is_some() {
        return Err(SchedulerError::AlreadyInitialized);
    }
    let scheduler = Scheduler::new(config)?;
    Ok(GLOBAL.get_or_init(move || scheduler))
}

/// The process-wide scheduler, if [`initialize`] has succeeded.
pub fn global() -> Option<&'static Scheduler> {
    GLOBAL.get()
}
