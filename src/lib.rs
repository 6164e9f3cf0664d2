//! # jobthief - Fork-Join Work-Stealing Job Scheduler
//!
//! A cooperative multi-threaded job scheduler. Each worker owns a bounded
//! work-stealing deque: it pushes and pops its own jobs at the back (newest
//! first, while their data is still in cache) and, when it runs dry, steals
//! the oldest job from a peer's front.
//!
//! ## Architecture
//!
//! - **Jobs**: a function pointer plus up to [`PAYLOAD_CAPACITY`] bytes of
//!   copied arguments (or an inline closure), a link to the parent job, and
//!   a pending counter. Each node occupies exactly one cache line.
//! - **Completion propagation**: a job is complete when its own function has
//!   returned and all its children are complete. Finishing a job walks up the
//!   tree decrementing ancestors, freeing detached jobs as they reach zero.
//! - **Workers**: every core operation takes an explicit [`Worker`] context.
//!   Spawned threads loop forever popping and stealing; the launching thread
//!   leases worker 0 and executes jobs while it waits.
//! - **Memory**: nodes live in per-worker arenas. Freeing a node returns its
//!   slot to the owning arena's lock-free free list.
//!
//! ## Example
//!
//! ```no_run
//! use jobthief::{Job, Scheduler, Worker};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! static LEAVES: AtomicUsize = AtomicUsize::new(0);
//!
//! fn leaf(_: &Worker<'_>, _: &Job<'_>) {
//!     LEAVES.fetch_add(1, Ordering::Relaxed);
//! }
//!
//! fn spawn_leaves(worker: &Worker<'_>, job: &Job<'_>) {
//!     let fan_out = u32::from_le_bytes(job.payload().try_into().unwrap());
//!     for _ in 0..fan_out {
//!         let child = worker.create_child_job(job.handle(), leaf, &[]);
//!         worker.submit(child, false);
//!     }
//! }
//!
//! let scheduler = Scheduler::with_workers(4).unwrap();
//! let worker = scheduler.main_worker().unwrap();
//!
//! let root = worker.create_job(spawn_leaves, &128u32.to_le_bytes());
//! worker.submit(root, true);
//! worker.wait(root);
//!
//! assert_eq!(LEAVES.load(Ordering::Relaxed), 128);
//! ```

#[macro_use]
mod metrics;

pub mod config;
pub mod deque;
pub mod error;
pub mod job;
pub mod scheduler;
pub mod topology;
pub mod trace;
pub mod worker;

pub use config::{IdleStrategy, PinningStrategy, SchedulerConfig, VictimPolicy};
pub use deque::WorkStealingDeque;
pub use error::SchedulerError;
pub use job::{Job, JobFn, JobRef, MAX_WORKERS, PAYLOAD_CAPACITY};
#[cfg(feature = "metrics")]
pub use metrics::{Metrics, MetricsSnapshot};
pub use scheduler::{Scheduler, global, initialize};
pub use worker::Worker;
