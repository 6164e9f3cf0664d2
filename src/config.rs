//! Scheduler configuration.

use crate::error::SchedulerError;
use crate::job::MAX_WORKERS;
use serde::{Deserialize, Serialize};

/// Default number of slots in each worker's deque.
pub const DEFAULT_DEQUE_CAPACITY: usize = 4096 * 16;

/// Default number of job nodes in each worker's arena.
pub const DEFAULT_ARENA_CAPACITY: usize = 4096 * 16;

/// Strategy for pinning worker threads to CPU cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinningStrategy {
    /// No pinning (standard OS scheduling).
    #[default]
    None,
    /// Linear pinning (worker i -> logical processor i).
    Linear,
}

/// How an idle worker picks the peer it steals from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VictimPolicy {
    /// Rotating counter over all peers, skipping the current worker.
    #[default]
    RoundRobin,
    /// Uniformly random peer, never the current worker.
    Random,
}

/// What a worker does after a step that found no job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IdleStrategy {
    /// Spin with a CPU hint and retry immediately.
    Spin,
    /// Exponential spin that degrades to yielding the thread.
    #[default]
    Backoff,
}

/// Configuration for a [`Scheduler`](crate::Scheduler).
///
/// Every field has a default, so partial configurations deserialize:
///
/// ```
/// use jobthief::SchedulerConfig;
///
/// let config = SchedulerConfig::default().with_workers(4);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Total worker count, including the launching thread's worker 0.
    /// `None` uses one worker per logical core.
    pub num_workers: Option<usize>,
    /// Slots per worker deque. Must be a power of two.
    pub deque_capacity: usize,
    /// Job nodes per worker arena.
    pub arena_capacity: usize,
    pub victim_policy: VictimPolicy,
    pub idle_strategy: IdleStrategy,
    pub pinning: PinningStrategy,
    /// Worker threads are named `{prefix}-{id}`.
    pub thread_name_prefix: String,
    /// Record a span for every executed job (see [`crate::trace`]).
    pub record_trace: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: None,
            deque_capacity: DEFAULT_DEQUE_CAPACITY,
            arena_capacity: DEFAULT_ARENA_CAPACITY,
            victim_policy: VictimPolicy::default(),
            idle_strategy: IdleStrategy::default(),
            pinning: PinningStrategy::default(),
            thread_name_prefix: "jobthief".to_string(),
            record_trace: false,
        }
    }
}

impl SchedulerConfig {
    /// Sets an explicit worker count.
    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = Some(num_workers);
        self
    }

    /// Checks every field, returning the first problem found.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if let Some(n) = self.num_workers {
            if n == 0 {
                return Err(SchedulerError::InvalidConfig(
                    "num_workers must be at least 1".into(),
                ));
            }
            if n > MAX_WORKERS {
                return Err(SchedulerError::InvalidConfig(format!(
                    "num_workers {n} exceeds the {MAX_WORKERS} a job handle can address"
                )));
            }
        }
        if self.deque_capacity < 2 || !self.deque_capacity.is_power_of_two() {
            return Err(SchedulerError::InvalidConfig(format!(
                "deque_capacity {} is not a power of two >= 2",
                self.deque_capacity
            )));
        }
        if self.arena_capacity == 0 || self.arena_capacity >= u32::MAX as usize {
            return Err(SchedulerError::InvalidConfig(format!(
                "arena_capacity {} is out of range",
                self.arena_capacity
            )));
        }
        Ok(())
    }

    /// Worker count to start with, falling back to `available` cores.
    pub fn resolved_workers(&self, available: usize) -> usize {
        self.num_workers.unwrap_or(available).max(1)
    }
}
