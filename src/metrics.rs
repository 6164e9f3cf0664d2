//! Optional scheduler counters, compiled in with the `metrics` feature.

#[cfg(feature = "metrics")]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "metrics")]
use std::time::Instant;

/// Bumps a counter on the registry's metrics; expands to nothing without
/// the `metrics` feature.
#[cfg(feature = "metrics")]
macro_rules! record {
    ($registry:expr, $field:ident) => {{
        $registry
            .metrics
            .$field
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }};
}

#[cfg(not(feature = "metrics"))]
macro_rules! record {
    ($registry:expr, $field:ident) => {{}};
}

/// Scheduler-wide performance counters.
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct Metrics {
    /// Jobs allocated from any arena.
    pub jobs_created: AtomicU64,
    /// Jobs whose function has returned.
    pub jobs_executed: AtomicU64,
    /// Jobs whose function panicked.
    pub job_panics: AtomicU64,
    /// Pushes onto a worker's own deque.
    pub local_pushes: AtomicU64,
    /// Successful pops from a worker's own deque.
    pub local_pops: AtomicU64,
    /// Steals that claimed a job.
    pub steals_success: AtomicU64,
    /// Steals that found the victim empty.
    pub steals_empty: AtomicU64,
    /// Steals that lost a race for the front slot.
    pub steals_retry: AtomicU64,
    /// Time when metrics collection started.
    pub start_time: Instant,
}

#[cfg(feature = "metrics")]
impl Metrics {
    pub fn new() -> Self {
        Self {
            jobs_created: AtomicU64::new(0),
            jobs_executed: AtomicU64::new(0),
            job_panics: AtomicU64::new(0),
            local_pushes: AtomicU64::new(0),
            local_pops: AtomicU64::new(0),
            steals_success: AtomicU64::new(0),
            steals_empty: AtomicU64::new(0),
            steals_retry: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Returns a snapshot of current metrics values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_created: self.jobs_created.load(Ordering::Relaxed),
            jobs_executed: self.jobs_executed.load(Ordering::Relaxed),
            job_panics: self.job_panics.load(Ordering::Relaxed),
            local_pushes: self.local_pushes.load(Ordering::Relaxed),
            local_pops: self.local_pops.load(Ordering::Relaxed),
            steals_success: self.steals_success.load(Ordering::Relaxed),
            steals_empty: self.steals_empty.load(Ordering::Relaxed),
            steals_retry: self.steals_retry.load(Ordering::Relaxed),
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(feature = "metrics")]
impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[cfg(feature = "metrics")]
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub jobs_created: u64,
    pub jobs_executed: u64,
    pub job_panics: u64,
    pub local_pushes: u64,
    pub local_pops: u64,
    pub steals_success: u64,
    pub steals_empty: u64,
    pub steals_retry: u64,
    pub elapsed_seconds: f64,
}

#[cfg(feature = "metrics")]
impl MetricsSnapshot {
    /// Calculates jobs per second throughput.
    pub fn jobs_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.jobs_executed as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }

    /// Fraction of executed jobs that were obtained by stealing.
    pub fn steal_ratio(&self) -> f64 {
        if self.jobs_executed == 0 {
            0.0
        } else {
            self.steals_success as f64 / self.jobs_executed as f64
        }
    }
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.jobs_created, 0);
        assert_eq!(snapshot.jobs_executed, 0);
        assert_eq!(snapshot.steals_success, 0);
        assert!(snapshot.elapsed_seconds >= 0.0);
    }

    #[test]
    fn test_steal_ratio() {
        let metrics = Metrics::new();
        metrics.jobs_executed.fetch_add(10, Ordering::Relaxed);
        metrics.steals_success.fetch_add(4, Ordering::Relaxed);

        let snapshot = metrics.snapshot();
        assert!((snapshot.steal_ratio() - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn test_throughput_calculation() {
        let metrics = Metrics::new();
        metrics.jobs_executed.fetch_add(100, Ordering::Relaxed);

        thread::sleep(Duration::from_millis(10));
        let snapshot = metrics.snapshot();

        assert!(snapshot.jobs_per_second() > 0.0);
    }
}
