//! Error type shared by the scheduler's fallible entry points.

use std::io;
use thiserror::Error;

/// Errors reported by scheduler setup and job creation.
///
/// Contract violations on the hot path (deque overflow, waiting on a
/// detached job, submitting a job twice) are not represented here; those
/// panic.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The process-wide scheduler has already been initialized.
    #[error("scheduler already initialized")]
    AlreadyInitialized,

    /// A configuration value was rejected by [`SchedulerConfig::validate`].
    ///
    /// [`SchedulerConfig::validate`]: crate::config::SchedulerConfig::validate
    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    /// Worker 0 is currently leased by another caller.
    #[error("main worker is already leased")]
    WorkerLeased,

    /// The job's argument payload does not fit inline in a job node.
    #[error("job payload of {len} bytes exceeds the {capacity}-byte inline capacity")]
    PayloadTooLarge { len: usize, capacity: usize },

    /// Every slot of a worker's job arena is holding a live job.
    #[error("job arena of worker {worker} is exhausted ({capacity} live jobs)")]
    ArenaExhausted { worker: usize, capacity: usize },

    /// The OS refused to start a worker thread.
    #[error("failed to spawn worker thread {id}")]
    Spawn {
        id: usize,
        #[source]
        source: io::Error,
    },

    /// One or more worker threads panicked before they could be joined.
    #[error("{0} worker thread(s) panicked")]
    WorkerPanicked(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_payload_error_message() {
        let err = SchedulerError::PayloadTooLarge {
            len: 40,
            capacity: 32,
        };
        assert_eq!(
            err.to_string(),
            "job payload of 40 bytes exceeds the 32-byte inline capacity"
        );
    }

    #[test]
    fn test_spawn_error_keeps_source() {
        let err = SchedulerError::Spawn {
            id: 3,
            source: io::Error::new(io::ErrorKind::Other, "out of threads"),
        };
        assert_eq!(err.to_string(), "failed to spawn worker thread 3");
        assert_eq!(err.source().map(|s| s.to_string()).as_deref(), Some("out of threads"));
    }
}
