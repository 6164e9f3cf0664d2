//! Chrome Tracing capture of job executions.
//!
//! When [`SchedulerConfig::record_trace`](crate::SchedulerConfig) is set,
//! each executed job records a span into a thread-local buffer. Worker
//! threads flush their buffer when they exit and the main worker flushes when
//! its lease is dropped; [`export_to_file`] then writes everything collected
//! as JSON for chrome://tracing or ui.perfetto.dev.

use std::cell::RefCell;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A single trace event in Chrome Tracing format.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub name: &'static str,
    pub worker: usize,
    pub start_us: u64,
    pub duration_us: u64,
}

thread_local! {
    static TRACE_BUFFER: RefCell<Vec<TraceEvent>> = RefCell::new(Vec::new());
}

lazy_static::lazy_static! {
    static ref GLOBAL_START: Instant = Instant::now();
    static ref EPOCH_START_US: u64 = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    static ref ALL_BUFFERS: Mutex<Vec<Vec<TraceEvent>>> = Mutex::new(Vec::new());
}

/// Records a span of work on the current thread.
pub fn record_event(name: &'static str, worker: usize, start: Instant, duration: Duration) {
    let start_us = start.saturating_duration_since(*GLOBAL_START).as_micros() as u64 + *EPOCH_START_US;

    TRACE_BUFFER.with(|buf| {
        buf.borrow_mut().push(TraceEvent {
            name,
            worker,
            start_us,
            duration_us: duration.as_micros() as u64,
        });
    });
}

/// Moves this thread's buffered events into the global list.
pub fn collect_local_trace() {
    TRACE_BUFFER.with(|buf| {
        let mut local = buf.borrow_mut();
        if !local.is_empty() {
            ALL_BUFFERS
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(std::mem::take(&mut *local));
        }
    });
}

/// Number of events collected so far across all threads.
pub fn collected_event_count() -> usize {
    ALL_BUFFERS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(Vec::len)
        .sum()
}

/// Writes all collected events to `path` as a Chrome trace.
pub fn export_to_file(path: impl AsRef<Path>) -> std::io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    let buffers = ALL_BUFFERS.lock().unwrap_or_else(PoisonError::into_inner);

    writeln!(writer, "[")?;
    let mut first = true;
    for event in buffers.iter().flatten() {
        if !first {
            writeln!(writer, ",")?;
        }
        first = false;

        // ph: X is a "complete event" and needs dur.
        write!(
            writer,
            "{{\"name\":\"{}\",\"ph\":\"X\",\"ts\":{},\"dur\":{},\"pid\":1,\"tid\":{}}}",
            event.name, event.start_us, event.duration_us, event.worker
        )?;
    }
    writeln!(writer, "\n]")?;
    writer.flush()
}

/// Records a span from construction to drop.
pub struct TraceGuard {
    name: &'static str,
    worker: usize,
    start: Instant,
}

impl TraceGuard {
    pub fn new(name: &'static str, worker: usize) -> Self {
        Self {
            name,
            worker,
            start: Instant::now(),
        }
    }
}

impl Drop for TraceGuard {
    fn drop(&mut self) {
        record_event(self.name, self.worker, self.start, self.start.elapsed());
    }
}

/// Flushes the local buffer when dropped.
pub struct CollectorGuard;

impl Drop for CollectorGuard {
    fn drop(&mut self) {
        collect_local_trace();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_records_on_current_thread() {
        std::thread::spawn(|| {
            let _collector = CollectorGuard;
            let _span = TraceGuard::new("unit", 42);
        })
        .join()
        .expect("tracing thread panicked");

        let buffers = ALL_BUFFERS.lock().unwrap_or_else(PoisonError::into_inner);
        assert!(
            buffers
                .iter()
                .flatten()
                .any(|e| e.name == "unit" && e.worker == 42)
        );
    }
}
