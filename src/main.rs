use jobthief::{Job, Scheduler, SchedulerConfig, Worker};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

const SPAWN_AMOUNT: u32 = 128;

static LEAF_COUNT: AtomicUsize = AtomicUsize::new(0);

fn leaf_job(_: &Worker<'_>, _: &Job<'_>) {
    LEAF_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// Spawns `payload[0]` more levels below this job, `SPAWN_AMOUNT` wide.
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

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut config = SchedulerConfig::default();
    if let Some(arg) = std::env::args().nth(1) {
        match arg.parse::<usize>() {
            Ok(n) => config.num_workers = Some(n),
            Err(_) => {
                eprintln!("usage: jobthief [worker-count]");
                std::process::exit(2);
            }
        }
    }

    let scheduler = match Scheduler::new(config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to start scheduler: {e}");
            std::process::exit(1);
        }
    };
    println!("jobthief fan-out: {} workers", scheduler.num_workers());

    let start = Instant::now();
    {
        let worker = match scheduler.main_worker() {
            Ok(w) => w,
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(1);
            }
        };
        // Root spawns two more levels of spawners, then leaves: 128^3 leaves.
        let root = worker.create_job(spawn_level, &[2]);
        worker.submit(root, true);
        worker.wait(root);
    }
    let duration = start.elapsed();

    let leaves = LEAF_COUNT.load(Ordering::Relaxed);
    println!("  Executed {leaves} leaf jobs in {duration:?}");
    println!(
        "  Throughput: {:.2} jobs/second",
        leaves as f64 / duration.as_secs_f64()
    );

    #[cfg(feature = "metrics")]
    {
        let m = scheduler.metrics();
        println!(
            "  Steals: {} ok, {} empty, {} retry ({:.1}% of jobs stolen)",
            m.steals_success,
            m.steals_empty,
            m.steals_retry,
            m.steal_ratio() * 100.0
        );
    }

    if let Err(e) = scheduler.shutdown() {
        eprintln!("Shutdown error: {e}");
    }
}
