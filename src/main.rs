use fiberjobs::{IoJobDescr, JobDescr, Priority, Scheduler, SchedulerConfig, SchedulerError, StackClass};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

const THROUGHPUT_JOBS: usize = 10_000;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), SchedulerError> {
    println!("fiberjobs - fiber-based cooperative job scheduler\n");

    let mut config = SchedulerConfig::from_env()?;
    config.queue_capacity = config.queue_capacity.max(THROUGHPUT_JOBS);
    let scheduler = Scheduler::new(config)?;
    println!(
        "Started {} fiber workers and {} I/O workers\n",
        scheduler.fiber_worker_count(),
        scheduler.io_worker_count()
    );

    // Example 1: Simple job execution
    println!("Example 1: Simple job execution");
    scheduler.kick_and_wait(JobDescr::new(|| println!("  Hello from a fiber job!")).with_label("hello"))?;
    println!("  Job completed\n");

    // Example 2: Parallel computation
    println!("Example 2: Parallel computation");
    let sum = Arc::new(AtomicUsize::new(0));
    let num_jobs = 100;
    let counter = scheduler.generate_counter()?;
    let start = Instant::now();
    for i in 0..num_jobs {
        let sum = sum.clone();
        scheduler.kick(
            JobDescr::new(move || {
                let local: usize = (0..1000).sum();
                std::hint::black_box(local);
                sum.fetch_add(i, Ordering::SeqCst);
            })
            .with_counter(&counter),
        )?;
    }
    scheduler.wait(&counter);
    scheduler.destroy_counter(counter);
    let expected: usize = (0..num_jobs).sum();
    println!("  Executed {num_jobs} jobs in {:?}", start.elapsed());
    println!("  Sum result: {} (expected: {expected})\n", sum.load(Ordering::SeqCst));

    // Example 3: Nested fan-out, waiting inside a fiber
    println!("Example 3: Nested fan-out");
    let handle = scheduler.handle();
    let leaves = Arc::new(AtomicUsize::new(0));
    let leaves_clone = leaves.clone();
    scheduler.kick_and_wait(
        JobDescr::new(move || {
            let counter = match handle.generate_counter() {
                Ok(counter) => counter,
                Err(e) => {
                    tracing::error!(error = %e, "no counter for fan-out");
                    return;
                }
            };
            for _ in 0..8 {
                let branch = handle.clone();
                let leaves = leaves_clone.clone();
                let kicked = handle.kick(
                    JobDescr::new(move || {
                        for _ in 0..4 {
                            let leaves = leaves.clone();
                            if let Err(e) = branch.kick_and_wait(
                                JobDescr::new(move || {
                                    leaves.fetch_add(1, Ordering::SeqCst);
                                })
                                .with_priority(Priority::High),
                            ) {
                                tracing::error!(error = %e, "leaf rejected");
                            }
                        }
                    })
                    .with_stack_class(StackClass::Large)
                    .with_counter(&counter),
                );
                if let Err(e) = kicked {
                    tracing::error!(error = %e, "branch rejected");
                }
            }
            handle.wait(&counter);
            handle.destroy_counter(counter);
        })
        .with_label("fan-out"),
    )?;
    println!("  Leaves executed: {} (expected: 32)\n", leaves.load(Ordering::SeqCst));

    // Example 4: Blocking work on the I/O lane
    println!("Example 4: I/O job");
    let counter = scheduler.generate_counter()?;
    scheduler.kick_io(
        IoJobDescr::new(|| {
            let name = std::thread::current().name().unwrap_or_default().to_string();
            std::thread::sleep(std::time::Duration::from_millis(20));
            println!("  Blocking call finished on {name}");
        })
        .with_label("sleep")
        .with_counter(&counter),
    )?;
    scheduler.wait(&counter);
    scheduler.destroy_counter(counter);
    println!();

    // Example 5: High-throughput benchmark
    println!("Example 5: High-throughput benchmark");
    let counter = scheduler.generate_counter()?;
    let start = Instant::now();
    for _ in 0..THROUGHPUT_JOBS {
        scheduler.kick(
            JobDescr::new(|| {
                let x: u32 = (0..10).sum();
                std::hint::black_box(x);
            })
            .with_counter(&counter),
        )?;
    }
    scheduler.wait(&counter);
    scheduler.destroy_counter(counter);
    let duration = start.elapsed();
    let jobs_per_second = THROUGHPUT_JOBS as f64 / duration.as_secs_f64();
    println!("  Executed {THROUGHPUT_JOBS} jobs in {duration:?}");
    println!("  Throughput: {jobs_per_second:.2} jobs/second\n");

    println!("Shutting down scheduler...");
    scheduler.shutdown()?;
    println!("Done!");
    Ok(())
}
