//! High-level scheduler interface.
//!
//! The [`Scheduler`] is the composition root: it sizes the stack arena from
//! the configuration, builds one fiber pool per stack class, creates the
//! counter pool and the job queues, and spawns the fiber and I/O workers.
//! Jobs reach it through [`Scheduler::kick`] / [`Scheduler::kick_io`], or
//! through a cloneable [`SchedulerHandle`] captured by other jobs.

use crate::allocator::StackArena;
use crate::config::SchedulerConfig;
use crate::counter::{Counter, CounterPool};
use crate::error::SchedulerError;
use crate::fiber;
use crate::fiber_pool::{FiberPool, FiberSnapshot};
use crate::job::{IoJobDescr, JobDescr, Lane, StackClass};
#[cfg(feature = "metrics")]
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::queue::{JobQueues, ReadyFibers, StalledJobs};
use crate::worker::{self, WorkerThread};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// State shared by the scheduler, its handles and its workers.
pub(crate) struct Shared {
    pub(crate) config: SchedulerConfig,
    pub(crate) queues: JobQueues,
    pub(crate) ready: ReadyFibers,
    pub(crate) stalled: StalledJobs,
    pools: Vec<FiberPool>,
    counters: CounterPool,
    // Only locked at startup and shutdown.
    arena: Mutex<StackArena>,
    accepting: AtomicBool,
    pub(crate) shutdown: AtomicBool,
    /// Jobs kicked and not yet completed, on either lane.
    pub(crate) in_flight: AtomicUsize,
    main_thread: ThreadId,
    #[cfg(feature = "metrics")]
    pub(crate) metrics: Metrics,
}

impl Shared {
    pub(crate) fn pool(&self, class: StackClass) -> &FiberPool {
        &self.pools[class.index()]
    }

    fn submit(&self, lane: Lane, descr: JobDescr) -> Result<(), SchedulerError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(SchedulerError::ShuttingDown);
        }
        let class = descr.stack_class;
        if self.pool(class).capacity() == 0 {
            return Err(SchedulerError::NoFibersForClass(class));
        }

        let priority = descr.priority;
        if let Some(counter) = &descr.counter {
            counter.increment();
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);

        match self.queues.push(lane, descr) {
            Ok(()) => {
                #[cfg(feature = "metrics")]
                self.metrics.jobs_kicked.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(rejected) => {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                if let Some(counter) = &rejected.counter {
                    counter.decrement(&self.ready);
                }
                #[cfg(feature = "metrics")]
                self.metrics.jobs_rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%lane, ?priority, label = %rejected.label, "job queue full, rejecting job");
                Err(SchedulerError::QueueFull { lane, priority })
            }
        }
    }

    fn is_main_worker_thread(&self) -> bool {
        self.config.main_thread_is_worker && thread::current().id() == self.main_thread
    }
}

/// Cloneable access to a running scheduler, for use inside jobs.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    /// Queues a compute job and returns immediately.
    ///
    /// The job's counter, if any, is incremented before the job becomes
    /// visible to workers.
    pub fn kick(&self, descr: JobDescr) -> Result<(), SchedulerError> {
        self.shared.submit(Lane::Compute, descr)
    }

    /// Queues a job on the I/O workers.
    pub fn kick_io(&self, descr: IoJobDescr) -> Result<(), SchedulerError> {
        self.shared.submit(Lane::Io, descr.0)
    }

    /// Kicks `descr` and waits for its counter. Without a counter, a pooled
    /// one is used for the duration of the call.
    pub fn kick_and_wait(&self, descr: JobDescr) -> Result<(), SchedulerError> {
        let (descr, counter, temporary) = match descr.counter.clone() {
            Some(counter) => (descr, counter, false),
            None => {
                let counter = self.generate_counter()?;
                (descr.with_counter(&counter), counter, true)
            }
        };

        let result = self.kick(descr);
        if result.is_ok() {
            self.wait(&counter);
        }
        if temporary {
            self.destroy_counter(counter);
        }
        result
    }

    /// Waits until `counter` reaches zero.
    ///
    /// Inside a job, the calling fiber is parked and its worker keeps running
    /// other work. On the thread that created the scheduler, when it is
    /// configured as a worker, the thread runs jobs until the counter drains.
    /// Any other thread sleeps with exponential backoff.
    pub fn wait(&self, counter: &Counter) {
        if counter.is_complete() {
            return;
        }

        if let Some(fiber) = fiber::current() {
            worker::park_current(fiber, counter);
            return;
        }

        if self.shared.is_main_worker_thread() && !worker::on_worker_thread() {
            worker::help_until(&self.shared, || counter.is_complete());
            return;
        }

        let mut backoff_us = 1;
        const MAX_BACKOFF_US: u64 = 1000;
        while !counter.is_complete() {
            thread::sleep(Duration::from_micros(backoff_us));
            backoff_us = (backoff_us * 2).min(MAX_BACKOFF_US);
        }
    }

    /// Takes a zeroed counter from the pool.
    pub fn generate_counter(&self) -> Result<Counter, SchedulerError> {
        self.shared
            .counters
            .acquire()
            .ok_or(SchedulerError::CountersExhausted {
                capacity: self.shared.counters.capacity(),
            })
    }

    /// Returns a counter to the pool.
    ///
    /// # Panics
    ///
    /// Panics if jobs are still pending on it or fibers are parked on it.
    pub fn destroy_counter(&self, counter: Counter) {
        self.shared.counters.release(counter);
    }

    /// Counters still available from [`SchedulerHandle::generate_counter`].
    pub fn available_counters(&self) -> usize {
        self.shared.counters.available()
    }

    /// Jobs kicked and not yet completed.
    pub fn pending_jobs(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Jobs waiting in the queues of `lane`.
    pub fn queued_jobs(&self, lane: Lane) -> usize {
        self.shared.queues.len(lane)
    }

    /// Inspects every pooled fiber. Busy fibers are reported without reading
    /// their memory.
    pub fn fiber_snapshots(&self) -> Vec<FiberSnapshot> {
        self.shared
            .pools
            .iter()
            .flat_map(FiberPool::snapshot)
            .collect()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

/// The fiber job scheduler.
///
/// # Example
///
/// ```no_run
/// use fiberjobs::{JobDescr, Scheduler, SchedulerConfig};
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let scheduler = Scheduler::new(SchedulerConfig::default().with_fiber_workers(4))?;
/// let counter = scheduler.generate_counter()?;
/// let hits = Arc::new(AtomicUsize::new(0));
///
/// for _ in 0..100 {
///     let hits = hits.clone();
///     scheduler.kick(JobDescr::new(move || {
///         hits.fetch_add(1, Ordering::Relaxed);
///     }).with_counter(&counter))?;
/// }
///
/// scheduler.wait(&counter);
/// assert_eq!(hits.load(Ordering::Relaxed), 100);
/// scheduler.destroy_counter(counter);
/// scheduler.shutdown()?;
/// # Ok::<(), fiberjobs::SchedulerError>(())
/// ```
pub struct Scheduler {
    handle: SchedulerHandle,
    fiber_workers: Vec<WorkerThread>,
    io_workers: Vec<WorkerThread>,
    stopped: bool,
}

impl Scheduler {
    /// Builds the pools and starts the workers. The calling thread becomes
    /// the scheduler's main thread.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;

        let mut arena = StackArena::new();
        arena.initialize(config.fibers.arena_bytes())?;
        let pools = StackClass::ALL
            .iter()
            .map(|&class| {
                FiberPool::new(
                    class,
                    config.fibers.get(class),
                    config.poison_stacks,
                    &mut arena,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let fiber_worker_count = config.resolved_fiber_workers();
        let io_worker_count = config.resolved_io_workers();
        tracing::info!(
            fiber_workers = fiber_worker_count,
            io_workers = io_worker_count,
            main_thread_is_worker = config.main_thread_is_worker,
            arena_bytes = arena.capacity(),
            "starting scheduler"
        );

        let shared = Arc::new(Shared {
            queues: JobQueues::new(config.queue_capacity),
            ready: ReadyFibers::new(),
            stalled: StalledJobs::new(),
            pools,
            counters: CounterPool::new(config.max_counters),
            arena: Mutex::new(arena),
            accepting: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            main_thread: thread::current().id(),
            #[cfg(feature = "metrics")]
            metrics: Metrics::new(),
            config,
        });

        let mut scheduler = Scheduler {
            handle: SchedulerHandle {
                shared: Arc::clone(&shared),
            },
            fiber_workers: Vec::new(),
            io_workers: Vec::new(),
            stopped: false,
        };
        // On failure, dropping `scheduler` stops whatever was already spawned.
        scheduler.fiber_workers = worker::spawn_workers(Lane::Compute, fiber_worker_count, &shared)?;
        scheduler.io_workers = worker::spawn_workers(Lane::Io, io_worker_count, &shared)?;
        Ok(scheduler)
    }

    /// Creates a scheduler from `FIBERJOBS_*` environment variables.
    pub fn from_env() -> Result<Self, SchedulerError> {
        Self::new(SchedulerConfig::from_env()?)
    }

    /// Returns a cloneable handle for kicking and waiting from inside jobs.
    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// See [`SchedulerHandle::kick`].
    pub fn kick(&self, descr: JobDescr) -> Result<(), SchedulerError> {
        self.handle.kick(descr)
    }

    /// See [`SchedulerHandle::kick_io`].
    pub fn kick_io(&self, descr: IoJobDescr) -> Result<(), SchedulerError> {
        self.handle.kick_io(descr)
    }

    /// See [`SchedulerHandle::kick_and_wait`].
    pub fn kick_and_wait(&self, descr: JobDescr) -> Result<(), SchedulerError> {
        self.handle.kick_and_wait(descr)
    }

    /// See [`SchedulerHandle::wait`].
    pub fn wait(&self, counter: &Counter) {
        self.handle.wait(counter)
    }

    /// See [`SchedulerHandle::generate_counter`].
    pub fn generate_counter(&self) -> Result<Counter, SchedulerError> {
        self.handle.generate_counter()
    }

    /// See [`SchedulerHandle::destroy_counter`].
    pub fn destroy_counter(&self, counter: Counter) {
        self.handle.destroy_counter(counter)
    }

    /// See [`SchedulerHandle::fiber_snapshots`].
    pub fn fiber_snapshots(&self) -> Vec<FiberSnapshot> {
        self.handle.fiber_snapshots()
    }

    /// See [`SchedulerHandle::pending_jobs`].
    pub fn pending_jobs(&self) -> usize {
        self.handle.pending_jobs()
    }

    pub fn config(&self) -> &SchedulerConfig {
        self.handle.config()
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.handle.metrics()
    }

    /// Number of spawned fiber worker threads (the main thread not included).
    pub fn fiber_worker_count(&self) -> usize {
        self.fiber_workers.len()
    }

    pub fn io_worker_count(&self) -> usize {
        self.io_workers.len()
    }

    /// Stops accepting jobs, waits up to the configured timeout for in-flight
    /// jobs, joins every worker and releases all fiber stacks.
    pub fn shutdown(mut self) -> Result<(), SchedulerError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), SchedulerError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        let shared = &self.handle.shared;
        shared.accepting.store(false, Ordering::Release);

        let deadline = Instant::now() + Duration::from_millis(shared.config.shutdown_timeout_ms);
        let drained = || shared.in_flight.load(Ordering::Acquire) == 0 || Instant::now() >= deadline;
        if shared.is_main_worker_thread() && !worker::on_worker_thread() {
            worker::help_until(shared, drained);
        } else {
            while !drained() {
                thread::sleep(Duration::from_millis(1));
            }
        }
        let in_flight = shared.in_flight.load(Ordering::Acquire);

        shared.shutdown.store(true, Ordering::Release);
        let mut panicked = 0;
        for worker in self.fiber_workers.drain(..).chain(self.io_workers.drain(..)) {
            if worker.handle.join().is_err() {
                panicked += 1;
                tracing::error!(worker = %worker.name, "worker panicked during execution");
            }
        }

        if in_flight == 0 {
            let mut arena = shared.arena.lock();
            for pool in &shared.pools {
                pool.destroy(&mut arena);
            }
            arena.destroy();
            tracing::info!("scheduler stopped");
        } else {
            // Parked fibers still own their stacks; the memory is released
            // when the last handle drops.
            tracing::warn!(in_flight, "scheduler stopped with jobs still in flight");
        }

        if panicked > 0 {
            Err(SchedulerError::WorkerPanicked(panicked))
        } else if in_flight > 0 {
            Err(SchedulerError::ShutdownTimedOut { in_flight })
        } else {
            Ok(())
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::error!(error = %err, "scheduler shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Priority;
    use std::sync::atomic::AtomicUsize;

    fn small_config(workers: usize) -> SchedulerConfig {
        SchedulerConfig::default()
            .with_fiber_workers(workers)
            .with_io_workers(1)
            .with_pool(StackClass::Normal, 16, 64 * 1024)
            .with_pool(StackClass::Large, 2, 128 * 1024)
            .with_pool(StackClass::Gigantic, 0, 0)
            .with_pool(StackClass::ExternalLibrary, 0, 0)
            .with_max_counters(8)
    }

    #[test]
    fn test_scheduler_creation() {
        let scheduler = Scheduler::new(small_config(2)).expect("scheduler");
        assert_eq!(scheduler.fiber_worker_count(), 2);
        assert_eq!(scheduler.io_worker_count(), 1);
        assert_eq!(scheduler.pending_jobs(), 0);
        scheduler.shutdown().expect("Shutdown failed");
    }

    #[test]
    fn test_kick_runs_job() {
        let scheduler = Scheduler::new(small_config(2)).unwrap();
        let executed = Arc::new(AtomicUsize::new(0));
        let executed_clone = executed.clone();

        let counter = scheduler.generate_counter().unwrap();
        scheduler
            .kick(
                JobDescr::new(move || {
                    executed_clone.fetch_add(1, Ordering::SeqCst);
                })
                .with_counter(&counter),
            )
            .unwrap();

        scheduler.wait(&counter);
        assert_eq!(executed.load(Ordering::SeqCst), 1);
        scheduler.destroy_counter(counter);
        scheduler.shutdown().expect("Shutdown failed");
    }

    #[test]
    fn test_class_without_fibers_is_rejected() {
        let scheduler = Scheduler::new(small_config(1)).unwrap();
        let err = scheduler
            .kick(JobDescr::new(|| {}).with_stack_class(StackClass::Gigantic))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NoFibersForClass(StackClass::Gigantic)));
        scheduler.shutdown().unwrap();
    }

    #[test]
    fn test_counters_exhausted() {
        let scheduler = Scheduler::new(small_config(1)).unwrap();
        let counters: Vec<_> = (0..8).map(|_| scheduler.generate_counter().unwrap()).collect();
        let err = scheduler.generate_counter().unwrap_err();
        assert!(matches!(err, SchedulerError::CountersExhausted { capacity: 8 }));
        for counter in counters {
            scheduler.destroy_counter(counter);
        }
        assert_eq!(scheduler.handle().available_counters(), 8);
        scheduler.shutdown().unwrap();
    }

    #[test]
    fn test_queue_full_rolls_back_counter() {
        let config = small_config(1)
            .with_queue_capacity(1)
            .with_main_thread_worker(false);
        let scheduler = Scheduler::new(config).unwrap();

        // Park the only worker so nothing drains the queue.
        let gate = Arc::new(AtomicBool::new(false));
        let started = Arc::new(AtomicBool::new(false));
        let (g, s) = (gate.clone(), started.clone());
        scheduler
            .kick(JobDescr::new(move || {
                s.store(true, Ordering::SeqCst);
                while !g.load(Ordering::SeqCst) {
                    std::hint::spin_loop();
                }
            }))
            .unwrap();
        while !started.load(Ordering::SeqCst) {
            thread::yield_now();
        }

        let counter = scheduler.generate_counter().unwrap();
        scheduler
            .kick(JobDescr::new(|| {}).with_priority(Priority::Low).with_counter(&counter))
            .unwrap();
        let err = scheduler
            .kick(JobDescr::new(|| {}).with_priority(Priority::Low).with_counter(&counter))
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::QueueFull {
                lane: Lane::Compute,
                priority: Priority::Low
            }
        ));
        assert_eq!(counter.value(), 1);

        gate.store(true, Ordering::SeqCst);
        scheduler.wait(&counter);
        scheduler.destroy_counter(counter);
        scheduler.shutdown().unwrap();
    }

    #[test]
    fn test_kick_after_shutdown_started() {
        let scheduler = Scheduler::new(small_config(1)).unwrap();
        let handle = scheduler.handle();
        scheduler.shutdown().unwrap();
        let err = handle.kick(JobDescr::new(|| {})).unwrap_err();
        assert!(matches!(err, SchedulerError::ShuttingDown));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let err = Scheduler::new(SchedulerConfig::default().with_queue_capacity(0))
            .err()
            .unwrap();
        assert!(matches!(err, SchedulerError::Config(_)));
    }

    #[test]
    fn test_overflowing_pool_size_is_rejected() {
        let config = small_config(1).with_pool(StackClass::Normal, 2, usize::MAX / 2);
        let err = Scheduler::new(config).err().unwrap();
        assert!(matches!(err, SchedulerError::Config(_)));
    }
}
