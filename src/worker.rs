//! Worker thread implementation.
//!
//! Worker threads continuously pull work for their lane and run it on pooled
//! fibers. Woken fibers come first, then jobs that found their fiber pool
//! empty earlier, then new jobs in priority order.
//!
//! Control always returns to the worker's own stack between fibers. A fiber
//! that finishes or parks leaves a [`Signal`] for the worker and switches
//! back; the worker then recycles or parks it. Nothing touches a fiber's
//! bookkeeping while code is still running on that fiber's stack.

use crate::config::PinningStrategy;
use crate::counter::{Counter, FiberWaker, ParkedFiber};
use crate::fiber::{Fiber, FiberHandle};
use crate::job::{DebugLabel, JobDescr, Lane, StackClass};
use crate::scheduler::Shared;
use crossbeam::utils::Backoff;
use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const IDLE_SLEEP: Duration = Duration::from_micros(50);

/// Reason a fiber switched back to its worker.
enum Signal {
    None,
    Completed(*mut JobRecord),
    Park(Counter),
}

/// Scheduler-side state of a running job, carried as the fiber's end
/// callback data.
struct JobRecord {
    class: StackClass,
    counter: Option<Counter>,
}

thread_local! {
    static CURRENT_WORKER: Cell<*const WorkerContext> = const { Cell::new(std::ptr::null()) };
}

// Same rule as the current fiber: re-read after every switch.
#[inline(never)]
fn current_worker() -> Option<*const WorkerContext> {
    let ptr = CURRENT_WORKER.get();
    (!ptr.is_null()).then_some(ptr)
}

#[inline(never)]
fn set_current_worker(ptr: *const WorkerContext) -> *const WorkerContext {
    CURRENT_WORKER.replace(ptr)
}

/// True when the calling thread is currently acting as a worker.
pub(crate) fn on_worker_thread() -> bool {
    current_worker().is_some()
}

/// Per-thread state of a worker.
pub(crate) struct WorkerContext {
    name: String,
    lane: Lane,
    shared: Arc<Shared>,
    thread_fiber: *mut Fiber,
    signal: Cell<Signal>,
}

impl WorkerContext {
    pub(crate) fn new(name: String, lane: Lane, shared: Arc<Shared>) -> Self {
        let declared = shared.config.worker_stack_size;
        WorkerContext {
            name,
            lane,
            shared,
            thread_fiber: Box::into_raw(Box::new(Fiber::thread_fiber(declared))),
            signal: Cell::new(Signal::None),
        }
    }

    /// Runs until the scheduler shuts down.
    pub(crate) fn run(&self) {
        let previous = set_current_worker(self);
        tracing::debug!(worker = %self.name, lane = %self.lane, "worker started");

        let backoff = Backoff::new();
        while !self.shared.shutdown.load(Ordering::Acquire) {
            if self.run_once() {
                backoff.reset();
            } else {
                idle(&backoff);
            }
        }

        set_current_worker(previous);
        tracing::debug!(worker = %self.name, "worker stopped");
    }

    /// Runs work on the calling thread until `done` returns true.
    pub(crate) fn run_until(&self, mut done: impl FnMut() -> bool) {
        let previous = set_current_worker(self);
        let backoff = Backoff::new();
        while !done() {
            if self.run_once() {
                backoff.reset();
            } else {
                idle(&backoff);
            }
        }
        set_current_worker(previous);
    }

    /// Performs one scheduling step. Returns false when there was nothing to
    /// do.
    fn run_once(&self) -> bool {
        let shared = &*self.shared;

        if let Some(parked) = shared.ready.pop(self.lane) {
            #[cfg(feature = "metrics")]
            shared.metrics.fibers_resumed.fetch_add(1, Ordering::Relaxed);
            self.switch_to(parked.fiber);
            return true;
        }

        if let Some(job) = shared.stalled.pop(self.lane) {
            match shared.pool(job.stack_class).acquire() {
                Some(fiber) => {
                    self.start(job, fiber);
                    return true;
                }
                None => shared.stalled.push(self.lane, job),
            }
        }

        let Some(job) = shared.queues.pop(self.lane) else {
            return false;
        };
        match shared.pool(job.stack_class).acquire() {
            Some(fiber) => self.start(job, fiber),
            None => {
                if shared.stalled.is_empty(self.lane) {
                    tracing::warn!(
                        worker = %self.name,
                        class = job.stack_class.name(),
                        "fiber pool exhausted, holding jobs until a fiber is recycled"
                    );
                }
                #[cfg(feature = "metrics")]
                shared.metrics.pool_stalls.fetch_add(1, Ordering::Relaxed);
                shared.stalled.push(self.lane, job);
            }
        }
        true
    }

    fn start(&self, job: JobDescr, fiber: FiberHandle) {
        let label = if job.label.is_empty() {
            DebugLabel::new("job")
        } else {
            job.label
        };
        let record = Box::new(JobRecord {
            class: job.stack_class,
            counter: job.counter,
        });
        let (entry, params) = job.work.into_entry();

        // SAFETY: acquired from the pool, so this worker holds it exclusively.
        unsafe {
            (*fiber.as_ptr()).attach(
                entry,
                params,
                Some(on_job_finished),
                Box::into_raw(record).cast(),
                label,
            );
        }
        self.switch_to(fiber);
    }

    fn switch_to(&self, fiber: FiberHandle) {
        // SAFETY: the thread fiber is live for the lifetime of `self`, and the
        // target is either freshly attached or parked and handed to us by the
        // ready queue.
        unsafe { Fiber::switch(self.thread_fiber, fiber.as_ptr()) };

        match self.signal.replace(Signal::None) {
            Signal::Completed(record) => self.finish(fiber, record),
            Signal::Park(counter) => self.park(fiber, counter),
            Signal::None => {
                // SAFETY: the fiber is suspended.
                let id = unsafe { (*fiber.as_ptr()).id() };
                panic!("{id} switched back to {} without a reason", self.name);
            }
        }
    }

    fn finish(&self, fiber: FiberHandle, record: *mut JobRecord) {
        // SAFETY: produced by `start` and handed back exactly once.
        let record = unsafe { Box::from_raw(record) };
        // SAFETY: the fiber is suspended in its trampoline.
        unsafe { (*fiber.as_ptr()).detach() };
        self.shared.pool(record.class).release(fiber);

        #[cfg(feature = "metrics")]
        self.shared
            .metrics
            .jobs_completed
            .fetch_add(1, Ordering::Relaxed);

        self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
        if let Some(counter) = record.counter {
            counter.decrement(&self.shared.ready);
        }
    }

    fn park(&self, fiber: FiberHandle, counter: Counter) {
        let parked = ParkedFiber {
            fiber,
            lane: self.lane,
        };
        #[cfg(feature = "metrics")]
        self.shared
            .metrics
            .fibers_parked
            .fetch_add(1, Ordering::Relaxed);
        if !counter.park(parked) {
            self.shared.ready.wake(parked);
        }
    }
}

impl Drop for WorkerContext {
    fn drop(&mut self) {
        // SAFETY: allocated in `new`; the worker loop has returned.
        drop(unsafe { Box::from_raw(self.thread_fiber) });
    }
}

fn idle(backoff: &Backoff) {
    if backoff.is_completed() {
        thread::sleep(IDLE_SLEEP);
    } else {
        backoff.snooze();
    }
}

/// End callback of every job fiber. Runs on the fiber's stack.
fn on_job_finished(_fiber: FiberHandle, data: *mut ()) {
    let worker = current_worker().expect("job finished outside of a worker thread");
    // SAFETY: the worker outlives every fiber it switches into.
    unsafe { (*worker).signal.set(Signal::Completed(data.cast())) };
}

/// Parks the running fiber until `counter` drains, letting its worker run
/// other work in the meantime.
///
/// # Panics
///
/// Panics when called from a fiber that was not started by a worker.
pub(crate) fn park_current(fiber: FiberHandle, counter: &Counter) {
    while !counter.is_complete() {
        let worker = current_worker().expect("waiting inside a fiber that has no worker");
        // SAFETY: the worker outlives this switch; the pointer is not used
        // after resuming, which may happen on another thread.
        unsafe {
            (*worker).signal.set(Signal::Park(counter.clone()));
            Fiber::suspend(fiber.as_ptr());
        }
    }
}

/// Join handle of a spawned worker.
pub(crate) struct WorkerThread {
    pub(crate) name: String,
    pub(crate) handle: JoinHandle<()>,
}

/// Spawns `count` workers for `lane`.
pub(crate) fn spawn_workers(
    lane: Lane,
    count: usize,
    shared: &Arc<Shared>,
) -> std::io::Result<Vec<WorkerThread>> {
    let pinning = shared.config.pinning;
    let core_ids = match (lane, pinning) {
        (Lane::Compute, PinningStrategy::Linear) => core_affinity::get_core_ids().unwrap_or_default(),
        _ => Vec::new(),
    };

    (0..count)
        .map(|index| {
            let name = format!("{lane}-worker-{index}");
            let shared = Arc::clone(shared);
            let core = core_ids.get(index).copied();
            let thread_name = name.clone();
            let handle = thread::Builder::new()
                .name(name.clone())
                .stack_size(shared.config.worker_stack_size)
                .spawn(move || {
                    if let Some(core) = core
                        && !core_affinity::set_for_current(core)
                    {
                        tracing::warn!(worker = %thread_name, core = core.id, "failed to pin worker");
                    }
                    WorkerContext::new(thread_name, lane, shared).run();
                })?;
            Ok(WorkerThread { name, handle })
        })
        .collect()
}

/// Runs the worker loop on the calling thread, as a compute worker, until
/// `done` returns true.
pub(crate) fn help_until(shared: &Arc<Shared>, done: impl FnMut() -> bool) {
    let context = WorkerContext::new("main".to_string(), Lane::Compute, Arc::clone(shared));
    context.run_until(done);
}
