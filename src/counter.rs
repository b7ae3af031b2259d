//! Counter-based synchronization primitives for job completion tracking.
//!
//! A counter holds the number of jobs still pending against it and the set of
//! fibers parked until that number reaches zero. Kicking a job with a counter
//! increments it; the job's completion decrements it exactly once, as the last
//! effect of the job. The decrement that reaches zero wakes every parked
//! waiter.

use crate::fiber::FiberHandle;
use crate::job::Lane;
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A fiber waiting on a counter, with the lane whose workers must resume it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParkedFiber {
    pub fiber: FiberHandle,
    pub lane: Lane,
}

/// Receives fibers whose counter drained to zero.
pub trait FiberWaker {
    fn wake(&self, parked: ParkedFiber);
}

impl FiberWaker for crossbeam::deque::Injector<ParkedFiber> {
    fn wake(&self, parked: ParkedFiber) {
        self.push(parked);
    }
}

struct InnerCounter {
    value: AtomicUsize,
    waiters: Mutex<Vec<ParkedFiber>>,
    /// Set while a pooled counter is handed out.
    in_use: AtomicBool,
    pooled: bool,
}

impl InnerCounter {
    fn new(initial: usize, pooled: bool) -> Self {
        InnerCounter {
            value: AtomicUsize::new(initial),
            waiters: Mutex::new(Vec::new()),
            in_use: AtomicBool::new(!pooled),
            pooled,
        }
    }
}

/// A thread-safe counter for tracking job completion.
///
/// Clones share the same count. Counters used with a scheduler normally come
/// from [`Scheduler::generate_counter`](crate::Scheduler::generate_counter)
/// and go back through
/// [`Scheduler::destroy_counter`](crate::Scheduler::destroy_counter).
#[derive(Clone)]
pub struct Counter {
    inner: Arc<InnerCounter>,
}

impl Counter {
    /// Creates a standalone counter with the specified initial value.
    pub fn new(initial: usize) -> Self {
        Counter {
            inner: Arc::new(InnerCounter::new(initial, false)),
        }
    }

    /// Increments the pending count by one.
    pub fn increment(&self) {
        self.add(1);
    }

    /// Increments the pending count by `n`.
    pub fn add(&self, n: usize) {
        self.inner.value.fetch_add(n, Ordering::AcqRel);
    }

    /// Decrements the pending count and, if it reached zero, hands every
    /// parked waiter to `waker`.
    ///
    /// Returns true if the counter reached zero.
    ///
    /// # Panics
    ///
    /// Panics if the count is already zero.
    pub fn decrement<W: FiberWaker + ?Sized>(&self, waker: &W) -> bool {
        // Release publishes the job's effects to whoever observes zero.
        let old = self.inner.value.fetch_sub(1, Ordering::AcqRel);
        assert!(old > 0, "counter decremented below zero");
        if old != 1 {
            return false;
        }

        let woken = std::mem::take(&mut *self.inner.waiters.lock());
        for parked in woken {
            waker.wake(parked);
        }
        true
    }

    /// Registers `parked` as a waiter unless the count is already zero.
    ///
    /// Returns false when the counter had drained; the caller then resumes the
    /// fiber itself. The check and the registration happen under the waiter
    /// lock, so a concurrent decrement to zero either sees the waiter or the
    /// caller sees zero.
    pub fn park(&self, parked: ParkedFiber) -> bool {
        let mut waiters = self.inner.waiters.lock();
        if self.inner.value.load(Ordering::Acquire) == 0 {
            return false;
        }
        waiters.push(parked);
        true
    }

    /// Returns the current pending count.
    pub fn value(&self) -> usize {
        self.inner.value.load(Ordering::Acquire)
    }

    /// Checks if the counter has reached zero.
    pub fn is_complete(&self) -> bool {
        self.value() == 0
    }

    /// Number of fibers currently parked on this counter.
    pub fn waiter_count(&self) -> usize {
        self.inner.waiters.lock().len()
    }

    /// True when both values refer to the same counter.
    pub fn ptr_eq(&self, other: &Counter) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn is_pooled(&self) -> bool {
        self.inner.pooled
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Counter")
            .field("value", &self.value())
            .field("pooled", &self.inner.pooled)
            .finish()
    }
}

/// Fixed set of reusable counters.
pub(crate) struct CounterPool {
    free: ArrayQueue<Arc<InnerCounter>>,
    capacity: usize,
}

impl CounterPool {
    pub(crate) fn new(capacity: usize) -> Self {
        let free = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            // Cannot fail: exactly `capacity` pushes into a queue of that size.
            let _ = free.push(Arc::new(InnerCounter::new(0, true)));
        }
        CounterPool { free, capacity }
    }

    /// Takes a zeroed counter from the pool.
    pub(crate) fn acquire(&self) -> Option<Counter> {
        let inner = self.free.pop()?;
        inner.in_use.store(true, Ordering::Release);
        Some(Counter { inner })
    }

    /// Returns a counter to the pool.
    ///
    /// # Panics
    ///
    /// Panics if jobs are still pending, fibers are still parked on it, or it
    /// was already released.
    pub(crate) fn release(&self, counter: Counter) {
        let pending = counter.value();
        assert_eq!(pending, 0, "destroying a counter with {pending} pending job(s)");
        let waiters = counter.waiter_count();
        assert_eq!(waiters, 0, "destroying a counter with {waiters} parked fiber(s)");

        if !counter.inner.pooled {
            return;
        }
        assert!(
            counter.inner.in_use.swap(false, Ordering::AcqRel),
            "counter destroyed twice"
        );
        if self.free.push(counter.inner).is_err() {
            // More releases than acquires; only reachable through a counter
            // from another scheduler's pool.
            panic!("counter does not belong to this scheduler");
        }
    }

    pub(crate) fn available(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::Fiber;
    use crossbeam::deque::{Injector, Steal};

    fn parked(fiber: &mut Fiber, lane: Lane) -> ParkedFiber {
        ParkedFiber {
            fiber: FiberHandle::from_mut(fiber),
            lane,
        }
    }

    fn drain(injector: &Injector<ParkedFiber>) -> Vec<ParkedFiber> {
        let mut out = Vec::new();
        while let Steal::Success(p) = injector.steal() {
            out.push(p);
        }
        out
    }

    #[test]
    fn test_counter_basic() {
        let counter = Counter::new(5);
        assert_eq!(counter.value(), 5);
        assert!(!counter.is_complete());

        let injector = Injector::new();
        assert!(!counter.decrement(&injector));
        assert_eq!(counter.value(), 4);

        counter.increment();
        assert_eq!(counter.value(), 5);
        counter.add(3);
        assert_eq!(counter.value(), 8);
    }

    #[test]
    fn test_counter_completion_wakes_all_waiters() {
        let mut a = Fiber::thread_fiber(0);
        let mut b = Fiber::thread_fiber(0);
        let counter = Counter::new(2);
        let injector = Injector::new();

        assert!(counter.park(parked(&mut a, Lane::Compute)));
        assert!(counter.park(parked(&mut b, Lane::Io)));
        assert_eq!(counter.waiter_count(), 2);

        assert!(!counter.decrement(&injector));
        assert!(drain(&injector).is_empty());

        assert!(counter.decrement(&injector));
        let woken = drain(&injector);
        assert_eq!(woken.len(), 2);
        assert_eq!(woken[1].lane, Lane::Io);
        assert_eq!(counter.waiter_count(), 0);
    }

    #[test]
    fn test_park_refused_when_complete() {
        let mut a = Fiber::thread_fiber(0);
        let counter = Counter::new(0);
        assert!(!counter.park(parked(&mut a, Lane::Compute)));
        assert_eq!(counter.waiter_count(), 0);
    }

    #[test]
    #[should_panic(expected = "below zero")]
    fn test_decrement_below_zero_panics() {
        let counter = Counter::new(0);
        counter.decrement(&Injector::new());
    }

    #[test]
    fn test_pool_acquire_release() {
        let pool = CounterPool::new(2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert!(a.is_pooled());
        assert!(!a.ptr_eq(&b));

        pool.release(a);
        assert_eq!(pool.available(), 1);
        let c = pool.acquire().unwrap();
        assert!(c.is_complete());
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.available(), pool.capacity());
    }

    #[test]
    #[should_panic(expected = "pending job")]
    fn test_release_pending_counter_panics() {
        let pool = CounterPool::new(1);
        let counter = pool.acquire().unwrap();
        counter.increment();
        pool.release(counter);
    }

    #[test]
    #[should_panic(expected = "destroyed twice")]
    fn test_double_release_panics() {
        let pool = CounterPool::new(1);
        let counter = pool.acquire().unwrap();
        pool.release(counter.clone());
        pool.release(counter);
    }
}
