//! Job queues.
//!
//! Each lane (compute, I/O) has one bounded FIFO per priority. Consumers
//! always drain `High`, then `Normal`, then `Low`. Fibers woken by a counter go
//! to a separate unbounded ready queue per lane, which workers check before
//! taking new jobs. Jobs whose fiber pool was empty when popped wait in
//! stalled queues, again one per priority, that are retried before new jobs.

use crate::counter::{FiberWaker, ParkedFiber};
use crate::job::{JobDescr, Lane, Priority};
use crossbeam::deque::{Injector, Steal};
use crossbeam::queue::ArrayQueue;

pub(crate) struct JobQueues {
    // Indexed by `Lane::index()`, then `Priority::index()`.
    lanes: Vec<Vec<ArrayQueue<JobDescr>>>,
    capacity: usize,
}

impl JobQueues {
    pub(crate) fn new(capacity: usize) -> Self {
        let lanes = (0..Lane::COUNT)
            .map(|_| {
                (0..Priority::COUNT)
                    .map(|_| ArrayQueue::new(capacity))
                    .collect()
            })
            .collect();
        JobQueues { lanes, capacity }
    }

    /// Enqueues `descr` at its priority. Hands it back when that queue is full.
    pub(crate) fn push(&self, lane: Lane, descr: JobDescr) -> Result<(), JobDescr> {
        self.lanes[lane.index()][descr.priority.index()].push(descr)
    }

    /// Pops the oldest job of the highest non-empty priority.
    pub(crate) fn pop(&self, lane: Lane) -> Option<JobDescr> {
        self.lanes[lane.index()].iter().find_map(ArrayQueue::pop)
    }

    pub(crate) fn len(&self, lane: Lane) -> usize {
        self.lanes[lane.index()].iter().map(ArrayQueue::len).sum()
    }

    pub(crate) fn len_at(&self, lane: Lane, priority: Priority) -> usize {
        self.lanes[lane.index()][priority.index()].len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Fibers ready to resume, one injector per lane.
pub(crate) struct ReadyFibers {
    lanes: [Injector<ParkedFiber>; Lane::COUNT],
}

impl ReadyFibers {
    pub(crate) fn new() -> Self {
        ReadyFibers {
            lanes: [Injector::new(), Injector::new()],
        }
    }

    pub(crate) fn pop(&self, lane: Lane) -> Option<ParkedFiber> {
        steal(&self.lanes[lane.index()])
    }

    pub(crate) fn is_empty(&self, lane: Lane) -> bool {
        self.lanes[lane.index()].is_empty()
    }
}

/// Jobs popped while their fiber pool was empty, one injector per lane and
/// priority. Retried in the same priority order as new jobs.
pub(crate) struct StalledJobs {
    // Indexed by `Lane::index()`, then `Priority::index()`.
    lanes: Vec<Vec<Injector<JobDescr>>>,
}

impl StalledJobs {
    pub(crate) fn new() -> Self {
        let lanes = (0..Lane::COUNT)
            .map(|_| (0..Priority::COUNT).map(|_| Injector::new()).collect())
            .collect();
        StalledJobs { lanes }
    }

    pub(crate) fn push(&self, lane: Lane, descr: JobDescr) {
        self.lanes[lane.index()][descr.priority.index()].push(descr);
    }

    pub(crate) fn pop(&self, lane: Lane) -> Option<JobDescr> {
        self.lanes[lane.index()].iter().find_map(steal)
    }

    pub(crate) fn is_empty(&self, lane: Lane) -> bool {
        self.lanes[lane.index()].iter().all(Injector::is_empty)
    }

    pub(crate) fn len(&self) -> usize {
        self.lanes.iter().flatten().map(Injector::len).sum()
    }
}

fn steal<T>(injector: &Injector<T>) -> Option<T> {
    loop {
        match injector.steal() {
            Steal::Success(item) => return Some(item),
            Steal::Empty => return None,
            Steal::Retry => continue,
        }
    }
}

impl FiberWaker for ReadyFibers {
    fn wake(&self, parked: ParkedFiber) {
        self.lanes[parked.lane.index()].push(parked);
    }
}
