use crate::allocator::StackArena;
use crate::config::PoolConfig;
use crate::error::StackArenaError;
use crate::fiber::{Fiber, FiberHandle, FiberId};
use crate::job::{DebugLabel, StackClass};
use crate::poison::PoisonReport;
use crossbeam::queue::ArrayQueue;

/// A fixed set of fibers sharing one stack class.
///
/// Every fiber is created and given its stack at startup; the pool never
/// grows. Fiber objects are heap-allocated once and never move, since their
/// saved contexts hold their own addresses. Workers take an idle fiber with
/// [`FiberPool::acquire`] and hand it back with [`FiberPool::release`]; in
/// between, the holder has exclusive access.
pub struct FiberPool {
    class: StackClass,
    stack_size: usize,
    fibers: Vec<FiberHandle>,
    ids: Vec<FiberId>,
    idle: ArrayQueue<FiberHandle>,
}

// Fibers are only touched by whoever holds them.
unsafe impl Send for FiberPool {}
unsafe impl Sync for FiberPool {}

/// Point-in-time view of one pooled fiber.
#[derive(Debug, Clone)]
pub struct FiberSnapshot {
    pub id: FiberId,
    pub class: StackClass,
    pub capacity: usize,
    /// `None` while the fiber is bound to a job; its memory is not read then.
    pub idle: Option<IdleFiber>,
}

/// Details only readable from an idle fiber.
#[derive(Debug, Clone)]
pub struct IdleFiber {
    pub label: DebugLabel,
    pub poison: Option<PoisonReport>,
    pub high_water_mark: Option<usize>,
}

impl FiberSnapshot {
    pub fn is_busy(&self) -> bool {
        self.idle.is_none()
    }
}

impl FiberPool {
    /// Creates and initializes `config.count` fibers with stacks from `arena`.
    pub fn new(
        class: StackClass,
        config: &PoolConfig,
        poison: bool,
        arena: &mut StackArena,
    ) -> Result<Self, StackArenaError> {
        let mut pool = FiberPool {
            class,
            stack_size: config.stack_size,
            fibers: Vec::with_capacity(config.count),
            ids: Vec::with_capacity(config.count),
            idle: ArrayQueue::new(config.count.max(1)),
        };

        for _ in 0..config.count {
            let fiber = Box::new(Fiber::new(config.stack_size).with_poisoning(poison));
            let handle = FiberHandle::from_mut(Box::leak(fiber));
            pool.fibers.push(handle);
            // SAFETY: freshly leaked and owned by the pool.
            let fiber = unsafe { &mut *handle.as_ptr() };
            pool.ids.push(fiber.id());
            fiber.initialize(arena)?;
            // Cannot fail: the queue holds `count` entries.
            let _ = pool.idle.push(handle);
        }

        tracing::debug!(
            class = class.name(),
            count = config.count,
            stack_size = config.stack_size,
            "fiber pool created"
        );
        Ok(pool)
    }

    /// Takes an idle fiber, or `None` if all are in use.
    pub fn acquire(&self) -> Option<FiberHandle> {
        self.idle.pop()
    }

    /// Returns a detached fiber to the pool.
    ///
    /// # Panics
    ///
    /// Panics if the fiber is still attached (debug builds) or the pool is
    /// already full.
    pub fn release(&self, fiber: FiberHandle) {
        // SAFETY: the caller held the fiber exclusively until now.
        debug_assert!(
            unsafe { !(*fiber.as_ptr()).is_attached() },
            "returning an attached fiber to the {} pool",
            self.class.name()
        );
        if self.idle.push(fiber).is_err() {
            panic!("{} fiber pool released more fibers than it owns", self.class.name());
        }
    }

    pub fn class(&self) -> StackClass {
        self.class
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Total number of fibers.
    pub fn capacity(&self) -> usize {
        self.fibers.len()
    }

    /// Number of idle fibers.
    pub fn len(&self) -> usize {
        self.idle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idle.is_empty()
    }

    /// Inspects every fiber. Idle fibers are briefly taken out of the pool
    /// while they are read.
    pub fn snapshot(&self) -> Vec<FiberSnapshot> {
        let mut taken = Vec::with_capacity(self.idle.len());
        while let Some(handle) = self.idle.pop() {
            taken.push(handle);
        }

        let snapshots = self
            .fibers
            .iter()
            .zip(&self.ids)
            .map(|(handle, &id)| {
                let idle = taken.contains(handle).then(|| {
                    // SAFETY: taken out of the idle queue above, so no worker holds it.
                    let fiber = unsafe { &*handle.as_ptr() };
                    IdleFiber {
                        label: fiber.label(),
                        poison: fiber.poison_report(),
                        high_water_mark: fiber.stack_high_water_mark(),
                    }
                });
                FiberSnapshot {
                    id,
                    class: self.class,
                    capacity: self.stack_size,
                    idle,
                }
            })
            .collect();

        for handle in taken {
            self.release(handle);
        }
        snapshots
    }

    /// Returns every stack to `arena`.
    ///
    /// # Panics
    ///
    /// Panics if any fiber is still out of the pool.
    pub fn destroy(&self, arena: &mut StackArena) {
        assert_eq!(
            self.idle.len(),
            self.fibers.len(),
            "destroying the {} fiber pool while fibers are in use",
            self.class.name()
        );
        for handle in &self.fibers {
            // SAFETY: all fibers are idle.
            unsafe { (*handle.as_ptr()).destroy(arena) };
        }
    }
}

impl Drop for FiberPool {
    fn drop(&mut self) {
        for handle in self.fibers.drain(..) {
            // SAFETY: leaked in `new`; nothing runs on these fibers any more.
            drop(unsafe { Box::from_raw(handle.as_ptr()) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena_for(config: &PoolConfig) -> StackArena {
        let mut arena = StackArena::new();
        arena.initialize(config.arena_bytes()).unwrap();
        arena
    }

    #[test]
    fn test_pool_creation() {
        let config = PoolConfig::new(4, 32 * 1024);
        let mut arena = arena_for(&config);
        let pool = FiberPool::new(StackClass::Large, &config, false, &mut arena).unwrap();

        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.len(), 4);
        assert_eq!(pool.class(), StackClass::Large);
        assert_eq!(pool.stack_size(), 32 * 1024);
        pool.destroy(&mut arena);
    }

    #[test]
    fn test_acquire_until_exhausted_then_release() {
        let config = PoolConfig::new(2, 16 * 1024);
        let mut arena = arena_for(&config);
        let pool = FiberPool::new(StackClass::Normal, &config, false, &mut arena).unwrap();

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a, b);
        assert!(pool.acquire().is_none());
        assert!(pool.is_empty());

        pool.release(a);
        assert_eq!(pool.acquire(), Some(a));
        pool.release(a);
        pool.release(b);
        pool.destroy(&mut arena);
    }

    #[test]
    fn test_arena_too_small() {
        let config = PoolConfig::new(4, 64 * 1024);
        let mut arena = StackArena::new();
        arena.initialize(Fiber::allocation_size(64 * 1024)).unwrap();
        let err = FiberPool::new(StackClass::Normal, &config, false, &mut arena)
            .err()
            .unwrap();
        assert!(matches!(err, StackArenaError::Exhausted { .. }));
    }

    #[test]
    fn test_snapshot_marks_busy_fibers() {
        let config = PoolConfig::new(3, 16 * 1024);
        let mut arena = arena_for(&config);
        let pool = FiberPool::new(StackClass::Normal, &config, true, &mut arena).unwrap();

        let busy = pool.acquire().unwrap();
        let busy_id = unsafe { (*busy.as_ptr()).id() };
        let snapshots = pool.snapshot();
        assert_eq!(snapshots.len(), 3);
        assert_eq!(pool.len(), 2, "snapshot must hand idle fibers back");

        for snap in &snapshots {
            assert_eq!(snap.capacity, 16 * 1024);
            if snap.id == busy_id {
                assert!(snap.is_busy());
            } else {
                let idle = snap.idle.as_ref().unwrap();
                assert_eq!(idle.label, DebugLabel::DETACHED);
                let report = idle.poison.as_ref().unwrap();
                assert!(report.is_clean());
                assert_eq!(report.last_id, Some(snap.id.0));
            }
        }

        pool.release(busy);
        pool.destroy(&mut arena);
    }

    #[test]
    #[should_panic(expected = "while fibers are in use")]
    fn test_destroy_with_busy_fiber_panics() {
        let config = PoolConfig::new(1, 16 * 1024);
        let mut arena = arena_for(&config);
        let pool = FiberPool::new(StackClass::Normal, &config, false, &mut arena).unwrap();
        let _busy = pool.acquire().unwrap();
        pool.destroy(&mut arena);
    }
}
