use crate::error::StackArenaError;
use std::alloc::{Layout, alloc, dealloc};
use std::ptr::NonNull;

/// Alignment of the arena's backing block.
const ARENA_ALIGNMENT: usize = 4096;

struct Block {
    base: NonNull<u8>,
    layout: Layout,
    cursor: usize,
}

/// A bump allocator that is the sole source of fiber stack memory.
///
/// The arena is sized once for the whole fiber population, carved up while the
/// pools are built, and released in one piece at shutdown. Individual stacks
/// are never handed back: [`StackArena::deallocate`] is a no-op because every
/// fiber is created and destroyed together with the scheduler.
pub struct StackArena {
    block: Option<Block>,
}

impl StackArena {
    /// Creates an uninitialized arena. Call [`StackArena::initialize`] before
    /// allocating.
    pub const fn new() -> Self {
        StackArena { block: None }
    }

    /// Reserves `capacity` bytes of backing memory.
    ///
    /// # Panics
    ///
    /// Panics if the arena is already initialized.
    pub fn initialize(&mut self, capacity: usize) -> Result<(), StackArenaError> {
        assert!(self.block.is_none(), "stack arena initialized twice");

        let size = capacity.max(1);
        let layout = Layout::from_size_align(size, ARENA_ALIGNMENT).map_err(|_| {
            StackArenaError::InvalidLayout {
                size,
                align: ARENA_ALIGNMENT,
            }
        })?;

        // SAFETY: `layout` has a non-zero size.
        let ptr = unsafe { alloc(layout) };
        let base = NonNull::new(ptr).ok_or(StackArenaError::OutOfMemory { size })?;

        tracing::debug!(bytes = size, "stack arena initialized");
        self.block = Some(Block {
            base,
            layout,
            cursor: 0,
        });
        Ok(())
    }

    /// Carves `size` bytes aligned to `align` out of the arena.
    ///
    /// # Panics
    ///
    /// Panics if the arena is not initialized.
    pub fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, StackArenaError> {
        let block = self
            .block
            .as_mut()
            .expect("allocating from an uninitialized stack arena");
        if !align.is_power_of_two() {
            return Err(StackArenaError::InvalidLayout { size, align });
        }

        let capacity = block.layout.size();
        // SAFETY: `cursor <= capacity`, so the pointer stays within (or one past) the block.
        let current = unsafe { block.base.as_ptr().add(block.cursor) };
        let align_offset = current.align_offset(align);

        let new_cursor = block
            .cursor
            .checked_add(align_offset)
            .and_then(|c| c.checked_add(size))
            .filter(|&c| c <= capacity)
            .ok_or(StackArenaError::Exhausted {
                requested: size,
                remaining: capacity - block.cursor,
            })?;

        // SAFETY: `cursor + align_offset + size <= capacity`.
        let ptr = unsafe { block.base.as_ptr().add(block.cursor + align_offset) };
        block.cursor = new_cursor;
        Ok(NonNull::new(ptr).expect("arena pointer is never null"))
    }

    /// Returns a region to the arena. Intentionally a no-op.
    ///
    /// All fibers are created together at startup and destroyed together at
    /// shutdown, so the memory is reclaimed by [`StackArena::destroy`]. Call
    /// sites still go through this hook so that per-fiber teardown can be
    /// introduced without touching them.
    pub fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        if let Some(block) = &self.block {
            let start = block.base.as_ptr() as usize;
            let addr = ptr.as_ptr() as usize;
            debug_assert!(
                addr >= start && addr + size <= start + block.layout.size(),
                "deallocating memory that does not belong to the stack arena"
            );
        }
    }

    /// Releases the backing memory.
    ///
    /// # Panics
    ///
    /// Panics if the arena is not initialized.
    pub fn destroy(&mut self) {
        let block = self
            .block
            .take()
            .expect("destroying a stack arena that is not initialized");
        // SAFETY: `base` was allocated with exactly this layout.
        unsafe { dealloc(block.base.as_ptr(), block.layout) };
        tracing::debug!(bytes = block.layout.size(), "stack arena destroyed");
    }

    pub fn is_initialized(&self) -> bool {
        self.block.is_some()
    }

    /// Returns the number of bytes handed out so far (including padding).
    pub fn used_bytes(&self) -> usize {
        self.block.as_ref().map_or(0, |b| b.cursor)
    }

    /// Returns the total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.block.as_ref().map_or(0, |b| b.layout.size())
    }
}

impl Default for StackArena {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StackArena {
    fn drop(&mut self) {
        if self.block.is_some() {
            self.destroy();
        }
    }
}

// The arena owns its memory; it is only mutated during startup and shutdown.
unsafe impl Send for StackArena {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_is_aligned_and_bumps() {
        let mut arena = StackArena::new();
        arena.initialize(64 * 1024).unwrap();

        let a = arena.allocate(100, 16).unwrap();
        let b = arena.allocate(100, 16).unwrap();
        assert_eq!(a.as_ptr() as usize % 16, 0);
        assert_eq!(b.as_ptr() as usize % 16, 0);
        assert!(b.as_ptr() as usize >= a.as_ptr() as usize + 100);
        assert!(arena.used_bytes() >= 200);
        assert_eq!(arena.capacity(), 64 * 1024);
    }

    #[test]
    fn test_exhaustion_reports_remaining() {
        let mut arena = StackArena::new();
        arena.initialize(4096).unwrap();
        arena.allocate(4000, 16).unwrap();

        let err = arena.allocate(512, 16).unwrap_err();
        assert!(matches!(err, StackArenaError::Exhausted { requested: 512, .. }));
    }

    #[test]
    fn test_deallocate_is_noop() {
        let mut arena = StackArena::new();
        arena.initialize(4096).unwrap();
        let ptr = arena.allocate(1024, 16).unwrap();
        let used = arena.used_bytes();
        arena.deallocate(ptr, 1024);
        assert_eq!(arena.used_bytes(), used);
    }

    #[test]
    fn test_destroy_then_reinitialize() {
        let mut arena = StackArena::new();
        arena.initialize(4096).unwrap();
        arena.destroy();
        assert!(!arena.is_initialized());
        arena.initialize(8192).unwrap();
        assert_eq!(arena.capacity(), 8192);
    }

    #[test]
    #[should_panic(expected = "initialized twice")]
    fn test_double_initialize_panics() {
        let mut arena = StackArena::new();
        arena.initialize(4096).unwrap();
        let _ = arena.initialize(4096);
    }

    #[test]
    #[should_panic(expected = "not initialized")]
    fn test_destroy_uninitialized_panics() {
        let mut arena = StackArena::new();
        arena.destroy();
    }
}
