//! Fiber management and execution context.
//!
//! A fiber is a saved register context plus a fixed-capacity stack carved from
//! the [`StackArena`]. A pooled fiber is initialized once, then repeatedly
//! attached to a job, switched into, and detached when the job returns. The
//! stack is never freed or moved in between: the trampoline simply loops and
//! picks up the next attached job.
//!
//! Each worker thread also owns a *thread fiber* that stands for the thread's
//! native stack. It is only ever used as a place to save the worker's
//! registers while a pooled fiber runs.

use crate::allocator::StackArena;
use crate::context::{self, CALL_FRAME_OFFSET, RED_ZONE, Registers, STACK_ALIGNMENT};
use crate::error::StackArenaError;
use crate::job::{DebugLabel, EntryPoint, ParamHandle};
use crate::poison::{self, PoisonReport};

use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

/// Slack kept below the declared capacity so that a detected overflow lands in
/// memory owned by the same fiber instead of its neighbour in the arena.
pub const STACK_GUARD_BAND: usize = 16 * 1024;

// Bytes below a suspended fiber's stack pointer left alone when re-poisoning.
const REPOISON_MARGIN: usize = 256;

/// Unique identifier for a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(pub u64);

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

impl FiberId {
    pub fn next() -> Self {
        FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber({})", self.0)
    }
}

/// Raw handle to a fiber owned elsewhere (a pool or a worker).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FiberHandle(NonNull<Fiber>);

unsafe impl Send for FiberHandle {}
unsafe impl Sync for FiberHandle {}

impl FiberHandle {
    pub fn from_ptr(ptr: *mut Fiber) -> Option<Self> {
        NonNull::new(ptr).map(FiberHandle)
    }

    pub(crate) fn from_mut(fiber: &mut Fiber) -> Self {
        FiberHandle(NonNull::from(fiber))
    }

    pub fn as_ptr(self) -> *mut Fiber {
        self.0.as_ptr()
    }
}

/// Called on the fiber's own stack after its entry point returns.
pub type EndCallback = fn(FiberHandle, *mut ());

#[derive(Clone, Copy)]
struct Binding {
    entry: EntryPoint,
    params: ParamHandle,
    end_callback: Option<EndCallback>,
    end_data: *mut (),
}

#[derive(Clone, Copy)]
struct StackRegion {
    allocation: NonNull<u8>,
    allocation_size: usize,
    // Lowest address of the declared capacity.
    base: usize,
    top: usize,
}

enum FiberStack {
    /// The native stack of an OS thread; not owned, not accounted.
    Thread { declared: usize },
    Owned {
        capacity: usize,
        region: Option<StackRegion>,
    },
}

thread_local! {
    static CURRENT_FIBER: Cell<Option<FiberHandle>> = const { Cell::new(None) };
}

// Fibers migrate between threads, so thread-local addresses must not be cached
// across a context switch. Every access goes through a non-inlined call.
#[inline(never)]
pub fn current() -> Option<FiberHandle> {
    CURRENT_FIBER.get()
}

#[inline(never)]
fn set_current(fiber: Option<FiberHandle>) {
    CURRENT_FIBER.set(fiber);
}

#[inline(never)]
fn stack_marker() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker) as *const u8 as usize
}

/// A user-space execution context with its own stack.
pub struct Fiber {
    id: FiberId,
    stack: FiberStack,
    registers: Registers,
    /// The fiber that switched into this one; control returns there on suspend.
    resumer: *mut Fiber,
    binding: Option<Binding>,
    label: DebugLabel,
    poison: bool,
}

unsafe impl Send for Fiber {}

impl Fiber {
    /// Creates a fiber that will own a stack of `capacity` bytes once
    /// [`Fiber::initialize`] is called.
    pub fn new(capacity: usize) -> Self {
        Fiber {
            id: FiberId::next(),
            stack: FiberStack::Owned {
                capacity,
                region: None,
            },
            registers: Registers::default(),
            resumer: std::ptr::null_mut(),
            binding: None,
            label: DebugLabel::DETACHED,
            poison: cfg!(debug_assertions),
        }
    }

    /// Creates the fiber standing for the calling OS thread's native stack.
    /// `declared` is the size the thread was spawned with.
    pub fn thread_fiber(declared: usize) -> Self {
        Fiber {
            id: FiberId::next(),
            stack: FiberStack::Thread { declared },
            registers: Registers::default(),
            resumer: std::ptr::null_mut(),
            binding: None,
            label: DebugLabel::new("thread"),
            poison: false,
        }
    }

    /// Enables or disables stack poisoning. Takes effect at initialize/detach.
    pub fn with_poisoning(mut self, poison: bool) -> Self {
        self.poison = poison && !self.is_thread_fiber();
        self
    }

    /// Bytes reserved from the arena for a fiber of `capacity`. Saturates at
    /// `usize::MAX`, which no arena can satisfy.
    pub fn allocation_size(capacity: usize) -> usize {
        Self::checked_allocation_size(capacity).unwrap_or(usize::MAX)
    }

    /// Like [`Fiber::allocation_size`], `None` on overflow.
    pub fn checked_allocation_size(capacity: usize) -> Option<usize> {
        capacity
            .checked_add(RED_ZONE + STACK_GUARD_BAND + CALL_FRAME_OFFSET)?
            .checked_next_multiple_of(STACK_ALIGNMENT)
    }

    /// Allocates the stack from `arena` and primes the context.
    ///
    /// # Panics
    ///
    /// Panics on a thread fiber or when called twice.
    pub fn initialize(&mut self, arena: &mut StackArena) -> Result<(), StackArenaError> {
        let id = self.id;
        let FiberStack::Owned { capacity, region } = &mut self.stack else {
            panic!("{id} wraps a thread stack and cannot be initialized");
        };
        assert!(region.is_none(), "{id} initialized twice");

        let capacity = *capacity;
        let allocation_size = Self::allocation_size(capacity);
        let allocation = arena.allocate(allocation_size, STACK_ALIGNMENT)?;

        // SAFETY: the allocation is `allocation_size` bytes long.
        let top = unsafe { context::prepare_stack_top(allocation.as_ptr().add(allocation_size)) };
        *region = Some(StackRegion {
            allocation,
            allocation_size,
            base: top - capacity,
            top,
        });

        if self.poison {
            self.poison_below(top);
        }
        self.reset();
        Ok(())
    }

    /// Points the saved context at the trampoline with a clean stack, as if
    /// `fiber_trampoline(self)` were about to be called.
    ///
    /// The fiber must not move afterwards: the context stores its address.
    pub fn reset(&mut self) {
        let top = self.region().top;
        let this = self as *mut Fiber as usize;
        self.registers = Registers::prepare(top, fiber_trampoline as usize, this);
    }

    /// Binds a job. The stack and saved registers are left untouched.
    pub fn attach(
        &mut self,
        entry: EntryPoint,
        params: ParamHandle,
        end_callback: Option<EndCallback>,
        end_data: *mut (),
        label: DebugLabel,
    ) {
        debug_assert!(self.binding.is_none(), "{} attached twice", self.id);
        self.binding = Some(Binding {
            entry,
            params,
            end_callback,
            end_data,
        });
        self.label = label;
    }

    /// Clears the job binding so the fiber can go back to its pool.
    pub fn detach(&mut self) {
        self.binding = None;
        self.label = DebugLabel::DETACHED;
        if self.poison {
            let sp = self.registers.stack_pointer();
            self.poison_below(sp.saturating_sub(REPOISON_MARGIN));
        }
    }

    /// Returns the stack to `arena`.
    pub fn destroy(&mut self, arena: &mut StackArena) {
        let FiberStack::Owned { region, .. } = &mut self.stack else {
            panic!("{} wraps a thread stack and cannot be destroyed", self.id);
        };
        if let Some(region) = region.take() {
            arena.deallocate(region.allocation, region.allocation_size);
        }
        self.binding = None;
        self.registers = Registers::default();
    }

    /// Switches from `from` into `to`. Returns once something switches back
    /// into `from`.
    ///
    /// # Safety
    ///
    /// Both fibers must be alive for as long as either context may run, `from`
    /// must be the context currently executing on this thread, and `to` must be
    /// suspended (or freshly reset) and attached if it is a pooled fiber.
    pub unsafe fn switch(from: *mut Fiber, to: *mut Fiber) {
        unsafe {
            (*to).resumer = from;
            let next = if (*to).is_thread_fiber() {
                None
            } else {
                FiberHandle::from_ptr(to)
            };
            set_current(next);
            context::switch(&raw mut (*from).registers, &raw const (*to).registers);
        }
    }

    /// Suspends `fiber` and returns control to whoever switched into it.
    ///
    /// # Safety
    ///
    /// `fiber` must be the fiber currently running on this thread.
    pub unsafe fn suspend(fiber: *mut Fiber) {
        unsafe {
            let resumer = (*fiber).resumer;
            assert!(!resumer.is_null(), "{} suspended without a resumer", (*fiber).id);
            Fiber::switch(fiber, resumer);
        }
    }

    /// The trampoline body: runs the attached job, then its end callback.
    unsafe fn run(this: *mut Fiber) {
        let (binding, id, label) = unsafe { ((*this).binding, (*this).id, (*this).label) };
        let Some(binding) = binding else {
            tracing::error!(fiber = %id, "fiber resumed without an attached entry point");
            std::process::abort();
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| (binding.entry)(binding.params)));
        if let Err(payload) = result {
            let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                *s
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.as_str()
            } else {
                "unknown panic"
            };
            tracing::error!(fiber = %id, label = %label, "job panicked: {msg}");
        }

        if let Some(end_callback) = binding.end_callback {
            let handle = FiberHandle(unsafe { NonNull::new_unchecked(this) });
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                end_callback(handle, binding.end_data)
            }));
            if result.is_err() {
                tracing::error!(fiber = %id, "end callback panicked");
                std::process::abort();
            }
        }
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn label(&self) -> DebugLabel {
        self.label
    }

    pub fn is_thread_fiber(&self) -> bool {
        matches!(self.stack, FiberStack::Thread { .. })
    }

    pub fn is_attached(&self) -> bool {
        self.binding.is_some()
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.stack, FiberStack::Owned { region: Some(_), .. })
    }

    /// Declared stack capacity in bytes.
    pub fn capacity(&self) -> usize {
        match self.stack {
            FiberStack::Thread { declared } => declared,
            FiberStack::Owned { capacity, .. } => capacity,
        }
    }

    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    fn region(&self) -> StackRegion {
        match self.stack {
            FiberStack::Owned {
                region: Some(region),
                ..
            } => region,
            _ => panic!("{} has no stack of its own", self.id),
        }
    }

    fn assert_running(&self) {
        let this = self as *const Fiber as *mut Fiber;
        assert!(
            current().map(FiberHandle::as_ptr) == Some(this),
            "stack usage of {} queried from outside its own context",
            self.id
        );
    }

    /// Bytes of stack in use, measured from the calling frame.
    ///
    /// # Panics
    ///
    /// Panics when called from any context other than this fiber.
    pub fn current_stack_size(&self) -> usize {
        if self.is_thread_fiber() {
            return 0;
        }
        self.assert_running();
        self.region().top.saturating_sub(stack_marker())
    }

    /// Bytes of stack still available to the calling frame. A thread fiber
    /// reports its declared capacity; the OS guards that stack.
    pub fn current_stack_size_left(&self) -> usize {
        if self.is_thread_fiber() {
            return self.capacity();
        }
        self.capacity().saturating_sub(self.current_stack_size())
    }

    /// Returns true, and logs the overflow, when the calling frame lies below
    /// the declared capacity. Detection only: the caller decides what to do.
    pub fn is_stack_overflow(&self) -> bool {
        if self.is_thread_fiber() {
            return false;
        }
        let used = self.current_stack_size();
        let capacity = self.capacity();
        if used > capacity {
            tracing::error!(
                fiber = %self.id,
                label = %self.label,
                capacity,
                used,
                overflow = used - capacity,
                "fiber stack overflow detected"
            );
            true
        } else {
            false
        }
    }

    fn poison_below(&mut self, end: usize) {
        let region = self.region();
        let start = region.allocation.as_ptr() as usize;
        let end = end.clamp(start, region.top);
        // SAFETY: `start..end` lies inside this fiber's allocation and is below
        // any live frame (the fiber is not running).
        let bytes = unsafe { std::slice::from_raw_parts_mut(start as *mut u8, end - start) };
        poison::fill(bytes, self.id.0);
    }

    /// Reads the poison pattern back. `None` when poisoning is off.
    ///
    /// Must not be called while the fiber is running.
    pub fn poison_report(&self) -> Option<PoisonReport> {
        if !self.poison || !self.is_initialized() {
            return None;
        }
        let region = self.region();
        let start = region.allocation.as_ptr() as usize;
        // SAFETY: the region belongs to this fiber and it is not running.
        let bytes = unsafe { std::slice::from_raw_parts(start as *const u8, region.top - start) };
        Some(poison::inspect(bytes, self.id.0))
    }

    /// Deepest stack usage observed since the last poisoning, in bytes from
    /// the top. `None` when poisoning is off.
    pub fn stack_high_water_mark(&self) -> Option<usize> {
        let report = self.poison_report()?;
        let region = self.region();
        let span = region.top - region.allocation.as_ptr() as usize;
        Some(span - report.intact_bytes)
    }

    /// Address range `[base, top)` of the declared capacity.
    pub fn stack_bounds(&self) -> Option<(usize, usize)> {
        match self.stack {
            FiberStack::Owned {
                region: Some(region),
                ..
            } => Some((region.base, region.top)),
            _ => None,
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("capacity", &self.capacity())
            .field("thread", &self.is_thread_fiber())
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Root frame of every pooled fiber. Entered through a context switch with the
/// fiber's address in the first-argument register and a null return address.
extern "C" fn fiber_trampoline(fiber: *mut Fiber) -> ! {
    loop {
        // SAFETY: the context was built by `Fiber::reset` on a live fiber and
        // is only resumed through `Fiber::switch`.
        unsafe {
            Fiber::run(fiber);
            Fiber::suspend(fiber);
        }
    }
}

/// Checks the running fiber for stack overflow. False outside of fibers.
pub fn check_stack_overflow() -> bool {
    // SAFETY: the current fiber is alive while it runs.
    current().is_some_and(|fiber| unsafe { (*fiber.as_ptr()).is_stack_overflow() })
}

/// Stack bytes left to the running fiber, or `None` outside of fibers.
pub fn current_stack_left() -> Option<usize> {
    // SAFETY: the current fiber is alive while it runs.
    current().map(|fiber| unsafe { (*fiber.as_ptr()).current_stack_size_left() })
}

/// Label of the running fiber's job, or `None` outside of fibers.
pub fn current_label() -> Option<DebugLabel> {
    // SAFETY: the current fiber is alive while it runs.
    current().map(|fiber| unsafe { (*fiber.as_ptr()).label() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TEST_CAPACITY: usize = 64 * 1024;

    struct Harness {
        arena: StackArena,
        thread: Box<Fiber>,
        fiber: Box<Fiber>,
    }

    impl Harness {
        fn new(capacity: usize) -> Self {
            let mut arena = StackArena::new();
            arena.initialize(Fiber::allocation_size(capacity)).unwrap();
            let mut fiber = Box::new(Fiber::new(capacity).with_poisoning(true));
            fiber.initialize(&mut arena).unwrap();
            Harness {
                arena,
                thread: Box::new(Fiber::thread_fiber(2 * 1024 * 1024)),
                fiber,
            }
        }

        fn run(&mut self, entry: EntryPoint, params: ParamHandle, label: &str) {
            self.fiber.attach(
                entry,
                params,
                Some(record_end),
                std::ptr::null_mut(),
                DebugLabel::new(label),
            );
            unsafe { Fiber::switch(&mut *self.thread, &mut *self.fiber) };
            assert!(current().is_none());
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.fiber.destroy(&mut self.arena);
        }
    }

    static ENDS: AtomicUsize = AtomicUsize::new(0);

    fn record_end(_fiber: FiberHandle, _data: *mut ()) {
        ENDS.fetch_add(1, Ordering::SeqCst);
    }

    fn push_label(params: ParamHandle) {
        let log = unsafe { &*(params.0 as *const Mutex<Vec<String>>) };
        let label = current_label().expect("running inside a fiber");
        log.lock().unwrap().push(label.to_string());
    }

    #[test]
    fn test_attach_run_detach_reattach() {
        let mut harness = Harness::new(TEST_CAPACITY);
        let log = Mutex::<Vec<String>>::new(Vec::new());
        let ends_before = ENDS.load(Ordering::SeqCst);

        harness.run(push_label, ParamHandle::from_ref(&log), "first");
        assert!(harness.fiber.is_attached());
        harness.fiber.detach();
        assert_eq!(harness.fiber.label(), DebugLabel::DETACHED);
        assert!(!harness.fiber.is_attached());

        harness.run(push_label, ParamHandle::from_ref(&log), "second");
        harness.fiber.detach();

        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
        assert!(ENDS.load(Ordering::SeqCst) >= ends_before + 2);
    }

    #[test]
    fn test_reset_primes_trampoline() {
        let harness = Harness::new(TEST_CAPACITY);
        let regs = harness.fiber.registers();
        let (base, top) = harness.fiber.stack_bounds().unwrap();
        assert_eq!(regs.stack_pointer(), top);
        assert_eq!(regs.instruction_pointer(), fiber_trampoline as usize);
        assert_eq!(regs.argument(), &*harness.fiber as *const Fiber as usize);
        assert_eq!(top - base, TEST_CAPACITY);
        assert_eq!((top + CALL_FRAME_OFFSET) % STACK_ALIGNMENT, 0);
        assert_eq!(unsafe { *(top as *const usize) }, 0);
    }

    #[test]
    fn test_panicking_job_still_completes() {
        fn boom(_: ParamHandle) {
            panic!("intentional panic for testing");
        }

        let mut harness = Harness::new(TEST_CAPACITY);
        let ends_before = ENDS.load(Ordering::SeqCst);
        harness.run(boom, ParamHandle::null(), "boom");
        assert!(ENDS.load(Ordering::SeqCst) > ends_before);
        harness.fiber.detach();

        let log = Mutex::<Vec<String>>::new(Vec::new());
        harness.run(push_label, ParamHandle::from_ref(&log), "after");
        assert_eq!(*log.lock().unwrap(), vec!["after"]);
    }

    #[test]
    fn test_stack_accounting_inside_fiber() {
        fn measure(params: ParamHandle) {
            let out = unsafe { &*(params.0 as *const Mutex<Option<(usize, bool)>>) };
            let left = current_stack_left().unwrap();
            *out.lock().unwrap() = Some((left, check_stack_overflow()));
        }

        let mut harness = Harness::new(TEST_CAPACITY);
        let out = Mutex::<Option<(usize, bool)>>::new(None);
        harness.run(measure, ParamHandle::from_ref(&out), "measure");

        let (left, overflow) = out.lock().unwrap().unwrap();
        assert!(left > 0 && left < TEST_CAPACITY);
        assert!(!overflow);
    }

    #[inline(never)]
    fn recurse_until_overflow(depth: usize) -> usize {
        let mut frame = [0u8; 256];
        std::hint::black_box(&mut frame);
        if check_stack_overflow() {
            return depth;
        }
        recurse_until_overflow(depth + 1) + std::hint::black_box(0)
    }

    #[test]
    fn test_overflow_detected_by_recursion() {
        fn overflow(params: ParamHandle) {
            let out = unsafe { &*(params.0 as *const AtomicUsize) };
            out.store(recurse_until_overflow(1), Ordering::SeqCst);
        }

        let mut harness = Harness::new(16 * 1024);
        let depth = AtomicUsize::new(0);
        harness.run(overflow, ParamHandle::from_ref(&depth), "overflow");
        harness.fiber.detach();

        let depth = depth.load(Ordering::SeqCst);
        assert!(depth > 1, "recursion stopped at depth {depth}");
        let report = harness.fiber.poison_report().unwrap();
        assert!(report.is_clean());
    }

    #[test]
    fn test_high_water_mark_tracks_usage() {
        fn touch(_: ParamHandle) {
            let mut buf = [1u8; 8 * 1024];
            std::hint::black_box(&mut buf);
        }

        let mut harness = Harness::new(TEST_CAPACITY);
        let before = harness.fiber.stack_high_water_mark().unwrap();
        harness.run(touch, ParamHandle::null(), "touch");
        let used = harness.fiber.stack_high_water_mark().unwrap();
        assert!(used >= before + 8 * 1024, "{used} < {before} + 8K");
        assert_eq!(harness.fiber.poison_report().unwrap().last_id, Some(harness.fiber.id().0));
        harness.fiber.detach();
    }

    #[test]
    fn test_thread_fiber_reports_declared_capacity() {
        let thread = Fiber::thread_fiber(1 << 20);
        assert!(thread.is_thread_fiber());
        assert_eq!(thread.current_stack_size_left(), 1 << 20);
        assert!(!thread.is_stack_overflow());
        assert!(thread.poison_report().is_none());
    }

    #[test]
    #[should_panic(expected = "outside its own context")]
    fn test_stack_query_from_outside_panics() {
        let harness = Harness::new(TEST_CAPACITY);
        let _ = harness.fiber.current_stack_size();
    }

    #[test]
    #[should_panic(expected = "cannot be initialized")]
    fn test_thread_fiber_initialize_panics() {
        let mut arena = StackArena::new();
        arena.initialize(4096).unwrap();
        let mut thread = Fiber::thread_fiber(4096);
        let _ = thread.initialize(&mut arena);
    }
}
