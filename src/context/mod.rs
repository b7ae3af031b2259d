//! Raw execution-context switching.
//!
//! This is the only architecture-specific part of the crate. A context is the
//! set of registers a suspended fiber needs to continue: the stack pointer,
//! the address to resume at, the register carrying the first call argument,
//! and the callee-saved registers of the platform ABI. Everything above this
//! module works in terms of [`Registers`], [`switch`] and [`restore`].
//!
//! Exactly one ISA is supported per build. Anything else fails to compile.

#[cfg(all(target_arch = "x86_64", not(windows)))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(windows)))]
use self::x86_64 as arch;

#[cfg(all(target_arch = "aarch64", not(windows)))]
mod aarch64;
#[cfg(all(target_arch = "aarch64", not(windows)))]
use self::aarch64 as arch;

#[cfg(not(any(
    all(target_arch = "x86_64", not(windows)),
    all(target_arch = "aarch64", not(windows))
)))]
compile_error!("fiberjobs only supports x86_64 and aarch64 targets using the System V / AAPCS64 ABI");

pub use arch::Registers;

/// Required alignment of the stack pointer at a call boundary.
pub const STACK_ALIGNMENT: usize = arch::STACK_ALIGNMENT;

/// Bytes below the stack pointer a leaf function may use without adjusting it.
pub const RED_ZONE: usize = arch::RED_ZONE;

/// Distance between the aligned stack top and the stack pointer a fresh
/// context starts with, so entering the trampoline looks like a normal call.
pub const CALL_FRAME_OFFSET: usize = arch::CALL_FRAME_OFFSET;

/// Prepares the top of a downward-growing stack whose highest usable byte is
/// just below `stack_end`.
///
/// The returned address is aligned, offset by [`CALL_FRAME_OFFSET`], and the
/// slot(s) it points at are zeroed so the root frame has a null return
/// address: unwinding past it faults instead of walking foreign memory.
///
/// # Safety
///
/// `stack_end` must be one past the end of a writable region of at least
/// `STACK_ALIGNMENT + CALL_FRAME_OFFSET` bytes.
pub unsafe fn prepare_stack_top(stack_end: *mut u8) -> usize {
    let aligned = (stack_end as usize) & !(STACK_ALIGNMENT - 1);
    let top = aligned - CALL_FRAME_OFFSET;
    // SAFETY: `top..aligned` lies inside the region per the caller contract.
    unsafe {
        std::ptr::write_bytes(top as *mut u8, 0, CALL_FRAME_OFFSET);
    }
    top
}

/// Saves the running context into `from` and resumes `to`.
///
/// Returns when some other context switches back into `from`.
///
/// # Safety
///
/// * `from` must be valid for writes and `to` valid for reads.
/// * `to` must hold either a context saved by a previous `switch` that has not
///   been resumed since, or one built by [`Registers::prepare`] whose stack is
///   live and unused.
#[inline(always)]
pub unsafe fn switch(from: *mut Registers, to: *const Registers) {
    // SAFETY: forwarded caller contract.
    unsafe { arch::switch_context(from, to) }
}

/// Resumes `to` and abandons the running context.
///
/// # Safety
///
/// Same contract as [`switch`] for `to`. Nothing on the current stack is
/// dropped; the caller must not own resources that need releasing.
#[inline(always)]
pub unsafe fn restore(to: *const Registers) -> ! {
    // SAFETY: forwarded caller contract.
    unsafe { arch::restore_context(to) }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PingPong {
        main: Registers,
        child: Registers,
        hits: usize,
    }

    extern "C" fn child_entry(state: *mut PingPong) -> ! {
        unsafe {
            (*state).hits += 1;
            switch(&mut (*state).child, &(*state).main);
            (*state).hits += 10;
            restore(&(*state).main);
        }
    }

    #[test]
    fn test_prepare_stack_top_alignment() {
        let mut stack = vec![0xAAu8; 4096];
        let end = unsafe { stack.as_mut_ptr().add(stack.len()) };
        let top = unsafe { prepare_stack_top(end) };
        assert_eq!((top + CALL_FRAME_OFFSET) % STACK_ALIGNMENT, 0);
        assert!(top < end as usize);
        let offset = top - stack.as_ptr() as usize;
        assert!(stack[offset..offset + CALL_FRAME_OFFSET].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_prepared_registers() {
        let regs = Registers::prepare(0x1000, 0x2000, 0x3000);
        assert_eq!(regs.stack_pointer(), 0x1000);
        assert_eq!(regs.instruction_pointer(), 0x2000);
        assert_eq!(regs.argument(), 0x3000);
    }

    #[test]
    fn test_switch_and_restore_round_trip() {
        let mut stack = vec![0u8; 64 * 1024];
        let end = unsafe { stack.as_mut_ptr().add(stack.len()) };
        let top = unsafe { prepare_stack_top(end) };

        let mut state = Box::new(PingPong {
            main: Registers::default(),
            child: Registers::default(),
            hits: 0,
        });
        let state_ptr: *mut PingPong = &mut *state;
        state.child = Registers::prepare(top, child_entry as usize, state_ptr as usize);

        unsafe {
            switch(&mut (*state_ptr).main, &(*state_ptr).child);
            assert_eq!((*state_ptr).hits, 1);

            switch(&mut (*state_ptr).main, &(*state_ptr).child);
            assert_eq!((*state_ptr).hits, 11);
        }
        drop(stack);
    }
}
