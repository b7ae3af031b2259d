//! AAPCS64 context switch.

pub(super) const STACK_ALIGNMENT: usize = 16;
pub(super) const RED_ZONE: usize = 0;
// Room for a zeroed frame record {fp, lr} at the root of the stack.
pub(super) const CALL_FRAME_OFFSET: usize = 16;

/// Saved register state of a suspended context.
///
/// Field offsets are hard-coded in the assembly below.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Registers {
    sp: usize,       // 0x00
    pc: usize,       // 0x08
    x0: usize,       // 0x10
    x19_x28: [usize; 10], // 0x18..0x68
    fp: usize,       // 0x68
    d8_d15: [u64; 8], // 0x70..0xB0
}

const _: () = {
    assert!(std::mem::offset_of!(Registers, x0) == 0x10);
    assert!(std::mem::offset_of!(Registers, x19_x28) == 0x18);
    assert!(std::mem::offset_of!(Registers, fp) == 0x68);
    assert!(std::mem::offset_of!(Registers, d8_d15) == 0x70);
};

impl Registers {
    /// Builds a context that, once switched to, calls `entry(arg)` with the
    /// stack pointer at `stack_top`.
    pub fn prepare(stack_top: usize, entry: usize, arg: usize) -> Self {
        Registers {
            sp: stack_top,
            pc: entry,
            x0: arg,
            ..Registers::default()
        }
    }

    pub fn stack_pointer(&self) -> usize {
        self.sp
    }

    pub fn instruction_pointer(&self) -> usize {
        self.pc
    }

    /// The first-argument register (`x0`) loaded on resume.
    pub fn argument(&self) -> usize {
        self.x0
    }
}

#[unsafe(naked)]
pub(super) unsafe extern "C" fn switch_context(from: *mut Registers, to: *const Registers) {
    // x0 = from, x1 = to. The saved pc is our link register, so resuming this
    // context is equivalent to returning from the call. lr is cleared before
    // the jump so a fresh context starts with a null return address.
    core::arch::naked_asm!(
        "mov x9, sp",
        "str x9, [x0, #0x00]",
        "str x30, [x0, #0x08]",
        "stp x19, x20, [x0, #0x18]",
        "stp x21, x22, [x0, #0x28]",
        "stp x23, x24, [x0, #0x38]",
        "stp x25, x26, [x0, #0x48]",
        "stp x27, x28, [x0, #0x58]",
        "str x29, [x0, #0x68]",
        "stp d8, d9, [x0, #0x70]",
        "stp d10, d11, [x0, #0x80]",
        "stp d12, d13, [x0, #0x90]",
        "stp d14, d15, [x0, #0xa0]",
        "ldp x19, x20, [x1, #0x18]",
        "ldp x21, x22, [x1, #0x28]",
        "ldp x23, x24, [x1, #0x38]",
        "ldp x25, x26, [x1, #0x48]",
        "ldp x27, x28, [x1, #0x58]",
        "ldr x29, [x1, #0x68]",
        "ldp d8, d9, [x1, #0x70]",
        "ldp d10, d11, [x1, #0x80]",
        "ldp d12, d13, [x1, #0x90]",
        "ldp d14, d15, [x1, #0xa0]",
        "ldr x9, [x1, #0x00]",
        "mov sp, x9",
        "ldr x9, [x1, #0x08]",
        "ldr x0, [x1, #0x10]",
        "mov x30, xzr",
        "br x9",
    )
}

#[unsafe(naked)]
pub(super) unsafe extern "C" fn restore_context(to: *const Registers) -> ! {
    core::arch::naked_asm!(
        "ldp x19, x20, [x0, #0x18]",
        "ldp x21, x22, [x0, #0x28]",
        "ldp x23, x24, [x0, #0x38]",
        "ldp x25, x26, [x0, #0x48]",
        "ldp x27, x28, [x0, #0x58]",
        "ldr x29, [x0, #0x68]",
        "ldp d8, d9, [x0, #0x70]",
        "ldp d10, d11, [x0, #0x80]",
        "ldp d12, d13, [x0, #0x90]",
        "ldp d14, d15, [x0, #0xa0]",
        "ldr x9, [x0, #0x00]",
        "mov sp, x9",
        "ldr x9, [x0, #0x08]",
        "ldr x0, [x0, #0x10]",
        "mov x30, xzr",
        "br x9",
    )
}
