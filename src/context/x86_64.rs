//! System V AMD64 context switch.

pub(super) const STACK_ALIGNMENT: usize = 16;
pub(super) const RED_ZONE: usize = 128;
// A `call` leaves rsp == 8 (mod 16) at function entry.
pub(super) const CALL_FRAME_OFFSET: usize = 8;

const MXCSR_DEFAULT: u32 = 0x1F80;
const FPU_CONTROL_DEFAULT: u16 = 0x037F;

/// Saved register state of a suspended context.
///
/// Field offsets are hard-coded in the assembly below.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Registers {
    rsp: usize,     // 0x00
    rip: usize,     // 0x08
    rdi: usize,     // 0x10
    rbx: usize,     // 0x18
    rbp: usize,     // 0x20
    r12: usize,     // 0x28
    r13: usize,     // 0x30
    r14: usize,     // 0x38
    r15: usize,     // 0x40
    mxcsr: u32,     // 0x48
    fpu_control: u16, // 0x4C
    _pad: u16,
}

const _: () = {
    assert!(std::mem::offset_of!(Registers, rdi) == 0x10);
    assert!(std::mem::offset_of!(Registers, r15) == 0x40);
    assert!(std::mem::offset_of!(Registers, mxcsr) == 0x48);
    assert!(std::mem::offset_of!(Registers, fpu_control) == 0x4C);
};

impl Registers {
    /// Builds a context that, once switched to, calls `entry(arg)` with the
    /// stack pointer at `stack_top`.
    pub fn prepare(stack_top: usize, entry: usize, arg: usize) -> Self {
        Registers {
            rsp: stack_top,
            rip: entry,
            rdi: arg,
            mxcsr: MXCSR_DEFAULT,
            fpu_control: FPU_CONTROL_DEFAULT,
            ..Registers::default()
        }
    }

    pub fn stack_pointer(&self) -> usize {
        self.rsp
    }

    pub fn instruction_pointer(&self) -> usize {
        self.rip
    }

    /// The first-argument register (`rdi`) loaded on resume.
    pub fn argument(&self) -> usize {
        self.rdi
    }
}

#[unsafe(naked)]
pub(super) unsafe extern "C" fn switch_context(from: *mut Registers, to: *const Registers) {
    // rdi = from, rsi = to. The saved rip is our return address and the saved
    // rsp is the caller's stack pointer after that return, so resuming this
    // context is equivalent to returning from the call.
    core::arch::naked_asm!(
        "mov rax, qword ptr [rsp]",
        "lea rcx, [rsp + 8]",
        "mov qword ptr [rdi + 0x00], rcx",
        "mov qword ptr [rdi + 0x08], rax",
        "mov qword ptr [rdi + 0x18], rbx",
        "mov qword ptr [rdi + 0x20], rbp",
        "mov qword ptr [rdi + 0x28], r12",
        "mov qword ptr [rdi + 0x30], r13",
        "mov qword ptr [rdi + 0x38], r14",
        "mov qword ptr [rdi + 0x40], r15",
        "stmxcsr dword ptr [rdi + 0x48]",
        "fnstcw word ptr [rdi + 0x4C]",
        "mov rbx, qword ptr [rsi + 0x18]",
        "mov rbp, qword ptr [rsi + 0x20]",
        "mov r12, qword ptr [rsi + 0x28]",
        "mov r13, qword ptr [rsi + 0x30]",
        "mov r14, qword ptr [rsi + 0x38]",
        "mov r15, qword ptr [rsi + 0x40]",
        "ldmxcsr dword ptr [rsi + 0x48]",
        "fldcw word ptr [rsi + 0x4C]",
        "mov rsp, qword ptr [rsi + 0x00]",
        "mov rdi, qword ptr [rsi + 0x10]",
        "jmp qword ptr [rsi + 0x08]",
    )
}

#[unsafe(naked)]
pub(super) unsafe extern "C" fn restore_context(to: *const Registers) -> ! {
    core::arch::naked_asm!(
        "mov rbx, qword ptr [rdi + 0x18]",
        "mov rbp, qword ptr [rdi + 0x20]",
        "mov r12, qword ptr [rdi + 0x28]",
        "mov r13, qword ptr [rdi + 0x30]",
        "mov r14, qword ptr [rdi + 0x38]",
        "mov r15, qword ptr [rdi + 0x40]",
        "ldmxcsr dword ptr [rdi + 0x48]",
        "fldcw word ptr [rdi + 0x4C]",
        "mov rsp, qword ptr [rdi + 0x00]",
        "mov rax, qword ptr [rdi + 0x08]",
        "mov rdi, qword ptr [rdi + 0x10]",
        "jmp rax",
    )
}
