//! x86-64 specifics: the trap instruction, the frame layout, and register access.

/// `int3`, the one-byte software breakpoint.
pub const TRAP_INSTRUCTION: [u8; TRAP_LEN] = [0xcc];

pub const TRAP_LEN: usize = 1;

/// Original instruction bytes displaced by a [`TRAP_INSTRUCTION`].
pub type SavedBytes = [u8; TRAP_LEN];

/// Offset from a frame-base pointer to the caller's saved frame-base pointer.
///
/// With frame pointers enabled, every prologue runs `push rbp; mov rbp, rsp`, so the
/// frame looks like this (stack grows down):
///
///   bp + 16  caller's stack pointer before the call
///   bp + 8   return address
///   bp + 0   caller's saved bp
pub const SAVED_BP_OFFSET: u64 = 0;

/// Offset from a frame-base pointer to the return address into the caller.
pub const RETURN_ADDRESS_OFFSET: u64 = 8;

/// Stack pointer of the caller, relative to the callee's frame-base pointer.
pub const CALLER_SP_OFFSET: u64 = 16;

/// Register state of a tracee, as returned by `PTRACE_GETREGS`.
pub type Registers = libc::user_regs_struct;

/// The registers needed to locate and unwind a stopped thread.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RegisterSnapshot {
    pub pc: u64,
    pub sp: u64,
    pub bp: u64,
}

impl RegisterSnapshot {
    pub fn new(pc: u64, sp: u64, bp: u64) -> Self {
        Self { pc, sp, bp }
    }
}

impl From<&Registers> for RegisterSnapshot {
    fn from(regs: &Registers) -> Self {
        Self::new(regs.rip, regs.rsp, regs.rbp)
    }
}

/// Address the instruction pointer lands on after executing a trap placed at `addr`.
pub fn pc_after_trap(addr: u64) -> u64 {
    addr.wrapping_add(TRAP_LEN as u64)
}
