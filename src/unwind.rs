//! Call stacks recovered by walking the frame-pointer chain of a stopped thread.

use std::fmt;

use tracing::debug;

use crate::error::Result;
use crate::ptracer::Memory;
use crate::symbols::{Location, SymbolTable};
use crate::x86::{RegisterSnapshot, CALLER_SP_OFFSET, RETURN_ADDRESS_OFFSET, SAVED_BP_OFFSET};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StackFrame {
    pub pc: u64,
    pub sp: u64,
    pub bp: u64,

    /// Position of `pc`, or in caller frames of the call just before it. `None` outside
    /// every known function.
    pub location: Option<Location>,
}

impl StackFrame {
    pub fn function_name(&self) -> Option<&str> {
        self.location.as_ref().map(|loc| loc.function.name.as_str())
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{} [{:#x}]", location, self.pc),
            None => write!(f, "unknown [{:#x}]", self.pc),
        }
    }
}

/// Frames of one thread, innermost first: the caller of `frames[i]` is `frames[i + 1]`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CallStack {
    pub frames: Vec<StackFrame>,

    /// The walk stopped early, at the depth limit or on an unreadable frame.
    pub truncated: bool,
}

impl fmt::Display for CallStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, frame) in self.frames.iter().enumerate() {
            writeln!(f, "  #{} {}", i, frame)?;
        }

        if self.truncated {
            writeln!(f, "  ...")?;
        }

        Ok(())
    }
}

/// Frame-pointer unwinder.
///
/// Relies on every function keeping the `push rbp; mov rbp, rsp` prologue, as Go does
/// on x86-64. A thread stopped before its current function has pushed its frame
/// pointer reports the caller of its caller as frame 1.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Unwinder {
    max_depth: usize,

    /// Outermost function worth reporting. Frames above it belong to the runtime.
    root_function: Option<String>,
}

impl Unwinder {
    pub fn new(max_depth: usize) -> Self {
        let max_depth = max_depth.max(1);
        let root_function = None;

        Self { max_depth, root_function }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn set_root_function(&mut self, root_function: Option<String>) {
        self.root_function = root_function;
    }

    /// Walk the stack of a thread stopped with registers `regs`.
    ///
    /// The walk ends after a frame in an unknown or root function, at a null frame
    /// pointer or return address, when the chain stops moving toward the stack base, or
    /// at the depth limit. Unreadable frames truncate the stack rather than failing.
    pub fn unwind(&self, symbols: &SymbolTable, mem: &impl Memory, regs: RegisterSnapshot) -> CallStack {
        let mut frames = vec![];
        let mut prev_bp = None;
        let RegisterSnapshot { mut pc, mut sp, mut bp } = regs;

        loop {
            // A return address follows the call, and may already belong to the next line
            // or function. The call itself is the byte before it.
            let call_pc = if frames.is_empty() { pc } else { pc.wrapping_sub(1) };
            let location = symbols.pc_to_line(call_pc).ok();
            let outermost = match &location {
                Some(location) => self.is_root(&location.function.name),
                None => true,
            };

            frames.push(StackFrame { pc, sp, bp, location });

            // Caller frames live at higher addresses. Anything else is corrupt or cyclic.
            let stalled = prev_bp.map_or(false, |prev| bp <= prev);

            if outermost || stalled || bp == 0 {
                return CallStack { frames, truncated: false };
            }

            if frames.len() >= self.max_depth {
                return CallStack { frames, truncated: true };
            }

            match read_caller(mem, bp) {
                Ok(Some((ret, saved_bp))) => {
                    prev_bp = Some(bp);
                    pc = ret;
                    sp = bp.wrapping_add(CALLER_SP_OFFSET);
                    bp = saved_bp;
                },
                Ok(None) => {
                    return CallStack { frames, truncated: false };
                },
                Err(err) => {
                    debug!(%err, bp, "unreadable stack frame");
                    return CallStack { frames, truncated: true };
                },
            }
        }
    }

    fn is_root(&self, name: &str) -> bool {
        self.root_function.as_deref() == Some(name)
    }
}

// Read the return address and saved frame pointer of the frame based at `bp`.
//
// Returns `None` at the bottom of the stack, where the return address is null.
fn read_caller(mem: &impl Memory, bp: u64) -> Result<Option<(u64, u64)>> {
    let ret = mem.peek(bp.wrapping_add(RETURN_ADDRESS_OFFSET))?;
    if ret == 0 {
        return Ok(None);
    }

    let saved_bp = mem.peek(bp.wrapping_add(SAVED_BP_OFFSET))?;

    Ok(Some((ret, saved_bp)))
}
