//! Software breakpoints, implemented by patching a trap instruction into tracee text.
//!
//! All operations require the tracee to be in ptrace-stop. Sequencing patches around
//! restarts is left to the caller.

use tracing::debug;

use crate::error::Result;
use crate::ptracer::Memory;
use crate::x86::{self, SavedBytes, TRAP_INSTRUCTION, TRAP_LEN};

/// An armed breakpoint and the instruction bytes it displaced.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Breakpoint {
    addr: u64,
    saved: SavedBytes,
}

impl Breakpoint {
    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn saved(&self) -> SavedBytes {
        self.saved
    }

    /// Whether a thread stopped at `pc` got there by executing this breakpoint's trap.
    pub fn was_hit(&self, pc: u64) -> bool {
        pc == x86::pc_after_trap(self.addr)
    }
}

/// Owner of the (at most one) armed breakpoint.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BreakpointManager {
    armed: Option<Breakpoint>,

    /// Every breakpoint disarmed so far. Threads that executed a trap before it was
    /// removed still report stops for it.
    retired: Vec<Breakpoint>,
}

impl BreakpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn armed(&self) -> Option<&Breakpoint> {
        self.armed.as_ref()
    }

    /// The disarmed breakpoint whose trap a thread stopped at `pc` executed, if any.
    ///
    /// A breakpoint armed again at the same address is live, not stale.
    pub fn stale_hit(&self, pc: u64) -> Option<&Breakpoint> {
        let live = self.armed.map(|b| b.addr);

        self.retired.iter().find(|b| b.was_hit(pc) && Some(b.addr) != live)
    }

    /// Write a trap instruction at `addr`, returning the bytes it replaced.
    ///
    /// A breakpoint armed elsewhere is disarmed first.
    pub fn arm(&mut self, mem: &mut impl Memory, addr: u64) -> Result<SavedBytes> {
        if let Some(old) = self.disarm(mem)? {
            debug!(addr = old.addr, "replaced armed breakpoint");
        }

        let saved = replace_code(mem, addr, TRAP_INSTRUCTION)?;
        self.armed = Some(Breakpoint { addr, saved });
        debug!(addr, ?saved, "armed breakpoint");

        Ok(saved)
    }

    /// Restore the instruction displaced by the armed breakpoint, if any, and return it.
    ///
    /// The breakpoint is cleared even if the restore fails, since the tracee's text is
    /// then in an unknown state and the error is fatal to the session.
    pub fn disarm(&mut self, mem: &mut impl Memory) -> Result<Option<Breakpoint>> {
        let breakpoint = match self.armed.take() {
            Some(breakpoint) => breakpoint,
            None => return Ok(None),
        };

        if !self.retired.iter().any(|b| b.addr == breakpoint.addr) {
            self.retired.push(breakpoint);
        }

        replace_code(mem, breakpoint.addr, breakpoint.saved)?;
        debug!(addr = breakpoint.addr, "disarmed breakpoint");

        Ok(Some(breakpoint))
    }
}

/// Overwrite the instruction bytes at `addr` with `code`, returning the previous bytes.
pub fn replace_code(mem: &mut impl Memory, addr: u64, code: SavedBytes) -> Result<SavedBytes> {
    let mut original = [0; TRAP_LEN];
    mem.read_bytes(addr, &mut original)?;
    mem.write_bytes(addr, &code)?;

    Ok(original)
}
