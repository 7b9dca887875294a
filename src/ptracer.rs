//! Types for spawning a tracee, waiting on its process group, and interpreting stops.

use std::io;
use std::marker::PhantomData;
use std::os::unix::process::CommandExt;
use std::process::Command;

use nix::{
    errno::Errno,
    sys::{
        ptrace,
        wait::{self, WaitPidFlag, WaitStatus},
    },
};
use tracing::{debug, info, trace};

use crate::error::{Error, Result, ResultExt};
use crate::x86::{RegisterSnapshot, Registers};

pub use nix::sys::ptrace::Options;
pub use nix::unistd::Pid;

/// POSIX signal.
pub use nix::sys::signal::Signal;

/// Options set on a tracee whenever it is restarted by the debugger.
///
/// Cloned threads are auto-attached so that their events reach our group-wide `wait()`,
/// and a tracee left half-patched by an aborted session is killed with it.
pub const TRACE_OPTIONS: Options = Options::PTRACE_O_TRACECLONE
    .union(Options::PTRACE_O_EXITKILL);

const WORD_SIZE: usize = std::mem::size_of::<u64>();

/// A _ptrace-stop_, a tracee state in which it is stopped and ready to accept ptrace
/// commands.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stop {
    // signal-delivery-stop for `SIGTRAP`: a software breakpoint, a finished single-step,
    // or the trap issued after `execve()`.
    Trap,

    // ptrace-event-stop for `PTRACE_EVENT_CLONE`.
    Clone,

    // Any other ptrace-event-stop.
    Event { code: i32 },

    // signal-delivery-stop for anything but `SIGTRAP`, including the `SIGSTOP` that
    // starts every auto-attached thread.
    SignalDelivery { signal: Signal },
}

impl Stop {
    /// Whether this stop is a breakpoint or step trap the operator should see.
    ///
    /// Every `SIGTRAP` stop qualifies unless its trap cause is a new clone.
    pub fn is_actionable(&self) -> bool {
        matches!(self, Stop::Trap | Stop::Event { .. })
    }
}

/// What raised a `SIGTRAP`, from the `si_code` of the stop's signal info.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TrapCause {
    /// An executed `int3`.
    Breakpoint,

    /// A completed `PTRACE_SINGLESTEP`.
    Step,

    /// Anything else, such as a `SIGTRAP` sent with `kill(2)` or the post-`execve()` trap.
    Other { code: i32 },
}

impl TrapCause {
    pub fn from_code(code: i32) -> Self {
        match code {
            // The kernel reports `int3` as `SI_KERNEL` on x86-64.
            libc::SI_KERNEL | libc::TRAP_BRKPT => TrapCause::Breakpoint,
            libc::TRAP_TRACE => TrapCause::Step,
            code => TrapCause::Other { code },
        }
    }
}

/// Restart requests, which resume stopped tracees.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Restart {
    Step,
    Continue,
}

/// How a tracee terminated.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitType {
    Exit(i32),
    Signaled(Signal, bool),
}

/// A decoded `wait(2)` status.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Event {
    /// The spawned process terminated. No further events will be delivered.
    Exited { pid: Pid, exit: ExitType },

    /// Another member of the process group, such as a cloned thread, terminated.
    Reaped { pid: Pid, exit: ExitType },

    /// A tracee entered a ptrace-stop.
    Stopped(Tracee),

    /// A status we never ask for (`WCONTINUED`, `PTRACE_O_TRACESYSGOOD`).
    Unexpected(WaitStatus),
}

/// Decode a `wait(2)` status observed while tracing the process `root`.
pub fn classify(status: WaitStatus, root: Pid) -> Event {
    use Signal::*;

    match status {
        WaitStatus::Exited(pid, code) => terminated(pid, root, ExitType::Exit(code)),
        WaitStatus::Signaled(pid, signal, core_dumped) => {
            terminated(pid, root, ExitType::Signaled(signal, core_dumped))
        },
        WaitStatus::Stopped(pid, SIGTRAP) => {
            Event::Stopped(Tracee::new(pid, None, Stop::Trap))
        },
        WaitStatus::Stopped(pid, SIGSTOP) => {
            // Attach-stop of a newly cloned thread. Delivering it would stop the thread again.
            let stop = Stop::SignalDelivery { signal: SIGSTOP };
            Event::Stopped(Tracee::new(pid, None, stop))
        },
        WaitStatus::Stopped(pid, signal) => {
            let stop = Stop::SignalDelivery { signal };
            Event::Stopped(Tracee::new(pid, signal, stop))
        },
        WaitStatus::PtraceEvent(pid, SIGTRAP, libc::PTRACE_EVENT_CLONE) => {
            Event::Stopped(Tracee::new(pid, None, Stop::Clone))
        },
        WaitStatus::PtraceEvent(pid, SIGTRAP, code) => {
            Event::Stopped(Tracee::new(pid, None, Stop::Event { code }))
        },
        WaitStatus::PtraceEvent(pid, signal, _) => {
            let stop = Stop::SignalDelivery { signal };
            Event::Stopped(Tracee::new(pid, signal, stop))
        },
        WaitStatus::PtraceSyscall(..) |
        WaitStatus::Continued(..) |
        WaitStatus::StillAlive => Event::Unexpected(status),
    }
}

fn terminated(pid: Pid, root: Pid, exit: ExitType) -> Event {
    if pid == root {
        Event::Exited { pid, exit }
    } else {
        Event::Reaped { pid, exit }
    }
}

/// Word-granular access to a stopped tracee's address space.
///
/// Little-endian: byte `i` of the word at `addr` lives at `addr + i`.
pub trait Memory {
    fn peek(&self, addr: u64) -> Result<u64>;

    fn poke(&mut self, addr: u64, word: u64) -> Result<()>;

    fn read_bytes(&self, addr: u64, data: &mut [u8]) -> Result<()> {
        for (i, chunk) in data.chunks_mut(WORD_SIZE).enumerate() {
            let at = word_addr(addr, i)?;
            let word = self.peek(at)?.to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }

        Ok(())
    }

    /// Write `data` at `addr`, preserving the untouched bytes of partially-covered words.
    fn write_bytes(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        for (i, chunk) in data.chunks(WORD_SIZE).enumerate() {
            let at = word_addr(addr, i)?;
            let mut word = self.peek(at)?.to_le_bytes();
            word[..chunk.len()].copy_from_slice(chunk);
            self.poke(at, u64::from_le_bytes(word))?;
        }

        Ok(())
    }
}

fn word_addr(addr: u64, index: usize) -> Result<u64> {
    match addr.checked_add((index * WORD_SIZE) as u64) {
        Some(at) => Ok(at),
        None => Err(Error::MemoryAccess { addr, source: Errno::EFAULT }),
    }
}

/// Tracee task in ptrace-stop, with an optional pending signal.
///
/// **Warning:** the underlying tracee is not guaranteed to exist, and
/// operations on it may fail between calls to [`Ptracer::wait()`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Tracee {
    pid: Pid,
    pending: Option<Signal>,
    stop: Stop,

    #[doc(hidden)]
    _not_send: PhantomData<*const ()>,
}

impl Tracee {
    pub fn new(pid: Pid, pending: impl Into<Option<Signal>>, stop: Stop) -> Self {
        let pending = pending.into();
        let _not_send = PhantomData;

        Self { pid, pending, stop, _not_send }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn pending_signal(&self) -> Option<Signal> {
        self.pending
    }

    pub fn stop(&self) -> Stop {
        self.stop
    }

    /// Drop the pending signal, so the next restart does not deliver it.
    pub fn suppress(&mut self) {
        self.pending = None;
    }

    /// Why a thread in a [`Stop::Trap`] stopped.
    pub fn trap_cause(&self) -> Result<TrapCause> {
        let info = ptrace::getsiginfo(self.pid).control(self.pid, "PTRACE_GETSIGINFO")?;

        Ok(TrapCause::from_code(info.si_code))
    }

    /// Whether a stop reported with a stopping signal is a group-stop rather than a
    /// signal-delivery-stop.
    ///
    /// Only signal-delivery-stops carry signal info. Restarting a group-stop with a
    /// signal does not deliver it.
    pub fn in_group_stop(&self) -> Result<bool> {
        match ptrace::getsiginfo(self.pid) {
            Ok(_) => Ok(false),
            Err(Errno::EINVAL) => Ok(true),
            Err(err) => nix::Result::<bool>::Err(err).control(self.pid, "PTRACE_GETSIGINFO"),
        }
    }

    /// Set tracing options on the tracee.
    ///
    /// **NOTE:** [`TRACE_OPTIONS`] are always set, even if unset in the passed value.
    pub fn set_options(&mut self, options: Options) -> Result<()> {
        let options = options | TRACE_OPTIONS;
        ptrace::setoptions(self.pid, options).control(self.pid, "PTRACE_SETOPTIONS")
    }

    pub fn registers(&self) -> Result<Registers> {
        ptrace::getregs(self.pid).control(self.pid, "PTRACE_GETREGS")
    }

    pub fn set_registers(&mut self, regs: Registers) -> Result<()> {
        ptrace::setregs(self.pid, regs).control(self.pid, "PTRACE_SETREGS")
    }

    pub fn snapshot(&self) -> Result<RegisterSnapshot> {
        Ok(RegisterSnapshot::from(&self.registers()?))
    }
}

impl Memory for Tracee {
    fn peek(&self, addr: u64) -> Result<u64> {
        let word = ptrace::read(self.pid, addr as ptrace::AddressType)
            .map_err(|source| Error::MemoryAccess { addr, source })?;

        Ok(word as u64)
    }

    fn poke(&mut self, addr: u64, word: u64) -> Result<()> {
        // SAFETY: `data` is passed by value to `PTRACE_POKEDATA`, never dereferenced.
        let res = unsafe {
            ptrace::write(
                self.pid,
                addr as ptrace::AddressType,
                word as *mut libc::c_void,
            )
        };

        res.map_err(|source| Error::MemoryAccess { addr, source })
    }
}

/// Tracer for a single spawned process and the threads it clones.
///
/// The tracee is placed in its own process group, and all waiting is scoped to that
/// group, so events from any cloned thread are observed by one blocking `wait()`.
/// This makes it a background job of any terminal it shares with the debugger. See
/// [`Terminal`](crate::terminal::Terminal).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Ptracer {
    /// The spawned process. Its termination ends the session.
    root: Option<Pid>,

    /// Process group of `root`, equal to its pid.
    group: Option<Pid>,

    // Only the thread that spawned the tracee may wait on and control it.
    _not_send: PhantomData<*const ()>,
}

impl Ptracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self) -> Option<Pid> {
        self.root
    }

    /// Process group of the live tracee.
    pub fn group(&self) -> Option<Pid> {
        self.root.and(self.group)
    }

    /// Spawn `cmd` for tracing, returning it in its post-`execve()` trap stop.
    ///
    /// The command will be configured to request `PTRACE_TRACEME` and to lead a new
    /// process group after `fork()` and pre-`exec()`.
    pub fn spawn(&mut self, mut cmd: Command) -> Result<Tracee> {
        if self.root.is_some() {
            internal_error!("tracer already has a tracee");
        }

        // On fork, request `PTRACE_TRACEME`.
        unsafe {
            cmd.pre_exec(|| ptrace::traceme().map_err(|err| io::Error::from_raw_os_error(err as i32)))
        };
        cmd.process_group(0);

        // The `Child` handle is dropped unreaped: its final status is consumed by `wait()`.
        let child = cmd.spawn().map_err(|source| Error::Spawn { source })?;
        let pid = Pid::from_raw(child.id() as i32);
        info!(pid = pid.as_raw(), "spawned tracee");

        self.root = Some(pid);
        self.group = Some(pid);

        // Without `PTRACE_O_TRACEEXEC`, a successful `execve()` after `PTRACE_TRACEME`
        // stops the tracee with a plain `SIGTRAP`.
        let status = wait::waitpid(pid, Some(WaitPidFlag::__WALL)).control(pid, "waitpid")?;
        debug!(?status, "initial wait status");

        match status {
            WaitStatus::Stopped(stopped, Signal::SIGTRAP) if stopped == pid => {
                Ok(Tracee::new(pid, None, Stop::Trap))
            },
            status => {
                self.root = None;
                Err(Error::NotStopped { pid, status })
            },
        }
    }

    /// Block until any member of the traced process group changes state.
    pub fn wait(&mut self) -> Result<Event> {
        let (root, group) = match (self.root, self.group) {
            (Some(root), Some(group)) => (root, group),
            _ => internal_error!("wait() without a live tracee"),
        };

        let any_in_group = Pid::from_raw(-group.as_raw());
        let status = wait::waitpid(any_in_group, Some(WaitPidFlag::__WALL)).control(root, "waitpid")?;
        trace!(?status, "wait status");

        let event = classify(status, root);

        if let Event::Exited { pid, exit } = event {
            info!(pid = pid.as_raw(), ?exit, "tracee exited");
            self.root = None;
        }

        Ok(event)
    }

    /// Resume the stopped tracee, delivering any pending signal.
    pub fn restart(&mut self, tracee: Tracee, restart: Restart) -> Result<()> {
        let Tracee { pid, pending, .. } = tracee;

        let res = match restart {
            Restart::Step => ptrace::step(pid, pending),
            Restart::Continue => ptrace::cont(pid, pending),
        };

        match res {
            Err(source @ Errno::ESRCH) => Err(Error::TraceeDied { pid, source }),
            Err(source) => Err(Error::Restart { pid, mode: restart, source }),
            Ok(()) => Ok(()),
        }
    }
}
