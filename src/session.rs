//! The trace controller: drives one tracee from spawn to exit.
//!
//! A session owns everything that used to be process-wide debugger state: the symbol
//! table, the armed breakpoint, the unwinder settings, and the command source. It runs
//! a single blocking loop, handling the wait events of the tracee's whole process group
//! in delivery order.

use std::io::Write;
use std::process::Command;

use tracing::{debug, info, warn};

use crate::breakpoint::BreakpointManager;
use crate::cmd::{Action, BreakTarget, CommandSource};
use crate::config::{Config, MAIN_FUNCTION};
use crate::error::{Error, Result};
use crate::ptracer::{Event, ExitType, Options, Ptracer, Restart, Signal, Stop, Tracee, TrapCause};
use crate::symbols::{Location, SymbolTable};
use crate::terminal::Terminal;
use crate::unwind::Unwinder;
use crate::x86::RegisterSnapshot;

/// Lifecycle of the traced process, as seen by the session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    // Not yet spawned.
    Launching,

    // Spawned and stopped after `execve()`, not yet resumed.
    Attached,

    // Resumed, waiting for the next event.
    Running,

    // Stopped at a breakpoint or step, inspected by the operator.
    Stopped,

    // The spawned process terminated.
    Exited,
}

pub struct Session<C, W> {
    tracer: Ptracer,
    symbols: SymbolTable,
    breakpoints: BreakpointManager,
    unwinder: Unwinder,
    commands: C,

    /// Sink for stop reports and diagnostics.
    out: W,

    state: State,

    /// Armed just before the tracee first runs.
    initial_breakpoint: Option<BreakTarget>,

    /// Position of `main.main`, once attached. Its file is the default for line breakpoints.
    entry: Option<Location>,

    stops: usize,

    share_terminal: bool,

    /// Controlling terminal, lent to the tracee while it runs.
    terminal: Option<Terminal>,
}

impl<C: CommandSource, W: Write> Session<C, W> {
    pub fn new(symbols: SymbolTable, config: &Config, commands: C, out: W) -> Self {
        let mut unwinder = Unwinder::new(config.max_depth());
        unwinder.set_root_function(config.root_function().map(str::to_owned));

        Self {
            tracer: Ptracer::new(),
            symbols,
            breakpoints: BreakpointManager::new(),
            unwinder,
            commands,
            out,
            state: State::Launching,
            initial_breakpoint: config.breakpoint().cloned(),
            entry: None,
            stops: 0,
            share_terminal: config.share_terminal(),
            terminal: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn entry(&self) -> Option<&Location> {
        self.entry.as_ref()
    }

    /// Number of breakpoint and step stops reported so far.
    pub fn stops(&self) -> usize {
        self.stops
    }

    /// Spawn `cmd` and trace it until it terminates.
    ///
    /// Any failed ptrace request aborts the session: once a request fails, the tracee's
    /// state can no longer be known.
    pub fn run(&mut self, cmd: Command) -> Result<ExitType> {
        if self.state != State::Launching {
            internal_error!("session already ran");
        }

        let mut tracee = self.tracer.spawn(cmd)?;
        self.state = State::Attached;

        if self.share_terminal {
            self.terminal = Terminal::stdin();
        }
        self.entry = self.resolve_entry();

        if let Some(target) = self.initial_breakpoint.take() {
            self.break_at(&mut tracee, &target)?;
        }

        self.resume(tracee)?;

        loop {
            match self.tracer.wait()? {
                Event::Exited { exit, .. } => {
                    self.state = State::Exited;
                    self.reclaim_terminal()?;
                    return Ok(exit);
                },
                Event::Reaped { pid, exit } => {
                    debug!(pid = pid.as_raw(), ?exit, "group member terminated");
                },
                Event::Stopped(mut tracee) if tracee.stop().is_actionable() => {
                    if self.rewind_stale_trap(&mut tracee)? {
                        self.tracer.restart(tracee, Restart::Continue)?;
                    } else {
                        self.handle_stop(tracee)?;
                    }
                },
                Event::Stopped(mut tracee) => {
                    if is_job_control(tracee.pending_signal()) && tracee.in_group_stop()? {
                        debug!(pid = tracee.pid().as_raw(), stop = ?tracee.stop(), "ending group-stop");
                        tracee.suppress();
                    }

                    debug!(pid = tracee.pid().as_raw(), stop = ?tracee.stop(), "resuming silently");
                    self.tracer.restart(tracee, Restart::Continue)?;
                },
                Event::Unexpected(status) => {
                    warn!(?status, "unexpected wait status");
                    writeln!(self.out, "warning: unexpected wait status {:?}", status)?;
                },
            }
        }
    }

    fn resolve_entry(&self) -> Option<Location> {
        let entry = self
            .symbols
            .lookup_func(MAIN_FUNCTION)
            .and_then(|main| self.symbols.pc_to_line(main.entry).ok());

        match &entry {
            Some(location) => info!(%location, "resolved entry"),
            None => warn!("no line information for {}", MAIN_FUNCTION),
        }

        entry
    }

    // A thread that executed a trap before another thread's stop disarmed it. Back it
    // up over the trap, so it runs the restored instruction without a report.
    fn rewind_stale_trap(&mut self, tracee: &mut Tracee) -> Result<bool> {
        if tracee.stop() != Stop::Trap {
            return Ok(false);
        }

        let mut regs = tracee.registers()?;
        let addr = match self.breakpoints.stale_hit(regs.rip) {
            Some(breakpoint) => breakpoint.addr(),
            None => return Ok(false),
        };

        // A single-step over a one-byte instruction also lands on `addr + 1`.
        if tracee.trap_cause()? != TrapCause::Breakpoint {
            return Ok(false);
        }

        debug!(pid = tracee.pid().as_raw(), addr, "rewinding late breakpoint hit");
        regs.rip = addr;
        tracee.set_registers(regs)?;

        Ok(true)
    }

    // Report a breakpoint or step stop, then let the operator pick the next restart.
    fn handle_stop(&mut self, mut tracee: Tracee) -> Result<()> {
        self.state = State::Stopped;
        self.stops += 1;
        self.reclaim_terminal()?;

        let mut regs = tracee.registers()?;

        // Back up over a trap we executed, so the restored instruction runs on resume.
        let hit = self
            .breakpoints
            .armed()
            .filter(|breakpoint| breakpoint.was_hit(regs.rip))
            .map(|breakpoint| breakpoint.addr());

        if let Some(addr) = hit {
            if tracee.stop() == Stop::Trap && tracee.trap_cause()? == TrapCause::Breakpoint {
                debug!(addr, "hit breakpoint");
                regs.rip = addr;
                tracee.set_registers(regs)?;
            }
        }

        let snapshot = RegisterSnapshot::from(&regs);

        match self.symbols.pc_to_line(snapshot.pc) {
            Ok(location) => writeln!(self.out, "Stopped at {}", location)?,
            Err(err) => {
                debug!(%err, "unresolved stop");
                writeln!(self.out, "Stopped at unknown [{:#x}]", snapshot.pc)?;
            },
        }

        let stack = self.unwinder.unwind(&self.symbols, &tracee, snapshot);
        write!(self.out, "{}", stack)?;

        self.breakpoints.disarm(&mut tracee)?;

        self.resume(tracee)
    }

    // Ask the command source how to restart `tracee`, and do it.
    fn resume(&mut self, mut tracee: Tracee) -> Result<()> {
        let restart = loop {
            match self.commands.next_action()? {
                Action::Continue => break Restart::Continue,
                Action::Step => break Restart::Step,
                Action::Break(target) => {
                    if self.break_at(&mut tracee, &target)? {
                        break Restart::Continue;
                    }
                },
            }
        };

        tracee.set_options(Options::empty())?;
        self.lend_terminal();

        self.state = State::Running;
        self.tracer.restart(tracee, restart)
    }

    fn lend_terminal(&mut self) {
        if let (Some(terminal), Some(group)) = (self.terminal.as_mut(), self.tracer.group()) {
            if let Err(err) = terminal.lend(group) {
                warn!(%err, "tracee keeps running in the background");
            }
        }
    }

    fn reclaim_terminal(&mut self) -> Result<()> {
        match self.terminal.as_mut() {
            Some(terminal) => terminal.reclaim(),
            None => Ok(()),
        }
    }

    // Arm a breakpoint at `target`, reporting whether it was set. Targets that do not
    // resolve are reported to the operator and otherwise ignored.
    fn break_at(&mut self, tracee: &mut Tracee, target: &BreakTarget) -> Result<bool> {
        let addr = match self.resolve(target) {
            Ok(addr) => addr,
            Err(err) if !err.is_fatal() => {
                writeln!(self.out, "Can't find breakpoint for {}: {}", target, err)?;
                return Ok(false);
            },
            Err(err) => return Err(err),
        };

        // Continuing would trap again at once, without running anything.
        if tracee.registers()?.rip == addr {
            writeln!(
                self.out,
                "Can't set breakpoint at {} [{:#x}]: the tracee is stopped there, step first",
                target, addr,
            )?;
            return Ok(false);
        }

        self.breakpoints.arm(tracee, addr)?;
        writeln!(self.out, "Breakpoint set at {} [{:#x}]", target, addr)?;

        Ok(true)
    }

    /// Resolve a breakpoint target to a code address inside a known function.
    pub fn resolve(&self, target: &BreakTarget) -> Result<u64> {
        let unresolved = || Error::Unresolved { target: target.to_string() };

        match target {
            BreakTarget::Address(addr) => {
                self.symbols.lookup_function(*addr).map_err(|_| unresolved())?;
                Ok(*addr)
            },
            BreakTarget::Function(name) => {
                self.symbols
                    .lookup_func(name)
                    .map(|function| function.entry)
                    .ok_or_else(unresolved)
            },
            BreakTarget::Line { file, line } => {
                let file = match (file, &self.entry) {
                    (Some(file), _) => file.as_str(),
                    (None, Some(entry)) => entry.file.as_str(),
                    (None, None) => return Err(unresolved()),
                };

                self.symbols.line_to_pc(file, *line)
            },
        }
    }
}

// Stopping signals, reported both on delivery and again at the group-stop they cause.
fn is_job_control(signal: Option<Signal>) -> bool {
    matches!(
        signal,
        Some(Signal::SIGSTOP | Signal::SIGTSTP | Signal::SIGTTIN | Signal::SIGTTOU)
    )
}
