//! A minimal ptrace(2) debugger for Go executables on x86-64 Linux.

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
compile_error!("godbg only supports x86-64 Linux");

#[macro_use]
pub mod error;

pub mod breakpoint;
pub mod cmd;
pub mod config;
pub mod ptracer;
pub mod session;
pub mod symbols;
pub mod terminal;
pub mod unwind;
pub mod x86;

pub use breakpoint::{Breakpoint, BreakpointManager};
pub use cmd::{Action, BreakTarget, CommandSource, Prompt, Script};
pub use config::Config;
pub use error::{Error, Result};
pub use ptracer::{classify, Event, ExitType, Memory, Pid, Ptracer, Restart, Signal, Stop, Tracee, TrapCause};
pub use session::{Session, State};
pub use symbols::{Function, Location, SymbolTable};
pub use terminal::Terminal;
pub use unwind::{CallStack, StackFrame, Unwinder};
pub use x86::RegisterSnapshot;
