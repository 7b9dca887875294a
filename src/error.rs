use std::io;

use nix::{errno::Errno, sys::wait::WaitStatus};

use crate::ptracer::{Pid, Restart};

pub type Result<T> = std::result::Result<T, Error>;

macro_rules! internal_error {
    ($msg: expr) => {
        return Err($crate::error::Error::Internal($msg.into()))
    };
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Could not load symbol table: {reason}")]
    Load { reason: String },

    #[error("No function contains pc = {pc:#x}")]
    NotFound { pc: u64 },

    #[error("Could not resolve `{target}` to an address")]
    Unresolved { target: String },

    #[error("Could not access tracee memory at {addr:#x}")]
    MemoryAccess { addr: u64, source: nix::Error },

    #[error("Could not spawn tracee")]
    Spawn { source: io::Error },

    #[error("Tracee = {pid} did not stop after exec, status = {status:?}")]
    NotStopped { pid: Pid, status: WaitStatus },

    #[error("Ptrace request `{request}` failed for tracee = {pid}")]
    Control { pid: Pid, request: &'static str, source: nix::Error },

    #[error("Could not restart tracee = {pid} with mode = {mode:?}")]
    Restart { pid: Pid, mode: Restart, source: nix::Error },

    #[error("Tracee died while processing request, pid = {pid}")]
    TraceeDied { pid: Pid, source: nix::Error },

    #[error("Could not move the terminal foreground to process group = {group}")]
    Terminal { group: Pid, source: nix::Error },

    #[error("Input/output error")]
    IO(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn load(reason: impl Into<String>) -> Self {
        Error::Load { reason: reason.into() }
    }

    pub fn tracee_died(&self) -> bool {
        matches!(self, Error::TraceeDied { .. })
    }

    /// Whether the session must end after this error.
    ///
    /// Lookup failures degrade to placeholders or a re-prompt; everything that touches
    /// tracee state does not.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::NotFound { .. } | Error::Unresolved { .. })
    }
}

/// Attach the failed ptrace request to a raw `nix` error.
pub(crate) trait ResultExt<T> {
    fn control(self, pid: Pid, request: &'static str) -> Result<T>;
}

impl<T> ResultExt<T> for nix::Result<T> {
    fn control(self, pid: Pid, request: &'static str) -> Result<T> {
        match self {
            Err(source @ Errno::ESRCH) => Err(Error::TraceeDied { pid, source }),
            Err(source) => Err(Error::Control { pid, request, source }),
            Ok(t) => Ok(t),
        }
    }
}
