//! Foreground handoff of the debugger's controlling terminal.
//!
//! The tracee leads its own process group, so that waiting can be scoped to it. That
//! makes it a background job: reading the terminal would stop it with `SIGTTIN`, over
//! and over, since each stop is passed back to it. While the tracee runs, its group
//! owns the foreground, and the debugger takes it back to prompt.

use std::os::unix::io::RawFd;

use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};
use nix::unistd::{self, Pid};
use tracing::{debug, warn};

use crate::error::{Error, Result};

#[derive(Debug, Eq, PartialEq)]
pub struct Terminal {
    fd: RawFd,

    /// Process group of the debugger.
    debugger: Pid,

    /// Group holding the foreground in our place.
    lent_to: Option<Pid>,
}

impl Terminal {
    /// The terminal on standard input, if the debugger is its foreground job.
    pub fn stdin() -> Option<Self> {
        Self::for_fd(libc::STDIN_FILENO)
    }

    /// The terminal open on `fd`, if it is our controlling terminal and the debugger
    /// is its foreground job.
    pub fn for_fd(fd: RawFd) -> Option<Self> {
        if !unistd::isatty(fd).unwrap_or(false) {
            return None;
        }

        let debugger = unistd::getpgrp();

        match unistd::tcgetpgrp(fd) {
            Ok(foreground) if foreground == debugger => {
                Some(Self { fd, debugger, lent_to: None })
            },
            Ok(foreground) => {
                debug!(fd, foreground = foreground.as_raw(), "not the foreground job");
                None
            },
            Err(err) => {
                debug!(fd, %err, "not a controlling terminal");
                None
            },
        }
    }

    pub fn lent_to(&self) -> Option<Pid> {
        self.lent_to
    }

    /// Make `group` the foreground job.
    pub fn lend(&mut self, group: Pid) -> Result<()> {
        if self.lent_to == Some(group) {
            return Ok(());
        }

        set_foreground(self.fd, group)?;
        self.lent_to = Some(group);

        Ok(())
    }

    /// Make the debugger the foreground job again.
    pub fn reclaim(&mut self) -> Result<()> {
        if self.lent_to.take().is_some() {
            set_foreground(self.fd, self.debugger)?;
        }

        Ok(())
    }
}

impl Drop for Terminal {
    fn drop(&mut self) {
        if let Err(err) = self.reclaim() {
            warn!(%err, "could not reclaim terminal");
        }
    }
}

// A background job may only call `tcsetpgrp()` with `SIGTTOU` blocked.
fn set_foreground(fd: RawFd, group: Pid) -> Result<()> {
    let mut ttou = SigSet::empty();
    ttou.add(Signal::SIGTTOU);

    let mut mask = SigSet::empty();
    pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&ttou), Some(&mut mask))
        .map_err(|source| Error::Terminal { group, source })?;

    let res = unistd::tcsetpgrp(fd, group);

    pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&mask), None)
        .map_err(|source| Error::Terminal { group, source })?;

    res.map_err(|source| Error::Terminal { group, source })?;
    debug!(fd, group = group.as_raw(), "moved terminal foreground");

    Ok(())
}
