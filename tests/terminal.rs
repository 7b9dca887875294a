use anyhow::Result;
use godbg::Terminal;
use nix::pty::{openpty, Winsize};
use nix::sys::termios::Termios;
use nix::unistd::{close, pipe};

#[test]
fn test_pipe_is_not_a_terminal() -> Result<()> {
    let (read, write) = pipe()?;

    assert_eq!(Terminal::for_fd(read), None);
    assert_eq!(Terminal::for_fd(write), None);

    close(read)?;
    close(write)?;

    Ok(())
}

#[test]
fn test_terminal_must_be_controlling() -> Result<()> {
    // A terminal, but not the one our session is attached to.
    let pty = openpty(None::<&Winsize>, None::<&Termios>)?;

    assert_eq!(Terminal::for_fd(pty.slave), None);

    close(pty.slave)?;
    close(pty.master)?;

    Ok(())
}

#[test]
fn test_closed_fd() {
    assert_eq!(Terminal::for_fd(-1), None);
}
