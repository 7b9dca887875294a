//! Sessions on `test-programs/thread-trap`, whose threads all call `hot()` at once.

use std::process::{Command, Stdio};

use anyhow::Result;
use godbg::{Action, BreakTarget, CommandSource, Config, ExitType, Script, Session};
use ntest::timeout;
use pretty_assertions::assert_eq;

#[macro_use]
mod support;
use support::*;

/// Counts how often the session asks what to do next.
struct Counted {
    script: Script,
    queries: usize,
}

impl Counted {
    fn new(actions: Vec<Action>) -> Self {
        Self { script: Script::new(actions), queries: 0 }
    }
}

impl CommandSource for Counted {
    fn next_action(&mut self) -> godbg::Result<Action> {
        self.queries += 1;
        self.script.next_action()
    }
}

struct Outcome {
    exit: ExitType,
    stops: usize,
    queries: usize,
    out: String,
}

fn trace(threads: usize, actions: Vec<Action>) -> Result<Outcome> {
    let (path, symbols) = thread_trap();

    let mut config = Config::new();
    config.set_share_terminal(false);

    let mut commands = Counted::new(actions);
    let mut out = vec![];

    let mut session = Session::new(symbols, &config, &mut commands, &mut out);
    let mut cmd = Command::new(path);
    cmd.arg(threads.to_string()).stdout(Stdio::null());

    let exit = session.run(cmd)?;
    let stops = session.stops();
    drop(session);

    Ok(Outcome { exit, stops, queries: commands.queries, out: String::from_utf8(out)? })
}

fn hot() -> BreakTarget {
    BreakTarget::Function("hot".into())
}

#[test]
#[timeout(120000)]
fn test_threads_run_silently() -> Result<()> {
    let outcome = trace(8, vec![])?;

    assert_eq!(outcome.exit, ExitType::Exit(0));
    assert_eq!(outcome.stops, 0);

    // Only asked once, before the first resume. Clone events and the stops that start
    // each new thread are never shown.
    assert_eq!(outcome.queries, 1);
    assert_eq!(outcome.out, "");

    Ok(())
}

#[test]
#[timeout(120000)]
fn test_breakpoint_hit_resumes_to_exit() -> Result<()> {
    let outcome = trace(1, vec![Action::Break(hot()), Action::Continue])?;
    let lines: Vec<_> = outcome.out.lines().collect();

    // The thread runs the restored instruction after the stop.
    assert_eq!(outcome.exit, ExitType::Exit(0));
    assert_eq!(outcome.stops, 1);
    assert_eq!(outcome.queries, 2);

    assert!(lines[0].starts_with("Breakpoint set at hot [0x"), "{}", outcome.out);
    assert_eq!(lines[1], format!("Stopped at hot at {} in hot.rs", HOT_LINE));
    assert!(lines[2].starts_with(&format!("  #0 hot at {} in hot.rs [0x", HOT_LINE)), "{}", outcome.out);

    Ok(())
}

#[test]
#[timeout(120000)]
fn test_concurrent_hits_reported_once() -> Result<()> {
    // Several threads usually execute the trap before the first stop disarms it.
    for _ in 0..5 {
        let outcome = trace(8, vec![Action::Break(hot())])?;

        assert_eq!(outcome.exit, ExitType::Exit(0), "{}", outcome.out);
        assert_eq!(outcome.stops, 1, "{}", outcome.out);
        assert_eq!(outcome.queries, 2);

        let stopped = outcome.out.lines().filter(|line| line.starts_with("Stopped at ")).count();
        assert_eq!(stopped, 1, "{}", outcome.out);
    }

    Ok(())
}

#[test]
#[timeout(120000)]
fn test_breakpoint_at_current_pc_refused() -> Result<()> {
    let outcome = trace(1, vec![Action::Break(hot()), Action::Break(hot()), Action::Continue])?;
    let lines: Vec<_> = outcome.out.lines().collect();

    assert_eq!(outcome.exit, ExitType::Exit(0));
    assert_eq!(outcome.stops, 1);
    assert_eq!(outcome.queries, 3);

    let refused = lines.iter().find(|line| line.starts_with("Can't set breakpoint at hot [0x"));
    assert!(refused.is_some(), "{}", outcome.out);
    assert!(refused.unwrap().ends_with("the tracee is stopped there, step first"));

    Ok(())
}

#[test]
#[timeout(120000)]
fn test_step_then_rearm() -> Result<()> {
    let actions = vec![Action::Break(hot()), Action::Step, Action::Break(hot())];
    let outcome = trace(1, actions)?;

    // Once past the entry, `hot()` may be armed again. It is not called again.
    assert_eq!(outcome.exit, ExitType::Exit(0));
    assert_eq!(outcome.stops, 2);
    assert_eq!(outcome.out.matches("Breakpoint set at hot").count(), 2, "{}", outcome.out);
    assert!(!outcome.out.contains("Can't set"), "{}", outcome.out);

    Ok(())
}
