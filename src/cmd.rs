//! Operator commands, consulted each time the tracee reports a breakpoint or step stop.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, BufRead, Write};
use std::str::FromStr;

use crate::error::Result;

const PROMPT: &str = "(C)ontinue, (S)tep or set (B)reakpoint? > ";
const LOCATION_PROMPT: &str = "  Enter breakpoint location: > ";

/// What the operator wants done with the stopped tracee.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Action {
    Continue,
    Step,

    /// Arm a breakpoint, then continue.
    Break(BreakTarget),
}

/// Where to place a breakpoint, before symbol resolution.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BreakTarget {
    Address(u64),
    Function(String),

    /// A source line. Without a file, the file of `main.main` is assumed.
    Line { file: Option<String>, line: u32 },
}

#[derive(thiserror::Error, Debug, Eq, PartialEq)]
#[error("Invalid breakpoint location `{0}`: expected 0x<addr>, <function>, <file>:<line> or <line>")]
pub struct ParseTargetError(String);

impl FromStr for BreakTarget {
    type Err = ParseTargetError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || ParseTargetError(s.to_owned());

        if s.is_empty() || s.contains(char::is_whitespace) {
            return Err(invalid());
        }

        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            let addr = u64::from_str_radix(hex, 16).map_err(|_| invalid())?;
            return Ok(BreakTarget::Address(addr));
        }

        if s.bytes().all(|b| b.is_ascii_digit()) {
            let line = parse_line(s).ok_or_else(invalid)?;
            return Ok(BreakTarget::Line { file: None, line });
        }

        if let Some((file, line)) = s.rsplit_once(':') {
            let line = parse_line(line).ok_or_else(invalid)?;
            if file.is_empty() {
                return Err(invalid());
            }
            return Ok(BreakTarget::Line { file: Some(file.to_owned()), line });
        }

        Ok(BreakTarget::Function(s.to_owned()))
    }
}

fn parse_line(s: &str) -> Option<u32> {
    s.parse().ok().filter(|&line| line > 0)
}

impl fmt::Display for BreakTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakTarget::Address(addr) => write!(f, "{:#x}", addr),
            BreakTarget::Function(name) => write!(f, "{}", name),
            BreakTarget::Line { file: Some(file), line } => write!(f, "{}:{}", file, line),
            BreakTarget::Line { file: None, line } => write!(f, "{}", line),
        }
    }
}

/// Source of the next [`Action`] at each stop.
pub trait CommandSource {
    fn next_action(&mut self) -> Result<Action>;
}

/// Interactive commands read line by line from `input`, prompting on `output`.
///
/// Accepts `c`, `s`, and `b <location>` (or `b` alone, then the location on its own
/// line), case-insensitively. At end of input the tracee is left to run to completion.
pub struct Prompt<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> Prompt<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    pub fn into_parts(self) -> (R, W) {
        (self.input, self.output)
    }

    fn read_line(&mut self, prompt: &str) -> Result<Option<String>> {
        write!(self.output, "{}", prompt)?;
        self.output.flush()?;

        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(None);
        }

        Ok(Some(line.trim().to_owned()))
    }
}

impl Prompt<io::StdinLock<'static>, io::Stdout> {
    pub fn stdio() -> Self {
        Self::new(io::stdin().lock(), io::stdout())
    }
}

impl<R: BufRead, W: Write> CommandSource for Prompt<R, W> {
    fn next_action(&mut self) -> Result<Action> {
        loop {
            let input = match self.read_line(PROMPT)? {
                Some(input) => input,
                None => return Ok(Action::Continue),
            };

            let (command, rest) = match input.split_once(char::is_whitespace) {
                Some((command, rest)) => (command, rest.trim()),
                None => (input.as_str(), ""),
            };

            let location = match command.to_ascii_lowercase().as_str() {
                "c" | "continue" => return Ok(Action::Continue),
                "s" | "step" => return Ok(Action::Step),
                "b" | "break" if !rest.is_empty() => rest.to_owned(),
                "b" | "break" => match self.read_line(LOCATION_PROMPT)? {
                    Some(location) => location,
                    None => return Ok(Action::Continue),
                },
                _ => {
                    writeln!(self.output, "Unexpected input `{}`", input)?;
                    continue;
                },
            };

            match location.parse() {
                Ok(target) => return Ok(Action::Break(target)),
                Err(err) => writeln!(self.output, "{}", err)?,
            }
        }
    }
}

/// A fixed sequence of actions. Once exhausted, every stop is continued.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Script {
    actions: VecDeque<Action>,
}

impl Script {
    pub fn new(actions: impl IntoIterator<Item = Action>) -> Self {
        let actions = actions.into_iter().collect();
        Self { actions }
    }

    pub fn remaining(&self) -> usize {
        self.actions.len()
    }
}

impl CommandSource for Script {
    fn next_action(&mut self) -> Result<Action> {
        Ok(self.actions.pop_front().unwrap_or(Action::Continue))
    }
}

impl<C: CommandSource + ?Sized> CommandSource for &mut C {
    fn next_action(&mut self) -> Result<Action> {
        (**self).next_action()
    }
}
