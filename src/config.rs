use crate::cmd::BreakTarget;

pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Entry point of every Go program, and the outermost frame shown by default.
pub const MAIN_FUNCTION: &str = "main.main";

/// Session settings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Maximum number of frames in a printed call stack.
    max_depth: usize,

    /// Stack walks stop after this function's frame.
    root_function: Option<String>,

    /// Armed before the tracee first runs.
    breakpoint: Option<BreakTarget>,

    /// Hand the controlling terminal to the tracee while it runs.
    share_terminal: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            root_function: Some(MAIN_FUNCTION.to_owned()),
            breakpoint: None,
            share_terminal: true,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn set_max_depth(&mut self, max_depth: usize) {
        self.max_depth = max_depth;
    }

    pub fn root_function(&self) -> Option<&str> {
        self.root_function.as_deref()
    }

    /// Set the outermost function of printed stacks, or `None` to walk to the bottom.
    pub fn set_root_function(&mut self, root_function: Option<String>) {
        self.root_function = root_function;
    }

    pub fn breakpoint(&self) -> Option<&BreakTarget> {
        self.breakpoint.as_ref()
    }

    pub fn set_breakpoint(&mut self, breakpoint: Option<BreakTarget>) {
        self.breakpoint = breakpoint;
    }

    pub fn share_terminal(&self) -> bool {
        self.share_terminal
    }

    pub fn set_share_terminal(&mut self, share_terminal: bool) {
        self.share_terminal = share_terminal;
    }
}
