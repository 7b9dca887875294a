use std::io;
use std::path::PathBuf;
use std::process::{self, Command};

use anyhow::{Context, Result};
use godbg::{BreakTarget, Config, Prompt, Session, SymbolTable};
use structopt::StructOpt;
use tracing::info;

/// Trace a Go program, reporting the source position and call stack at every stop.
#[derive(StructOpt, Debug)]
struct Opt {
    /// Breakpoint armed before the program starts: 0x<addr>, <function>, <file>:<line>
    /// or <line> (in the file of `main.main`).
    #[structopt(short, long = "break")]
    breakpoint: Option<BreakTarget>,

    /// Maximum number of frames printed per stop.
    #[structopt(long, default_value = "64")]
    max_depth: usize,

    /// Outermost function shown in call stacks.
    #[structopt(long, default_value = "main.main")]
    root: String,

    /// Walk call stacks through the runtime, past the root function.
    #[structopt(long)]
    no_root: bool,

    /// Go executable to launch and trace.
    #[structopt(parse(from_os_str))]
    target: PathBuf,
}

fn main() {
    let opt = Opt::from_args();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    if let Err(err) = run(opt) {
        eprintln!("error: {:#}", err);
        process::exit(1);
    }
}

impl Opt {
    fn config(&self) -> Config {
        let mut config = Config::new();
        config.set_max_depth(self.max_depth);
        config.set_root_function(if self.no_root { None } else { Some(self.root.clone()) });
        config.set_breakpoint(self.breakpoint.clone());

        config
    }
}

fn run(opt: Opt) -> Result<()> {
    let config = opt.config();
    let target = opt.target;

    let symbols = SymbolTable::load(&target)
        .with_context(|| format!("could not load symbols from {}", target.display()))?;

    let cmd = Command::new(&target);
    let mut session = Session::new(symbols, &config, Prompt::stdio(), io::stdout());

    let exit = session
        .run(cmd)
        .with_context(|| format!("lost control of {}", target.display()))?;
    info!(?exit, stops = session.stops(), "tracee terminated");

    Ok(())
}
