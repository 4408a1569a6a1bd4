//! CLI argument definitions and validation

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::domain::{Address, Pid};

#[derive(Parser, Debug)]
#[command(
    name = "kdbg",
    about = "Live kernel function debugger: breakpoints, stepping and registers via kprobes",
    after_help = "\
EXAMPLES:
    sudo kdbg --break vfs_read                     Stop on the next vfs_read call
    sudo kdbg --pid 1234 --probe vfs_read --probe vfs_write --trace-all
    sudo kdbg nginx --break tcp_sendmsg            Only hits from the nginx process
    sudo kdbg --break vfs_read --record s.rec      Record raw events
    kdbg --replay s.rec --break 0xffffffff81001000 Replay a recording offline"
)]
pub struct Args {
    /// Process name to debug (resolved to --pid)
    #[arg(value_name = "PROCESS", conflicts_with = "pid")]
    pub process: Option<String>,

    /// Only report probe hits from this process
    #[arg(short, long)]
    pub pid: Option<u32>,

    /// Kernel function to attach entry/exit probes to (repeatable)
    #[arg(long = "probe", value_name = "FUNCTION")]
    pub probes: Vec<String>,

    /// Breakpoint on a kernel symbol or function address (repeatable); its function is probed too
    #[arg(short = 'b', long = "break", value_name = "SYMBOL|ADDR")]
    pub breaks: Vec<String>,

    /// Trace every probed function, not only breakpoints
    #[arg(long)]
    pub trace_all: bool,

    /// Load breakpoints from a JSON file; their functions are probed too
    #[arg(long = "breakpoints", value_name = "FILE")]
    pub breakpoint_file: Option<PathBuf>,

    /// Save breakpoints to a JSON file on exit
    #[arg(long, value_name = "FILE")]
    pub save_breakpoints: Option<PathBuf>,

    /// Record raw events to a file
    #[arg(long, value_name = "FILE", conflicts_with = "replay")]
    pub record: Option<PathBuf>,

    /// Replay a recording instead of attaching to the kernel
    #[arg(long, value_name = "FILE")]
    pub replay: Option<PathBuf>,

    /// Delay between replayed events in milliseconds (0 = as fast as possible)
    #[arg(long, default_value = "0", requires = "replay")]
    pub replay_delay_ms: u64,

    /// Run without TUI, printing breakpoint hits to stdout
    #[arg(long)]
    pub headless: bool,

    /// Stop after N seconds (0 = unlimited)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Upper bound on one ring buffer wait, in milliseconds
    #[arg(long, default_value = "100", value_parser = clap::value_parser!(u64).range(1..=1000))]
    pub poll_ms: u64,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

/// A `--break` argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakTarget {
    Symbol(String),
    Address(Address),
}

impl BreakTarget {
    /// Numbers (`0x…` hex or decimal) are addresses, anything else a symbol
    #[must_use]
    pub fn parse(arg: &str) -> Self {
        let looks_numeric = arg.starts_with("0x")
            || arg.starts_with("0X")
            || (!arg.is_empty() && arg.bytes().all(|b| b.is_ascii_digit()));
        match arg.parse::<Address>() {
            Ok(address) if looks_numeric => BreakTarget::Address(address),
            _ => BreakTarget::Symbol(arg.to_string()),
        }
    }
}

/// Validated run configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub process: Option<String>,
    pub pid: Option<Pid>,
    /// Functions to probe, breakpoint symbols included, without duplicates
    pub probes: Vec<String>,
    pub breaks: Vec<BreakTarget>,
    pub trace_all: bool,
    pub breakpoint_file: Option<PathBuf>,
    pub save_breakpoints: Option<PathBuf>,
    pub record: Option<PathBuf>,
    pub replay: Option<PathBuf>,
    pub replay_delay: Duration,
    pub headless: bool,
    pub duration: Option<Duration>,
    pub poll_interval: Duration,
    pub quiet: bool,
}

impl Config {
    /// # Errors
    /// Returns a usage error when the arguments cannot produce a session
    pub fn from_args(args: Args) -> Result<Self> {
        let mut breaks = Vec::with_capacity(args.breaks.len());
        for arg in &args.breaks {
            let target = BreakTarget::parse(arg);
            if let BreakTarget::Symbol(name) = &target {
                if name.is_empty() || name.chars().any(char::is_whitespace) {
                    bail!("Invalid argument: --break {arg:?} is neither a symbol nor an address");
                }
            }
            breaks.push(target);
        }

        let mut probes: Vec<String> = Vec::new();
        let symbols = breaks.iter().filter_map(|b| match b {
            BreakTarget::Symbol(name) => Some(name.clone()),
            BreakTarget::Address(_) => None,
        });
        for function in args.probes.iter().cloned().chain(symbols) {
            if !probes.contains(&function) {
                probes.push(function);
            }
        }

        if args.replay.is_none() && probes.is_empty() && args.breakpoint_file.is_none() {
            bail!(
                "Missing required argument: --probe, --break or --breakpoints\n\n\
                 Usage:\n  \
                 kdbg --break vfs_read          Break on a kernel function\n  \
                 kdbg --replay session.rec      Replay a recording\n\n\
                 Run 'kdbg --help' for more options"
            );
        }

        Ok(Self {
            process: args.process,
            pid: args.pid.map(Pid),
            probes,
            breaks,
            trace_all: args.trace_all,
            breakpoint_file: args.breakpoint_file,
            save_breakpoints: args.save_breakpoints,
            record: args.record,
            replay: args.replay,
            replay_delay: Duration::from_millis(args.replay_delay_ms),
            headless: args.headless,
            duration: (args.duration > 0).then(|| Duration::from_secs(args.duration)),
            poll_interval: Duration::from_millis(args.poll_ms),
            quiet: args.quiet,
        })
    }

    #[must_use]
    pub fn is_replay(&self) -> bool {
        self.replay.is_some()
    }
}
