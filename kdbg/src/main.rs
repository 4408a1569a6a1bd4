//! # kdbg - Main Entry Point
//!
//! Supports two sources and two front ends:
//! - **Live** (`--probe <fn>` / `--break <fn>`): kprobes on running kernel functions
//! - **Replay** (`--replay <file>`): a recording made earlier with `--record`
//! - **TUI** (default): interactive debugger
//! - **Headless** (`--headless`): breakpoint hits printed to stdout
//!
//! ## Flow
//!
//! 1. Parse and validate arguments, resolve the target process
//! 2. Pre-flight checks (live only)
//! 3. Load the probe object, take its maps, attach kprobes
//! 4. Install breakpoints (`--break`, `--breakpoints`, `--trace-all`)
//! 5. Spawn the ingestion thread, run the front end until it ends
//! 6. Join ingestion, print counters, save breakpoints, detach

#![allow(clippy::too_many_lines)]

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{bounded, Receiver};
use log::{info, warn};

use kdbg::breakpoints::ControlMirror;
use kdbg::cli::{Args, BreakTarget, Config};
use kdbg::domain::{Address, Pid};
use kdbg::ingest::{IngestionHandle, IngestionService, RecordSource, RecordWriter, ReplaySource};
use kdbg::persist::{load_breakpoints, save_breakpoints};
use kdbg::preflight::run_preflight_checks;
use kdbg::probe::{
    init_ebpf_logger, load_ebpf_program, print_diagnostics, take_event_source, EbpfControl,
    KernelSymbols, KprobeAttacher,
};
use kdbg::process_lookup::find_process_by_name;
use kdbg::session::{Debugger, SessionNotice, SessionState, SharedSession};
use kdbg::tui;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

/// Capacity of the notice channel between ingestion and the front end
const NOTICE_CAPACITY: usize = 256;

/// Headless mode logs ingestion counters this often
const STATS_INTERVAL: Duration = Duration::from_secs(10);

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied") || msg.contains("requires root") {
        EXIT_NOPERM
    } else if msg.contains("missing required argument") || msg.contains("invalid argument") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

/// PID to filter on: `PROCESS` by name, `--pid`, or every process
fn resolve_target(config: &Config) -> Result<Option<Pid>> {
    if let Some(name) = &config.process {
        let info = find_process_by_name(name)?;
        info!("Resolved {name} to {} ({})", info.pid, info.command);
        return Ok(Some(info.pid));
    }
    Ok(config.pid)
}

/// Turn `--break` targets into addresses, naming raw addresses where possible
fn resolve_breaks(
    breaks: &[BreakTarget],
    symbols: Option<&KernelSymbols>,
) -> Vec<(Address, String)> {
    breaks
        .iter()
        .filter_map(|target| match target {
            BreakTarget::Symbol(name) => {
                let address =
                    symbols.and_then(|s| s.address_of(name)).filter(|a| a.value() != 0);
                if address.is_none() {
                    warn!("Cannot resolve breakpoint symbol {name}, skipping");
                }
                address.map(|a| (a, name.clone()))
            }
            BreakTarget::Address(address) => {
                let symbol = symbols
                    .and_then(|s| s.resolve(*address))
                    .map(|(sym, offset)| {
                        if offset == 0 {
                            sym.name.clone()
                        } else {
                            format!("{}+{offset:#x}", sym.name)
                        }
                    })
                    .unwrap_or_default();
                Some((*address, symbol))
            }
        })
        .collect()
}

/// A breakpoint to install: address, symbol, enabled
type Wanted = (Address, String, bool);

/// `--break` targets followed by the `--breakpoints` file
fn wanted_breakpoints(config: &Config, breaks: Vec<(Address, String)>) -> Result<Vec<Wanted>> {
    let mut wanted: Vec<Wanted> =
        breaks.into_iter().map(|(address, symbol)| (address, symbol, true)).collect();

    if let Some(path) = &config.breakpoint_file {
        let saved = load_breakpoints(path)
            .with_context(|| format!("Failed to load breakpoints from {}", path.display()))?;
        info!("Loaded {} breakpoints from {}", saved.len(), path.display());
        wanted.extend(saved.into_iter().map(|bp| (bp.address, bp.symbol, bp.enabled)));
    }
    Ok(wanted)
}

// ============================================================================
// Session setup
// ============================================================================

fn setup_live(
    config: &Config,
    session: &SharedSession,
) -> Result<(Debugger, Box<dyn RecordSource>, Vec<Wanted>)> {
    let mut bpf = load_ebpf_program()?;
    init_ebpf_logger(&mut bpf);

    let source = take_event_source(&mut bpf)?;
    let control = EbpfControl::take(&mut bpf)?;

    let symbols = KernelSymbols::load().context("Failed to read /proc/kallsyms")?;
    if symbols.addresses_hidden() {
        warn!("kallsyms addresses are hidden (kptr_restrict), breakpoints by symbol unavailable");
    }
    info!("Loaded {} kernel text symbols", symbols.len());
    let wanted = wanted_breakpoints(config, resolve_breaks(&config.breaks, Some(&symbols)))?;

    // Every breakpoint needs a probe on its function to ever fire
    let probes = symbols
        .probe_set(&config.probes, wanted.iter().map(|(address, ..)| *address))
        .context("Invalid argument: breakpoint cannot be probed")?;

    let attacher = KprobeAttacher::new(bpf, symbols)?;
    let mut debugger =
        Debugger::new(session.clone(), Box::new(control)).with_attacher(Box::new(attacher));

    for function in &probes {
        // Logged and recorded in the session's probe status
        let _ = debugger.attach(function);
    }
    if debugger.handles().is_empty() {
        warn!("No probe attached, the session will not see any events");
    }

    Ok((debugger, Box::new(source), wanted))
}

fn setup_replay(
    config: &Config,
    path: &Path,
    session: &SharedSession,
) -> Result<(Debugger, Box<dyn RecordSource>, Vec<Wanted>)> {
    let source = ReplaySource::open(path)
        .with_context(|| format!("Failed to open recording {}", path.display()))?
        .with_pace(config.replay_delay);

    // Symbols only name breakpoints here; hidden addresses resolve nothing
    let symbols = if config.breaks.is_empty() {
        None
    } else {
        KernelSymbols::load()
            .map_err(|e| warn!("Failed to read /proc/kallsyms: {e}"))
            .ok()
    };
    let wanted = wanted_breakpoints(config, resolve_breaks(&config.breaks, symbols.as_ref()))?;

    let debugger = Debugger::new(session.clone(), Box::new(ControlMirror::new()));
    debugger.mark_replay()?;
    Ok((debugger, Box::new(source), wanted))
}

fn install_breakpoints(
    debugger: &mut Debugger,
    config: &Config,
    wanted: Vec<Wanted>,
) -> Result<()> {
    for (address, symbol, enabled) in wanted {
        let result = debugger
            .set_breakpoint(address, symbol)
            .and_then(|()| if enabled { Ok(true) } else { debugger.toggle_breakpoint(address) });
        match result {
            Ok(_) => {}
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => warn!("Breakpoint at {address}: {e}"),
        }
    }

    if config.trace_all {
        debugger.toggle_tracing()?;
    }

    // Repairs any publish that failed above
    debugger.sync_control().context("Failed to publish breakpoints to the kernel")?;
    Ok(())
}

// ============================================================================
// Supervision
// ============================================================================

/// Why the session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Interrupted,
    DurationReached,
    ProcessExited,
    ReplayFinished,
    SessionEnded,
}

impl fmt::Display for Stop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stop::Interrupted => "interrupted",
            Stop::DurationReached => "duration limit reached",
            Stop::ProcessExited => "process exited",
            Stop::ReplayFinished => "replay finished",
            Stop::SessionEnded => "session ended",
        })
    }
}

struct Watch<'a> {
    running: &'a AtomicBool,
    ingestion: &'a IngestionHandle,
    target: Option<Pid>,
    deadline: Option<Instant>,
    /// Stop once a finite source ran dry
    stop_when_drained: bool,
}

/// Wait until something ends the session, calling `on_tick` every 100ms
async fn supervise(watch: Watch<'_>, mut on_tick: impl FnMut() -> Result<()>) -> Result<Stop> {
    let proc_path = watch.target.map(|pid| format!("/proc/{}", pid.0));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        on_tick()?;

        if !watch.running.load(Ordering::Acquire) {
            return Ok(Stop::SessionEnded);
        }
        if watch.stop_when_drained && watch.ingestion.is_finished() {
            return Ok(Stop::ReplayFinished);
        }
        if watch.deadline.is_some_and(|d| Instant::now() >= d) {
            return Ok(Stop::DurationReached);
        }
        if proc_path.as_ref().is_some_and(|p| !Path::new(p).exists()) {
            return Ok(Stop::ProcessExited);
        }

        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(100)) => {}
            _ = &mut ctrl_c => return Ok(Stop::Interrupted),
        }
    }
}

/// Print notices as they come; a session stopped at a breakpoint resumes
///
/// Resuming follows the session state, so a notice lost to a full channel
/// still does not leave the session parked at a breakpoint.
fn headless_tick<'a>(
    debugger: &'a Debugger,
    notices: &'a Receiver<SessionNotice>,
) -> impl FnMut() -> Result<()> + 'a {
    let mut last_stats = Instant::now();
    move || {
        while let Ok(notice) = notices.try_recv() {
            println!("{notice}");
        }
        debugger.resume_from_breakpoint()?;
        if last_stats.elapsed() >= STATS_INTERVAL {
            let counters = debugger.session().stats().counters();
            info!(
                "{} records, {} applied, {} malformed, {} dropped by the kernel",
                counters.records, counters.applied, counters.malformed, counters.kernel_dropped
            );
            last_stats = Instant::now();
        }
        Ok(())
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let config = Config::from_args(Args::parse())?;
    let quiet = config.quiet;
    let target = resolve_target(&config)?;

    if !config.is_replay() {
        run_preflight_checks(target)?;
    }

    if !quiet {
        println!("kdbg v{}", env!("CARGO_PKG_VERSION"));
        match &config.replay {
            Some(path) => println!("replay: {}", path.display()),
            None if config.probes.is_empty() => println!("probes: from breakpoints"),
            None => println!("probes: {}", config.probes.join(", ")),
        }
        match target {
            Some(pid) => println!("pid: {}", pid.0),
            None => println!("pid: all"),
        }
    }

    // ── Session and source ──────────────────────────────────────────────
    let session = SharedSession::new(SessionState::new(target));
    let (mut debugger, source, wanted) = match &config.replay {
        Some(path) => setup_replay(&config, path, &session)?,
        None => setup_live(&config, &session)?,
    };
    install_breakpoints(&mut debugger, &config, wanted)?;

    // ── Ingestion ───────────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let (notice_tx, notice_rx) = bounded(NOTICE_CAPACITY);
    let mut service = IngestionService::new(session.clone(), Arc::clone(&running))
        .with_poll_interval(config.poll_interval)
        .with_notices(notice_tx);
    if let Some(path) = &config.record {
        let recorder = RecordWriter::create(path)
            .with_context(|| format!("Failed to create recording {}", path.display()))?;
        service = service.with_recorder(recorder);
        if !quiet {
            println!("recording: {}", path.display());
        }
    }
    let ingestion = service.spawn(source).context("Failed to spawn ingestion thread")?;

    let started = Instant::now();
    let watch = Watch {
        running: &running,
        ingestion: &ingestion,
        target: if config.is_replay() { None } else { target },
        deadline: config.duration.map(|d| started + d),
        stop_when_drained: config.headless && config.is_replay(),
    };

    // ── Front end ───────────────────────────────────────────────────────
    let (stop, debugger, front_end_error) = if config.headless {
        debugger.continue_execution()?;
        let stop = supervise(watch, headless_tick(&debugger, &notice_rx)).await;
        (stop, Some(debugger), None)
    } else {
        let tui_running = Arc::clone(&running);
        let tui_task = tokio::task::spawn_blocking(move || {
            tui::run_live(debugger, notice_rx, tui_running)
        });
        let stop = supervise(watch, || Ok(())).await;
        running.store(false, Ordering::Release);

        match tui_task.await {
            Ok(Ok(debugger)) => (stop, Some(debugger), None),
            Ok(Err(e)) => (stop, None, Some(e)),
            Err(e) => (stop, None, Some(anyhow::anyhow!("TUI thread failed: {e}"))),
        }
    };

    // ── Shutdown ────────────────────────────────────────────────────────
    ingestion.shutdown();
    let summary = ingestion.join();
    let stop = stop?;

    if !quiet || config.headless {
        eprintln!("\n{stop}: {:.1}s", started.elapsed().as_secs_f64());
        if let Ok(summary) = &summary {
            print_diagnostics(summary);
        }
    }

    if let Some(mut debugger) = debugger {
        if let Some(path) = &config.save_breakpoints {
            let breakpoints = debugger.snapshot()?.breakpoints;
            save_breakpoints(path, &breakpoints)
                .with_context(|| format!("Failed to save breakpoints to {}", path.display()))?;
            if !quiet {
                println!("saved {} breakpoints: {}", breakpoints.len(), path.display());
            }
        }
        debugger.detach_all();
    }

    if let Some(e) = front_end_error {
        return Err(e);
    }
    summary.context("Ingestion failed")?;
    Ok(())
}
