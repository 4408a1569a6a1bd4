//! # kdbg - Live Kernel Function Debugger
//!
//! kdbg attaches kprobes to running kernel functions and turns the stream of
//! entry, exit and breakpoint-hit events into an interactive debugging
//! session: continue, single step, halt, breakpoints by symbol or address,
//! registers and a reconstructed call stack. Nothing in the kernel is ever
//! paused; "stopping" freezes the view, not the CPU.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     eBPF Programs (Kernel)                      │
//! │  • kprobe function_entry / kretprobe function_exit              │
//! │  • reads CONTROL + BREAKPOINTS, filters by PID and debug mode   │
//! └───────────┬─────────────────────────────────────▲───────────────┘
//!             │ EVENTS ring buffer                   │ CONTROL / BREAKPOINTS
//!             ▼                                      │
//! ┌──────────────────────┐   ┌───────────────────────┴─────────────┐
//! │  Ingestion thread    │   │  Breakpoint Manager                 │
//! │  decode → apply      │   │  desired state → ControlSink        │
//! └──────────┬───────────┘   └───────────────────────▲─────────────┘
//!            │ Arc<Mutex<SessionState>>              │ commands
//!            ▼                                       │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Session (state machine)  ──snapshot()──▶  TUI / headless       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`contract`]: the binary event record shared with the probe; decode and
//!   validation
//! - [`probe`]: loading the probe object, attaching kprobes, kallsyms lookup
//! - [`ingest`]: record sources (ring buffer, recordings) and the ingestion
//!   thread
//! - [`breakpoints`]: breakpoint set and its reconciliation with kernel maps
//! - [`session`]: debugger state machine, shared session, command handler
//! - [`persist`]: breakpoint files
//! - [`tui`]: terminal front end
//! - [`cli`], [`preflight`], [`process_lookup`]: the binary's plumbing
//! - [`domain`]: newtypes and error enums
//!
//! ## Typical Usage
//!
//! ```bash
//! # Break on every vfs_read, probe vfs_write too
//! sudo kdbg --break vfs_read --probe vfs_write
//!
//! # Only events from one process, recorded for later
//! sudo kdbg my-app --break do_sys_openat2 --record session.kdbg
//!
//! # Step through the recording without root
//! kdbg --replay session.kdbg --replay-delay-ms 50
//! ```

pub mod breakpoints;
pub mod cli;
pub mod contract;
pub mod domain;
pub mod ingest;
pub mod persist;
pub mod preflight;
pub mod probe;
pub mod process_lookup;
pub mod session;
pub mod tui;
