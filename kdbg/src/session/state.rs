//! # Session State
//!
//! Everything the front end displays, plus the breakpoint set. One instance
//! lives behind the session lock (see [`super::SharedSession`]).
//!
//! ## Debug States
//!
//! ```text
//!            continue              breakpoint-hit (enabled)
//!  Stopped ───────────▶ Running ─────────────────────────▶ AtBreakpoint
//!     ▲                   │  ▲                                  │
//!     │ halt              │  └──────────── continue ────────────┘
//!     └───────────────────┘
//!
//!  step (any state) ──▶ Stepping ── next event ──▶ AtBreakpoint | Stopped
//! ```
//!
//! A breakpoint hit on an enabled breakpoint also moves `Stopped` to
//! `AtBreakpoint`. Nothing else changes the state without a command.
//!
//! ## Location Freezing
//!
//! The displayed location (function, address, registers, call stack) follows
//! every event while `Running`. In `Stopped` and `AtBreakpoint` it is frozen so
//! the user can inspect it; only the transitions above update it.

use std::collections::VecDeque;
use std::fmt;
use std::fmt::Write as _;

use kdbg_common::{RegisterSnapshot, REGISTER_COUNT};

use crate::breakpoints::{Breakpoint, BreakpointManager};
use crate::contract::{EventKind, ProbeEvent, RegisterConfidence};
use crate::domain::{Address, CpuId, Pid, Tid};
use crate::ingest::IngestCounters;

/// Maximum tracked call depth of the focused thread
pub const MAX_CALL_DEPTH: usize = 64;

/// Lines kept for the log view
pub const LOG_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebugState {
    #[default]
    Stopped,
    Running,
    AtBreakpoint,
    Stepping,
}

impl fmt::Display for DebugState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DebugState::Stopped => "STOPPED",
            DebugState::Running => "RUNNING",
            DebugState::AtBreakpoint => "AT BREAKPOINT",
            DebugState::Stepping => "STEPPING",
        })
    }
}

const VIEW_COUNT: usize = 4;

/// Scrollable panels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Registers,
    Stack,
    Breakpoints,
    Log,
}

impl View {
    pub const ALL: [View; VIEW_COUNT] =
        [View::Registers, View::Stack, View::Breakpoints, View::Log];

    #[must_use]
    pub fn next(self) -> Self {
        match self {
            View::Registers => View::Stack,
            View::Stack => View::Breakpoints,
            View::Breakpoints => View::Log,
            View::Log => View::Registers,
        }
    }

    const fn index(self) -> usize {
        match self {
            View::Registers => 0,
            View::Stack => 1,
            View::Breakpoints => 2,
            View::Log => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub function: String,
    pub address: Address,
}

/// Where probes are installed, or why they are not
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeStatus {
    /// Functions with both entry and exit probes attached
    pub attached: Vec<String>,
    /// Attach failures, newest last
    pub failures: Vec<String>,
    /// Events come from a recording instead of the kernel
    pub replay: bool,
}

impl ProbeStatus {
    /// Live session without a single working probe
    #[must_use]
    pub fn degraded(&self) -> bool {
        !self.replay && self.attached.is_empty()
    }
}

/// Something the front end may want to announce
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    BreakpointHit { address: Address, function: String },
    StepComplete { address: Address, function: String, state: DebugState },
}

impl fmt::Display for SessionNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionNotice::BreakpointHit { address, function } => {
                write!(f, "breakpoint hit: {function} at {address}")
            }
            SessionNotice::StepComplete { address, function, state } => {
                write!(f, "stepped to {function} at {address} [{state}]")
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionState {
    pub(crate) debug_state: DebugState,
    pub(crate) breakpoints: BreakpointManager,

    current_function: String,
    current_address: Address,
    registers: RegisterSnapshot,
    register_confidence: RegisterConfidence,
    last_return: Option<u64>,
    pid: Pid,
    tid: Tid,
    cpu: CpuId,

    focus_tid: Option<Tid>,
    call_stack: Vec<StackFrame>,

    update_counter: u64,
    events_applied: u64,
    breakpoint_hits: u64,

    pub(crate) probe_status: ProbeStatus,
    scroll: [usize; VIEW_COUNT],
    log: VecDeque<String>,
}

impl SessionState {
    #[must_use]
    pub fn new(target_pid: Option<Pid>) -> Self {
        Self { breakpoints: BreakpointManager::new(target_pid), ..Self::default() }
    }

    #[must_use]
    pub fn debug_state(&self) -> DebugState {
        self.debug_state
    }

    #[must_use]
    pub fn breakpoints(&self) -> &BreakpointManager {
        &self.breakpoints
    }

    #[must_use]
    pub fn current_address(&self) -> Address {
        self.current_address
    }

    #[must_use]
    pub fn update_counter(&self) -> u64 {
        self.update_counter
    }

    /// Apply one ingested event
    pub fn apply_event(&mut self, event: &ProbeEvent) -> Option<SessionNotice> {
        self.events_applied += 1;
        self.push_log(format_event(event));

        let hit =
            event.kind == EventKind::BreakpointHit && self.breakpoints.record_hit(event.address);
        if hit {
            self.breakpoint_hits += 1;
        }

        match self.debug_state {
            DebugState::Running => {
                self.update_location(event);
                if hit {
                    self.debug_state = DebugState::AtBreakpoint;
                    return Some(SessionNotice::BreakpointHit {
                        address: event.address,
                        function: event.display_name(),
                    });
                }
                None
            }
            DebugState::Stepping => {
                self.update_location(event);
                self.debug_state = if self.breakpoints.is_enabled(event.address) {
                    DebugState::AtBreakpoint
                } else {
                    DebugState::Stopped
                };
                Some(SessionNotice::StepComplete {
                    address: event.address,
                    function: event.display_name(),
                    state: self.debug_state,
                })
            }
            DebugState::Stopped if hit => {
                self.update_location(event);
                self.debug_state = DebugState::AtBreakpoint;
                Some(SessionNotice::BreakpointHit {
                    address: event.address,
                    function: event.display_name(),
                })
            }
            DebugState::Stopped | DebugState::AtBreakpoint => None,
        }
    }

    pub fn continue_execution(&mut self) -> DebugState {
        self.debug_state = DebugState::Running;
        self.debug_state
    }

    pub fn step(&mut self) -> DebugState {
        self.debug_state = DebugState::Stepping;
        self.debug_state
    }

    pub fn halt(&mut self) -> DebugState {
        self.debug_state = DebugState::Stopped;
        self.debug_state
    }

    /// Move a view's cursor by `delta`, clamped to the view's content
    pub fn scroll(&mut self, view: View, delta: isize) -> usize {
        let max = self.view_len(view).saturating_sub(1);
        let cursor = &mut self.scroll[view.index()];
        *cursor = cursor.saturating_add_signed(delta).min(max);
        *cursor
    }

    /// Pull every cursor back inside its view after content shrank
    pub fn clamp_cursors(&mut self) {
        for view in View::ALL {
            let max = self.view_len(view).saturating_sub(1);
            let cursor = &mut self.scroll[view.index()];
            *cursor = (*cursor).min(max);
        }
    }

    pub fn push_log(&mut self, line: String) {
        if self.log.len() == LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back(line);
    }

    /// Owned copy for display; ingestion counters are filled by the caller
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            debug_state: self.debug_state,
            current_function: self.current_function.clone(),
            current_address: self.current_address,
            registers: self.registers,
            register_confidence: self.register_confidence,
            last_return: self.last_return,
            pid: self.pid,
            tid: self.tid,
            cpu: self.cpu,
            call_stack: self.call_stack.clone(),
            breakpoints: self.breakpoints.list(),
            trace_all: self.breakpoints.trace_all(),
            update_counter: self.update_counter,
            events_applied: self.events_applied,
            breakpoint_hits: self.breakpoint_hits,
            probe_status: self.probe_status.clone(),
            scroll: self.scroll,
            log: self.log.iter().cloned().collect(),
            ingest: IngestCounters::default(),
        }
    }

    fn view_len(&self, view: View) -> usize {
        match view {
            View::Registers => REGISTER_COUNT,
            View::Stack => self.call_stack.len(),
            View::Breakpoints => self.breakpoints.len(),
            View::Log => self.log.len(),
        }
    }

    fn update_location(&mut self, event: &ProbeEvent) {
        self.current_function = event.display_name();
        self.current_address = event.address;
        self.registers = event.registers.unwrap_or_default();
        self.register_confidence = event.confidence;
        self.pid = event.pid;
        self.tid = event.tid;
        self.cpu = event.cpu;
        if event.kind == EventKind::Exit {
            self.last_return = event.return_value;
        }
        self.track_call(event);
        self.update_counter += 1;
    }

    /// Best-effort call stack of the focused thread
    ///
    /// Switching threads restarts the stack. Exits pop back to the matching
    /// frame and are ignored when no frame matches.
    fn track_call(&mut self, event: &ProbeEvent) {
        if self.focus_tid != Some(event.tid) {
            self.focus_tid = Some(event.tid);
            self.call_stack.clear();
        }

        match event.kind {
            EventKind::Entry | EventKind::BreakpointHit => {
                if self.call_stack.len() == MAX_CALL_DEPTH {
                    self.call_stack.remove(0);
                }
                self.call_stack.push(StackFrame {
                    function: event.display_name(),
                    address: event.address,
                });
            }
            EventKind::Exit => {
                if let Some(depth) =
                    self.call_stack.iter().rposition(|frame| frame.address == event.address)
                {
                    self.call_stack.truncate(depth);
                }
            }
        }
        self.clamp_cursors();
    }
}

fn format_event(event: &ProbeEvent) -> String {
    let mut line = format!(
        "[{:>12.6}] {} {} {} {:<10} {}",
        event.timestamp.as_seconds(),
        event.cpu,
        event.pid,
        event.tid,
        event.kind,
        event.display_name(),
    );
    if let Some(ret) = event.return_value {
        let _ = write!(line, " = {ret:#x}");
    }
    line
}

/// Consistent, owned copy of the session for rendering
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub debug_state: DebugState,
    pub current_function: String,
    pub current_address: Address,
    pub registers: RegisterSnapshot,
    pub register_confidence: RegisterConfidence,
    pub last_return: Option<u64>,
    pub pid: Pid,
    pub tid: Tid,
    pub cpu: CpuId,
    /// Outermost frame first
    pub call_stack: Vec<StackFrame>,
    pub breakpoints: Vec<Breakpoint>,
    pub trace_all: bool,
    /// Incremented once per location update
    pub update_counter: u64,
    pub events_applied: u64,
    pub breakpoint_hits: u64,
    pub probe_status: ProbeStatus,
    pub scroll: [usize; VIEW_COUNT],
    pub log: Vec<String>,
    pub ingest: IngestCounters,
}

impl SessionSnapshot {
    #[must_use]
    pub fn scroll_of(&self, view: View) -> usize {
        self.scroll[view.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Timestamp;

    fn event(kind: EventKind, address: u64, tid: u32) -> ProbeEvent {
        ProbeEvent {
            timestamp: Timestamp(1),
            pid: Pid(100),
            tid: Tid(tid),
            cpu: CpuId(0),
            kind,
            function: format!("fn_{address:x}"),
            address: Address(address),
            return_value: (kind == EventKind::Exit).then_some(0),
            registers: Some(RegisterSnapshot::splat(address)),
            confidence: RegisterConfidence::Full,
        }
    }

    fn state_with_breakpoint(address: u64) -> SessionState {
        let mut state = SessionState::new(None);
        state.breakpoints.add(Address(address), "bp").unwrap();
        state
    }

    #[test]
    fn test_cursors_follow_shrinking_content() {
        let mut state = state_with_breakpoint(0x1000);
        state.breakpoints.add(Address(0x2000), "bp2").unwrap();
        assert_eq!(state.scroll(View::Breakpoints, 5), 1);

        state.breakpoints.remove(Address(0x2000)).unwrap();
        state.clamp_cursors();
        assert_eq!(state.snapshot().scroll_of(View::Breakpoints), 0);

        state.breakpoints.remove(Address(0x1000)).unwrap();
        state.clamp_cursors();
        assert_eq!(state.snapshot().scroll_of(View::Breakpoints), 0);
    }

    #[test]
    fn test_initial_state_is_stopped() {
        assert_eq!(SessionState::new(None).debug_state(), DebugState::Stopped);
    }

    #[test]
    fn test_stopped_ignores_non_breakpoint_events() {
        let mut state = state_with_breakpoint(0x1000);
        for kind in [EventKind::Entry, EventKind::Exit] {
            assert!(state.apply_event(&event(kind, 0x1000, 1)).is_none());
        }
        // Hit on an address without a breakpoint
        assert!(state.apply_event(&event(EventKind::BreakpointHit, 0x2000, 1)).is_none());
        assert_eq!(state.debug_state(), DebugState::Stopped);
        assert_eq!(state.update_counter(), 0);
    }

    #[test]
    fn test_stopped_moves_to_breakpoint_on_enabled_hit() {
        let mut state = state_with_breakpoint(0x1000);
        let notice = state.apply_event(&event(EventKind::BreakpointHit, 0x1000, 1));
        assert!(matches!(notice, Some(SessionNotice::BreakpointHit { .. })));
        assert_eq!(state.debug_state(), DebugState::AtBreakpoint);
        assert_eq!(state.current_address(), Address(0x1000));
    }

    #[test]
    fn test_disabled_breakpoint_does_not_stop() {
        let mut state = state_with_breakpoint(0x1000);
        state.breakpoints.toggle(Address(0x1000), false).unwrap();
        state.continue_execution();
        state.apply_event(&event(EventKind::BreakpointHit, 0x1000, 1));
        assert_eq!(state.debug_state(), DebugState::Running);
    }

    #[test]
    fn test_running_follows_every_event() {
        let mut state = SessionState::new(None);
        state.continue_execution();
        state.apply_event(&event(EventKind::Entry, 0x1000, 1));
        state.apply_event(&event(EventKind::Entry, 0x2000, 1));

        let snapshot = state.snapshot();
        assert_eq!(snapshot.current_function, "fn_2000");
        assert_eq!(snapshot.registers, RegisterSnapshot::splat(0x2000));
        assert_eq!(snapshot.update_counter, 2);
        assert_eq!(snapshot.call_stack.len(), 2);
    }

    #[test]
    fn test_at_breakpoint_freezes_location() {
        let mut state = state_with_breakpoint(0x1000);
        state.continue_execution();
        state.apply_event(&event(EventKind::BreakpointHit, 0x1000, 1));
        state.apply_event(&event(EventKind::Entry, 0x3000, 1));

        assert_eq!(state.debug_state(), DebugState::AtBreakpoint);
        assert_eq!(state.current_address(), Address(0x1000));
        assert_eq!(state.snapshot().events_applied, 2);
    }

    #[test]
    fn test_step_lands_on_next_event() {
        let mut state = state_with_breakpoint(0x1000);
        state.step();
        let notice = state.apply_event(&event(EventKind::Entry, 0x2000, 1));
        assert_eq!(
            notice,
            Some(SessionNotice::StepComplete {
                address: Address(0x2000),
                function: "fn_2000".into(),
                state: DebugState::Stopped,
            })
        );

        state.step();
        state.apply_event(&event(EventKind::Entry, 0x1000, 1));
        assert_eq!(state.debug_state(), DebugState::AtBreakpoint);
    }

    #[test]
    fn test_call_stack_pops_on_exit_and_resets_on_thread_switch() {
        let mut state = SessionState::new(None);
        state.continue_execution();
        state.apply_event(&event(EventKind::Entry, 0x1000, 1));
        state.apply_event(&event(EventKind::Entry, 0x2000, 1));
        state.apply_event(&event(EventKind::Exit, 0x2000, 1));
        assert_eq!(state.snapshot().call_stack.len(), 1);
        assert_eq!(state.snapshot().last_return, Some(0));

        state.apply_event(&event(EventKind::Entry, 0x3000, 2));
        let stack = state.snapshot().call_stack;
        assert_eq!(stack.len(), 1);
        assert_eq!(stack[0].address, Address(0x3000));
    }

    #[test]
    fn test_call_stack_depth_is_bounded() {
        let mut state = SessionState::new(None);
        state.continue_execution();
        for i in 0..(MAX_CALL_DEPTH as u64 + 10) {
            state.apply_event(&event(EventKind::Entry, 0x1000 + i, 1));
        }
        assert_eq!(state.snapshot().call_stack.len(), MAX_CALL_DEPTH);
    }

    #[test]
    fn test_scroll_is_clamped() {
        let mut state = SessionState::new(None);
        assert_eq!(state.scroll(View::Registers, 100), REGISTER_COUNT - 1);
        assert_eq!(state.scroll(View::Registers, -5), REGISTER_COUNT - 6);
        assert_eq!(state.scroll(View::Registers, -100), 0);
        assert_eq!(state.scroll(View::Stack, 3), 0);
    }

    #[test]
    fn test_log_is_bounded() {
        let mut state = SessionState::new(None);
        for i in 0..(LOG_CAPACITY + 5) {
            state.push_log(format!("line {i}"));
        }
        let log = state.snapshot().log;
        assert_eq!(log.len(), LOG_CAPACITY);
        assert_eq!(log[0], "line 5");
    }

    #[test]
    fn test_view_cycle() {
        let mut view = View::Registers;
        for _ in 0..View::ALL.len() {
            view = view.next();
        }
        assert_eq!(view, View::Registers);
    }
}
