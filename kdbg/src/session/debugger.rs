//! Command handler: the only write interface of the front end

use log::{info, warn};

use super::{DebugState, SessionSnapshot, SharedSession, View};
use crate::breakpoints::{ControlSink, ControlUpdate};
use crate::domain::{Address, AttachError, BreakpointError, SessionError};
use crate::probe::{ProbeAttacher, ProbeHandle};

/// Executes debugger commands against the shared session
///
/// Every command locks the session once, applies its change and releases the
/// lock. Breakpoint and tracing commands then publish the resulting control
/// state through the [`ControlSink`]; attach and detach talk to the
/// [`ProbeAttacher`]. Neither happens while the lock is held.
pub struct Debugger {
    session: SharedSession,
    sink: Box<dyn ControlSink>,
    attacher: Option<Box<dyn ProbeAttacher>>,
    handles: Vec<ProbeHandle>,
}

impl Debugger {
    pub fn new(session: SharedSession, sink: Box<dyn ControlSink>) -> Self {
        Self { session, sink, attacher: None, handles: Vec::new() }
    }

    #[must_use]
    pub fn with_attacher(mut self, attacher: Box<dyn ProbeAttacher>) -> Self {
        self.attacher = Some(attacher);
        self
    }

    #[must_use]
    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    /// Probes currently attached through this debugger
    #[must_use]
    pub fn handles(&self) -> &[ProbeHandle] {
        &self.handles
    }

    // ========================================================================
    // Execution control
    // ========================================================================

    /// # Errors
    /// [`SessionError::LockPoisoned`] if the session lock is poisoned.
    pub fn continue_execution(&self) -> Result<DebugState, SessionError> {
        self.session.with_state(|state| state.continue_execution())
    }

    /// Request a single step: the next ingested event stops the session again
    ///
    /// # Errors
    /// [`SessionError::LockPoisoned`] if the session lock is poisoned.
    pub fn step(&self) -> Result<DebugState, SessionError> {
        self.session.with_state(|state| state.step())
    }

    /// # Errors
    /// [`SessionError::LockPoisoned`] if the session lock is poisoned.
    pub fn halt(&self) -> Result<DebugState, SessionError> {
        self.session.with_state(|state| state.halt())
    }

    /// Continue if the session is parked at a breakpoint; `true` if it was
    ///
    /// # Errors
    /// [`SessionError::LockPoisoned`] if the session lock is poisoned.
    pub fn resume_from_breakpoint(&self) -> Result<bool, SessionError> {
        self.session.with_state(|state| {
            let parked = state.debug_state() == DebugState::AtBreakpoint;
            if parked {
                state.continue_execution();
            }
            parked
        })
    }

    // ========================================================================
    // Breakpoints and tracing
    // ========================================================================

    /// # Errors
    /// [`SessionError::Breakpoint`] for duplicates or a full set (no state
    /// change), [`SessionError::Control`] if publishing to the kernel failed.
    pub fn set_breakpoint(
        &mut self,
        address: Address,
        symbol: impl Into<String>,
    ) -> Result<(), SessionError> {
        let symbol = symbol.into();
        let update = self.session.with_state(|state| {
            let update = state.breakpoints.add(address, symbol.clone())?;
            state.push_log(format!("breakpoint set at {address} ({symbol})"));
            Ok::<_, BreakpointError>(update)
        })??;
        self.publish(&update)
    }

    /// # Errors
    /// [`SessionError::Breakpoint`] if no breakpoint exists at `address`,
    /// [`SessionError::Control`] if publishing to the kernel failed.
    pub fn clear_breakpoint(&mut self, address: Address) -> Result<(), SessionError> {
        let update = self.session.with_state(|state| {
            let update = state.breakpoints.remove(address)?;
            state.clamp_cursors();
            state.push_log(format!("breakpoint cleared at {address}"));
            Ok::<_, BreakpointError>(update)
        })??;
        self.publish(&update)
    }

    /// Flip a breakpoint's enabled flag; returns the new value
    ///
    /// # Errors
    /// As [`Debugger::clear_breakpoint`].
    pub fn toggle_breakpoint(&mut self, address: Address) -> Result<bool, SessionError> {
        let (enabled, update) = self.session.with_state(|state| {
            let enabled = !state
                .breakpoints
                .get(address)
                .ok_or(BreakpointError::BreakpointNotFound(address))?
                .enabled;
            let update = state.breakpoints.toggle(address, enabled)?;
            let verb = if enabled { "enabled" } else { "disabled" };
            state.push_log(format!("breakpoint {verb} at {address}"));
            Ok::<_, BreakpointError>((enabled, update))
        })??;
        self.publish(&update)?;
        Ok(enabled)
    }

    /// Flip tracing of every probed function; returns the new value
    ///
    /// # Errors
    /// [`SessionError::Control`] if publishing to the kernel failed.
    pub fn toggle_tracing(&mut self) -> Result<bool, SessionError> {
        let (trace_all, update) = self.session.with_state(|state| {
            let trace_all = !state.breakpoints.trace_all();
            let update = state.breakpoints.set_trace_all(trace_all);
            let verb = if trace_all { "on" } else { "off" };
            state.push_log(format!("tracing {verb}"));
            (trace_all, update)
        })?;
        self.publish(&update)?;
        Ok(trace_all)
    }

    /// Publish the current control state again
    ///
    /// Used at startup and to repair a publish that failed earlier.
    ///
    /// # Errors
    /// [`SessionError::Control`] if publishing to the kernel failed.
    pub fn sync_control(&mut self) -> Result<(), SessionError> {
        let update = self.session.with_state(|state| state.breakpoints.control_update())?;
        self.publish(&update)
    }

    fn publish(&mut self, update: &ControlUpdate) -> Result<(), SessionError> {
        if let Err(e) = self.sink.publish(update) {
            warn!("Control publish failed: {e}");
            let line = format!("control publish failed: {e}");
            self.session.with_state(|state| state.push_log(line))?;
            return Err(e.into());
        }
        Ok(())
    }

    // ========================================================================
    // View
    // ========================================================================

    /// # Errors
    /// [`SessionError::LockPoisoned`] if the session lock is poisoned.
    pub fn scroll(&self, view: View, delta: isize) -> Result<usize, SessionError> {
        self.session.with_state(|state| state.scroll(view, delta))
    }

    /// # Errors
    /// [`SessionError::LockPoisoned`] if the session lock is poisoned.
    pub fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.session.snapshot()
    }

    // ========================================================================
    // Probe attachment
    // ========================================================================

    /// Attach entry and exit probes to a kernel function
    ///
    /// A failure is recorded in the probe status and returned; the session
    /// keeps running without that probe.
    ///
    /// # Errors
    /// [`SessionError::Attach`] when no attacher is configured or the kernel
    /// rejected the probe.
    pub fn attach(&mut self, function: &str) -> Result<ProbeHandle, SessionError> {
        let result = match self.attacher.as_mut() {
            Some(attacher) => attacher.attach(function),
            None => Err(AttachError::Unavailable("no probe attacher configured".into())),
        };

        match result {
            Ok(handle) => {
                info!("Attached probes to {function}");
                self.session.with_state(|state| {
                    state.probe_status.attached.push(handle.function.clone());
                    state.push_log(format!("attached {function}"));
                })?;
                self.handles.push(handle.clone());
                Ok(handle)
            }
            Err(e) => {
                warn!("{e}");
                let reason = e.to_string();
                self.session.with_state(|state| {
                    state.push_log(reason.clone());
                    state.probe_status.failures.push(reason);
                })?;
                Err(e.into())
            }
        }
    }

    /// # Errors
    /// [`SessionError::Attach`] if the handle is unknown or the attacher
    /// failed to remove the probes.
    pub fn detach(&mut self, handle: &ProbeHandle) -> Result<(), SessionError> {
        let position = self
            .handles
            .iter()
            .position(|h| h.id == handle.id)
            .ok_or(AttachError::UnknownHandle(handle.id))?;
        let attacher = self
            .attacher
            .as_mut()
            .ok_or_else(|| AttachError::Unavailable("no probe attacher configured".into()))?;
        attacher.detach(handle)?;

        self.handles.remove(position);
        self.session.with_state(|state| {
            let attached = &mut state.probe_status.attached;
            if let Some(i) = attached.iter().position(|f| *f == handle.function) {
                attached.remove(i);
            }
            state.push_log(format!("detached {}", handle.function));
        })?;
        Ok(())
    }

    /// Detach every probe, logging failures
    pub fn detach_all(&mut self) {
        for handle in self.handles.clone() {
            if let Err(e) = self.detach(&handle) {
                warn!("Failed to detach {}: {e}", handle.function);
            }
        }
    }

    /// Mark the session as replaying a recording
    ///
    /// # Errors
    /// [`SessionError::LockPoisoned`] if the session lock is poisoned.
    pub fn mark_replay(&self) -> Result<(), SessionError> {
        self.session.with_state(|state| state.probe_status.replay = true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoints::ControlMirror;
    use crate::contract::{EventKind, ProbeEvent, RegisterConfidence};
    use crate::domain::{ControlError, CpuId, Pid, Tid, Timestamp};
    use crate::session::SessionState;

    struct FailingSink;

    impl ControlSink for FailingSink {
        fn publish(&mut self, _update: &ControlUpdate) -> Result<(), ControlError> {
            Err(ControlError::MapWrite { map: "CONTROL", reason: "EPERM".into() })
        }
    }

    /// Attacher accepting only functions starting with "vfs_"
    #[derive(Default)]
    struct FakeAttacher {
        next_id: u64,
    }

    impl ProbeAttacher for FakeAttacher {
        fn attach(&mut self, function: &str) -> Result<ProbeHandle, AttachError> {
            if !function.starts_with("vfs_") {
                return Err(AttachError::SymbolNotFound(function.to_string()));
            }
            self.next_id += 1;
            Ok(ProbeHandle { id: self.next_id, function: function.to_string(), address: None })
        }

        fn detach(&mut self, _handle: &ProbeHandle) -> Result<(), AttachError> {
            Ok(())
        }
    }

    fn debugger() -> (Debugger, ControlMirror) {
        let mirror = ControlMirror::new();
        let session = SharedSession::new(SessionState::new(None));
        (Debugger::new(session, Box::new(mirror.clone())), mirror)
    }

    #[test]
    fn test_breakpoint_commands_publish_control() {
        let (mut debugger, mirror) = debugger();

        debugger.set_breakpoint(Address(0x1000), "foo").unwrap();
        assert_eq!(mirror.control().global_enable, 1);
        assert_eq!(mirror.enabled_addresses(), vec![Address(0x1000)]);

        assert!(!debugger.toggle_breakpoint(Address(0x1000)).unwrap());
        assert_eq!(mirror.control().global_enable, 0);

        debugger.clear_breakpoint(Address(0x1000)).unwrap();
        assert!(debugger.snapshot().unwrap().breakpoints.is_empty());
        assert_eq!(mirror.publish_count(), 3);
    }

    #[test]
    fn test_rejected_command_does_not_publish() {
        let (mut debugger, mirror) = debugger();
        debugger.set_breakpoint(Address(0x1000), "foo").unwrap();

        let err = debugger.set_breakpoint(Address(0x1000), "bar").unwrap_err();
        assert!(matches!(
            err,
            SessionError::Breakpoint(BreakpointError::DuplicateBreakpoint(_))
        ));
        assert!(!err.is_fatal());
        assert_eq!(mirror.publish_count(), 1);
    }

    #[test]
    fn test_toggle_tracing() {
        let (mut debugger, mirror) = debugger();
        assert!(debugger.toggle_tracing().unwrap());
        assert_eq!(mirror.control().global_enable, 1);
        assert!(!debugger.toggle_tracing().unwrap());
        assert_eq!(mirror.control().global_enable, 0);
    }

    #[test]
    fn test_failed_publish_is_reported_and_repaired() {
        let session = SharedSession::new(SessionState::new(None));
        let mut failing = Debugger::new(session.clone(), Box::new(FailingSink));
        let err = failing.set_breakpoint(Address(0x1000), "foo").unwrap_err();
        assert!(matches!(err, SessionError::Control(_)));

        // The user-visible set kept the breakpoint; a later publish repairs the kernel side
        let mirror = ControlMirror::new();
        let mut healthy = Debugger::new(session, Box::new(mirror.clone()));
        healthy.sync_control().unwrap();
        assert_eq!(mirror.enabled_addresses(), vec![Address(0x1000)]);
    }

    #[test]
    fn test_execution_commands() {
        let (debugger, _mirror) = debugger();
        assert_eq!(debugger.continue_execution().unwrap(), DebugState::Running);
        assert_eq!(debugger.step().unwrap(), DebugState::Stepping);
        assert_eq!(debugger.halt().unwrap(), DebugState::Stopped);
    }

    #[test]
    fn test_resume_only_from_breakpoint() {
        let (debugger, _mirror) = debugger();
        assert!(!debugger.resume_from_breakpoint().unwrap());
        assert_eq!(debugger.snapshot().unwrap().debug_state, DebugState::Stopped);

        debugger
            .session()
            .with_state(|state| {
                state.breakpoints.add(Address(0x1000), "vfs_read").unwrap();
                state.continue_execution();
            })
            .unwrap();
        let hit = ProbeEvent {
            timestamp: Timestamp(1),
            pid: Pid(1),
            tid: Tid(1),
            cpu: CpuId(0),
            kind: EventKind::BreakpointHit,
            function: "vfs_read".into(),
            address: Address(0x1000),
            return_value: None,
            registers: None,
            confidence: RegisterConfidence::Unavailable,
        };
        debugger.session().apply_event(&hit).unwrap();
        assert_eq!(debugger.snapshot().unwrap().debug_state, DebugState::AtBreakpoint);

        assert!(debugger.resume_from_breakpoint().unwrap());
        assert_eq!(debugger.snapshot().unwrap().debug_state, DebugState::Running);
    }

    #[test]
    fn test_attach_failure_degrades_session() {
        let (debugger, _mirror) = debugger();
        let mut debugger = debugger.with_attacher(Box::<FakeAttacher>::default());

        assert!(debugger.attach("do_nothing").is_err());
        let status = debugger.snapshot().unwrap().probe_status;
        assert!(status.degraded());
        assert_eq!(status.failures.len(), 1);

        let handle = debugger.attach("vfs_read").unwrap();
        assert!(!debugger.snapshot().unwrap().probe_status.degraded());

        debugger.detach(&handle).unwrap();
        assert!(debugger.snapshot().unwrap().probe_status.degraded());
        assert!(matches!(
            debugger.detach(&handle),
            Err(SessionError::Attach(AttachError::UnknownHandle(_)))
        ));
    }

    #[test]
    fn test_attach_without_attacher_is_unavailable() {
        let (mut debugger, _mirror) = debugger();
        assert!(matches!(
            debugger.attach("vfs_read"),
            Err(SessionError::Attach(AttachError::Unavailable(_)))
        ));
    }
}
