//! # Debugger Session
//!
//! The live, in-memory debugging state and the command handler that mutates
//! it.
//!
//! ## Locking
//!
//! A single mutex guards [`SessionState`], breakpoint set included. Both the
//! ingestion thread and the command handler hold it for one state update or
//! one snapshot copy, never across I/O. Kernel map writes and probe
//! attachment happen after the guard is dropped.
//!
//! A poisoned lock means a thread panicked mid-update. It surfaces as
//! [`SessionError::LockPoisoned`], which callers treat as fatal.

mod debugger;
mod state;

use std::sync::{Arc, Mutex};

pub use debugger::Debugger;
pub use state::{
    DebugState, ProbeStatus, SessionNotice, SessionSnapshot, SessionState, StackFrame, View,
    LOG_CAPACITY, MAX_CALL_DEPTH,
};

use crate::contract::ProbeEvent;
use crate::domain::SessionError;
use crate::ingest::IngestStats;

/// Cloneable handle to the session shared by ingestion and the front end
#[derive(Debug, Clone)]
pub struct SharedSession {
    state: Arc<Mutex<SessionState>>,
    stats: Arc<IngestStats>,
}

impl SharedSession {
    #[must_use]
    pub fn new(state: SessionState) -> Self {
        Self { state: Arc::new(Mutex::new(state)), stats: Arc::new(IngestStats::default()) }
    }

    /// Run `f` with the session locked
    ///
    /// # Errors
    /// [`SessionError::LockPoisoned`] if a previous holder panicked.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> Result<R, SessionError> {
        let mut guard = self.state.lock().map_err(|_| SessionError::LockPoisoned)?;
        Ok(f(&mut guard))
    }

    /// # Errors
    /// [`SessionError::LockPoisoned`] if a previous holder panicked.
    pub fn apply_event(&self, event: &ProbeEvent) -> Result<Option<SessionNotice>, SessionError> {
        self.with_state(|state| state.apply_event(event))
    }

    /// Consistent copy of the session, ingestion counters included
    ///
    /// # Errors
    /// [`SessionError::LockPoisoned`] if a previous holder panicked.
    pub fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let mut snapshot = self.with_state(|state| state.snapshot())?;
        snapshot.ingest = self.stats.counters();
        Ok(snapshot)
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<IngestStats> {
        &self.stats
    }
}
