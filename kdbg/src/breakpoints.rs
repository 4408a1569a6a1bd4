//! # Breakpoint Manager
//!
//! The user-visible breakpoint set and its reconciliation with the kernel-side
//! control state.
//!
//! ## Reconciliation
//!
//! Every mutating operation returns a [`ControlUpdate`]: the complete state the
//! kernel maps must hold afterwards. The update is computed from the set in the
//! same step as the mutation, so the two can never disagree:
//!
//! ```text
//! global_enable = any breakpoint enabled || trace_all
//! debug_mode    = MODE_FULL if trace_all else MODE_BREAKPOINTS_ONLY
//! BREAKPOINTS   = { address | breakpoint enabled }
//! ```
//!
//! Applying the update is the job of a [`ControlSink`]. Sinks publish the full
//! desired state rather than a delta, so a publish that failed halfway is
//! repaired by the next one.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use kdbg_common::{ControlState, MAX_BREAKPOINTS, MODE_BREAKPOINTS_ONLY, MODE_FULL};

use crate::domain::{Address, BreakpointError, ControlError, Pid};

/// Capacity of the breakpoint set, bounded by the kernel `BREAKPOINTS` map
pub const BREAKPOINT_LIMIT: usize = MAX_BREAKPOINTS as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    pub address: Address,
    pub symbol: String,
    pub enabled: bool,
    /// Breakpoint-hit events matched against this entry
    pub hit_count: u64,
}

/// Desired kernel-side state after a breakpoint mutation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ControlUpdate {
    pub control: ControlState,
    /// Enabled breakpoint addresses, ascending
    pub enabled_addresses: Vec<Address>,
}

/// Makes the kernel (or a stand-in) match a [`ControlUpdate`]
pub trait ControlSink: Send {
    /// # Errors
    /// [`ControlError::MapWrite`] when a map update is rejected.
    fn publish(&mut self, update: &ControlUpdate) -> Result<(), ControlError>;
}

/// Ordered breakpoint set keyed by address
#[derive(Debug, Default)]
pub struct BreakpointManager {
    breakpoints: BTreeMap<Address, Breakpoint>,
    trace_all: bool,
    target_pid: Option<Pid>,
}

impl BreakpointManager {
    #[must_use]
    pub fn new(target_pid: Option<Pid>) -> Self {
        Self { breakpoints: BTreeMap::new(), trace_all: false, target_pid }
    }

    /// Add an enabled breakpoint
    ///
    /// # Errors
    /// [`BreakpointError::DuplicateBreakpoint`] if `address` is already set,
    /// [`BreakpointError::TooManyBreakpoints`] when the set is full. The set is
    /// unchanged in both cases.
    pub fn add(
        &mut self,
        address: Address,
        symbol: impl Into<String>,
    ) -> Result<ControlUpdate, BreakpointError> {
        if self.breakpoints.contains_key(&address) {
            return Err(BreakpointError::DuplicateBreakpoint(address));
        }
        if self.breakpoints.len() >= BREAKPOINT_LIMIT {
            return Err(BreakpointError::TooManyBreakpoints { limit: BREAKPOINT_LIMIT });
        }

        self.breakpoints.insert(
            address,
            Breakpoint { address, symbol: symbol.into(), enabled: true, hit_count: 0 },
        );
        Ok(self.control_update())
    }

    /// # Errors
    /// [`BreakpointError::BreakpointNotFound`] if no breakpoint is set at `address`.
    pub fn remove(&mut self, address: Address) -> Result<ControlUpdate, BreakpointError> {
        self.breakpoints
            .remove(&address)
            .ok_or(BreakpointError::BreakpointNotFound(address))?;
        Ok(self.control_update())
    }

    /// Set the enabled flag of an existing breakpoint
    ///
    /// # Errors
    /// [`BreakpointError::BreakpointNotFound`] if no breakpoint is set at `address`.
    pub fn toggle(
        &mut self,
        address: Address,
        enabled: bool,
    ) -> Result<ControlUpdate, BreakpointError> {
        let breakpoint = self
            .breakpoints
            .get_mut(&address)
            .ok_or(BreakpointError::BreakpointNotFound(address))?;
        breakpoint.enabled = enabled;
        Ok(self.control_update())
    }

    /// Trace every probed function, not only breakpoints
    pub fn set_trace_all(&mut self, trace_all: bool) -> ControlUpdate {
        self.trace_all = trace_all;
        self.control_update()
    }

    #[must_use]
    pub fn trace_all(&self) -> bool {
        self.trace_all
    }

    /// Breakpoints in ascending address order
    #[must_use]
    pub fn list(&self) -> Vec<Breakpoint> {
        self.breakpoints.values().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    #[must_use]
    pub fn get(&self, address: Address) -> Option<&Breakpoint> {
        self.breakpoints.get(&address)
    }

    #[must_use]
    pub fn is_enabled(&self, address: Address) -> bool {
        self.breakpoints.get(&address).is_some_and(|bp| bp.enabled)
    }

    /// Count a breakpoint-hit; returns whether it matched an enabled breakpoint
    pub fn record_hit(&mut self, address: Address) -> bool {
        match self.breakpoints.get_mut(&address) {
            Some(bp) if bp.enabled => {
                bp.hit_count += 1;
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    /// Control record derived from the current set
    #[must_use]
    pub fn control(&self) -> ControlState {
        let any_enabled = self.breakpoints.values().any(|bp| bp.enabled);
        ControlState {
            global_enable: u32::from(any_enabled || self.trace_all),
            target_pid: self.target_pid.map_or(0, |pid| pid.0),
            debug_mode: if self.trace_all { MODE_FULL } else { MODE_BREAKPOINTS_ONLY },
            ..ControlState::default()
        }
    }

    /// Full desired kernel-side state
    #[must_use]
    pub fn control_update(&self) -> ControlUpdate {
        ControlUpdate {
            control: self.control(),
            enabled_addresses: self
                .breakpoints
                .values()
                .filter(|bp| bp.enabled)
                .map(|bp| bp.address)
                .collect(),
        }
    }
}

// ============================================================================
// In-memory sink
// ============================================================================

#[derive(Debug, Default)]
struct MirrorState {
    control: ControlState,
    enabled: BTreeSet<Address>,
    publishes: usize,
}

/// In-memory stand-in for the kernel maps
///
/// Used when no probes are loaded (replay, degraded mode) and in tests. Clones
/// share the same state, so a test can keep one handle and give another to the
/// debugger.
#[derive(Debug, Clone, Default)]
pub struct ControlMirror {
    inner: Arc<Mutex<MirrorState>>,
}

impl ControlMirror {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn control(&self) -> ControlState {
        self.state().control
    }

    #[must_use]
    pub fn enabled_addresses(&self) -> Vec<Address> {
        self.state().enabled.iter().copied().collect()
    }

    /// Number of successful publishes
    #[must_use]
    pub fn publish_count(&self) -> usize {
        self.state().publishes
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MirrorState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ControlSink for ControlMirror {
    fn publish(&mut self, update: &ControlUpdate) -> Result<(), ControlError> {
        let mut state = self.state();
        state.control = update.control;
        state.enabled = update.enabled_addresses.iter().copied().collect();
        state.publishes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic pseudo-random sequence for operation fuzzing
    fn lcg(seed: &mut u64) -> u64 {
        *seed = seed
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        *seed >> 33
    }

    #[test]
    fn test_duplicate_add_keeps_first_symbol() {
        let mut manager = BreakpointManager::new(None);
        manager.add(Address(0x1000), "foo").unwrap();

        let err = manager.add(Address(0x1000), "bar").unwrap_err();
        assert_eq!(err, BreakpointError::DuplicateBreakpoint(Address(0x1000)));

        let list = manager.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].symbol, "foo");
    }

    #[test]
    fn test_list_is_in_address_order() {
        let mut manager = BreakpointManager::new(None);
        for addr in [0x3000, 0x1000, 0x2000] {
            manager.add(Address(addr), format!("f{addr:x}")).unwrap();
        }
        let addrs: Vec<u64> = manager.list().iter().map(|bp| bp.address.0).collect();
        assert_eq!(addrs, vec![0x1000, 0x2000, 0x3000]);
    }

    #[test]
    fn test_remove_missing_is_not_found() {
        let mut manager = BreakpointManager::new(None);
        assert_eq!(
            manager.remove(Address(0x42)).unwrap_err(),
            BreakpointError::BreakpointNotFound(Address(0x42))
        );
        assert_eq!(
            manager.toggle(Address(0x42), false).unwrap_err(),
            BreakpointError::BreakpointNotFound(Address(0x42))
        );
    }

    #[test]
    fn test_global_enable_follows_enabled_breakpoints() {
        let mut manager = BreakpointManager::new(None);
        assert_eq!(manager.control().global_enable, 0);

        let update = manager.add(Address(0x1000), "foo").unwrap();
        assert_eq!(update.control.global_enable, 1);
        assert_eq!(update.control.debug_mode, MODE_BREAKPOINTS_ONLY);
        assert_eq!(update.enabled_addresses, vec![Address(0x1000)]);

        let update = manager.toggle(Address(0x1000), false).unwrap();
        assert_eq!(update.control.global_enable, 0);
        assert!(update.enabled_addresses.is_empty());

        let update = manager.toggle(Address(0x1000), true).unwrap();
        assert_eq!(update.control.global_enable, 1);

        let update = manager.remove(Address(0x1000)).unwrap();
        assert_eq!(update.control.global_enable, 0);
    }

    #[test]
    fn test_reconciliation_over_random_operations() {
        let mut manager = BreakpointManager::new(None);
        let mut seed = 7;

        for _ in 0..2_000 {
            let address = Address(0x1000 + (lcg(&mut seed) % 12) * 0x10);
            let outcome = match lcg(&mut seed) % 3 {
                0 => manager.add(address, "f"),
                1 => manager.remove(address),
                _ => manager.toggle(address, lcg(&mut seed) % 2 == 0),
            };

            let expected_any = manager.iter().any(|bp| bp.enabled);
            assert_eq!(manager.control().global_enable != 0, expected_any);
            if let Ok(update) = outcome {
                assert_eq!(update.control.global_enable != 0, expected_any);
                let enabled: Vec<Address> =
                    manager.iter().filter(|bp| bp.enabled).map(|bp| bp.address).collect();
                assert_eq!(update.enabled_addresses, enabled);
            }
        }
    }

    #[test]
    fn test_trace_all_overrides_global_enable() {
        let mut manager = BreakpointManager::new(Some(Pid(77)));
        let update = manager.set_trace_all(true);
        assert_eq!(update.control.global_enable, 1);
        assert_eq!(update.control.debug_mode, MODE_FULL);
        assert_eq!(update.control.target_pid, 77);

        let update = manager.set_trace_all(false);
        assert_eq!(update.control.global_enable, 0);
        assert_eq!(update.control.debug_mode, MODE_BREAKPOINTS_ONLY);
    }

    #[test]
    fn test_capacity_is_bounded() {
        let mut manager = BreakpointManager::new(None);
        for i in 0..BREAKPOINT_LIMIT as u64 {
            manager.add(Address(0x1000 + i), "f").unwrap();
        }
        let err = manager.add(Address(0xdead), "g").unwrap_err();
        assert_eq!(err, BreakpointError::TooManyBreakpoints { limit: BREAKPOINT_LIMIT });
        assert_eq!(manager.len(), BREAKPOINT_LIMIT);
    }

    #[test]
    fn test_record_hit_only_counts_enabled() {
        let mut manager = BreakpointManager::new(None);
        manager.add(Address(0x1000), "foo").unwrap();
        assert!(manager.record_hit(Address(0x1000)));
        manager.toggle(Address(0x1000), false).unwrap();
        assert!(!manager.record_hit(Address(0x1000)));
        assert!(!manager.record_hit(Address(0x2000)));
        assert_eq!(manager.get(Address(0x1000)).unwrap().hit_count, 1);
    }

    #[test]
    fn test_mirror_tracks_last_publish() {
        let mut manager = BreakpointManager::new(None);
        let mirror = ControlMirror::new();
        let mut sink = mirror.clone();

        sink.publish(&manager.add(Address(0x2000), "b").unwrap()).unwrap();
        sink.publish(&manager.add(Address(0x1000), "a").unwrap()).unwrap();
        sink.publish(&manager.toggle(Address(0x2000), false).unwrap()).unwrap();

        assert_eq!(mirror.enabled_addresses(), vec![Address(0x1000)]);
        assert_eq!(mirror.control().global_enable, 1);
        assert_eq!(mirror.publish_count(), 3);
    }
}
