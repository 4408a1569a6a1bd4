//! # Probe Event Contract (eBPF ↔ Userspace)
//!
//! Defines the wire-exact data structures and constants shared between the
//! kernel-side probes and userspace. All types use `#[repr(C)]` with explicit
//! reserved fields, so there is no implicit padding and both sides agree
//! byte-for-byte.
//!
//! ## Key Types
//!
//! - [`DebugEvent`] - One record per probe hit, passed via the ring buffer
//! - [`RegisterSnapshot`] - RISC-V integer register file (32 × u64)
//! - [`ControlState`] - Master switch, PID filter and mode, read by every probe
//! - [`ProbeSymbol`] - Function name registered per probed address
//!
//! ## Versioning
//!
//! Every event starts with [`CONTRACT_VERSION`]. Userspace refuses to ingest a
//! stream whose version differs; a mismatch means the probe object and the
//! decoder were built from different revisions of this crate.

#![cfg_attr(not(test), no_std)]

// ============================================================================
// Contract Version and Sizes
// ============================================================================

/// Version tag stamped into every [`DebugEvent`] by the kernel probe.
///
/// High half is the ASCII tag `KD`, low half the layout revision.
pub const CONTRACT_VERSION: u32 = 0x4b44_0001;

/// Maximum length of a function name, including the terminating NUL
pub const MAX_FUNCTION_NAME: usize = 64;

/// Exact size of a [`DebugEvent`] on the wire
pub const DEBUG_EVENT_SIZE: usize = 368;

/// Exact size of a [`ControlState`] map value
pub const CONTROL_STATE_SIZE: usize = 16;

/// Number of registers in a [`RegisterSnapshot`]
pub const REGISTER_COUNT: usize = 32;

/// Key of the single [`ControlState`] entry in the `CONTROL` array map
pub const CONTROL_KEY: u32 = 0;

/// Upper bound on breakpoints (sizes the `BREAKPOINTS` map)
pub const MAX_BREAKPOINTS: u32 = 64;

/// Upper bound on probed functions (sizes the `PROBE_SYMBOLS` map)
pub const MAX_PROBE_SYMBOLS: u32 = 1024;

// ============================================================================
// Event Kinds
// ============================================================================

/// **Function Entry**: the probed function was called
///
/// Emitted by: `function_entry` kprobe (only in [`MODE_FULL`])
pub const EVENT_FUNCTION_ENTRY: u8 = 0;

/// **Function Exit**: the probed function returned
///
/// Emitted by: `function_exit` kretprobe (only in [`MODE_FULL`])
/// Carries the return value when [`FLAG_RETURN_VALUE`] is set.
pub const EVENT_FUNCTION_EXIT: u8 = 1;

/// **Breakpoint Hit**: the entered function's address is an enabled key of
/// the `BREAKPOINTS` map
///
/// Emitted by: `function_entry` kprobe (in every mode)
pub const EVENT_BREAKPOINT: u8 = 2;

// ============================================================================
// Debug Modes (ControlState::debug_mode)
// ============================================================================

/// Emit entry, exit and breakpoint events
pub const MODE_FULL: u8 = 0;

/// Emit breakpoint hits only
pub const MODE_BREAKPOINTS_ONLY: u8 = 1;

// ============================================================================
// Event Flags (DebugEvent::flags)
// ============================================================================

/// A register snapshot was captured from the trap context
pub const FLAG_REGISTERS: u8 = 1 << 0;

/// The trap context exposed only some registers; the rest are zero-filled.
/// Consumers should treat the snapshot as low-confidence.
pub const FLAG_REGISTERS_PARTIAL: u8 = 1 << 1;

/// `return_value` holds the function's return value (exit events)
pub const FLAG_RETURN_VALUE: u8 = 1 << 2;

// ============================================================================
// Counter Slots (EVENT_COUNTERS map)
// ============================================================================

/// Events successfully submitted to the ring buffer
pub const COUNTER_EMITTED: u32 = 0;

/// Events dropped because the ring buffer was full
pub const COUNTER_DROPPED: u32 = 1;

/// Probe hits rejected by the PID filter or the debug mode
pub const COUNTER_FILTERED: u32 = 2;

/// Number of counter slots
pub const COUNTER_SLOTS: u32 = 3;

// ============================================================================
// Shared Data Structures
// ============================================================================

/// RISC-V general-purpose and special-purpose registers
///
/// Every field is always present. Registers the trap context could not
/// provide are zero; whether that happened is reported out of band through
/// [`FLAG_REGISTERS`] and [`FLAG_REGISTERS_PARTIAL`] on the event.
///
/// Field order follows the kernel's `struct pt_regs` for riscv64.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegisterSnapshot {
    /// Program counter
    pub pc: u64,
    /// Return address (x1)
    pub ra: u64,
    /// Stack pointer (x2)
    pub sp: u64,
    /// Global pointer (x3)
    pub gp: u64,
    /// Thread pointer (x4)
    pub tp: u64,
    pub t0: u64,
    pub t1: u64,
    pub t2: u64,
    /// Saved register 0 / frame pointer (x8)
    pub s0: u64,
    pub s1: u64,
    /// Argument 0 / return value (x10)
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
    pub a4: u64,
    pub a5: u64,
    pub a6: u64,
    pub a7: u64,
    pub s2: u64,
    pub s3: u64,
    pub s4: u64,
    pub s5: u64,
    pub s6: u64,
    pub s7: u64,
    pub s8: u64,
    pub s9: u64,
    pub s10: u64,
    pub s11: u64,
    pub t3: u64,
    pub t4: u64,
    pub t5: u64,
    pub t6: u64,
}

/// ABI names of the registers, in [`RegisterSnapshot::values`] order
pub const REGISTER_NAMES: [&str; REGISTER_COUNT] = [
    "pc", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4", "a5",
    "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4", "t5",
    "t6",
];

impl RegisterSnapshot {
    /// A snapshot with every register set to `value`
    #[must_use]
    pub const fn splat(value: u64) -> Self {
        Self {
            pc: value,
            ra: value,
            sp: value,
            gp: value,
            tp: value,
            t0: value,
            t1: value,
            t2: value,
            s0: value,
            s1: value,
            a0: value,
            a1: value,
            a2: value,
            a3: value,
            a4: value,
            a5: value,
            a6: value,
            a7: value,
            s2: value,
            s3: value,
            s4: value,
            s5: value,
            s6: value,
            s7: value,
            s8: value,
            s9: value,
            s10: value,
            s11: value,
            t3: value,
            t4: value,
            t5: value,
            t6: value,
        }
    }

    /// Register values in [`REGISTER_NAMES`] order
    #[must_use]
    pub const fn values(&self) -> [u64; REGISTER_COUNT] {
        [
            self.pc, self.ra, self.sp, self.gp, self.tp, self.t0, self.t1, self.t2, self.s0,
            self.s1, self.a0, self.a1, self.a2, self.a3, self.a4, self.a5, self.a6, self.a7,
            self.s2, self.s3, self.s4, self.s5, self.s6, self.s7, self.s8, self.s9, self.s10,
            self.s11, self.t3, self.t4, self.t5, self.t6,
        ]
    }
}

/// Event sent from the kernel probes to userspace via ring buffer
///
/// **Memory Layout**: `#[repr(C)]`, 368 bytes, no implicit padding.
/// **Ownership**: produced once per probe hit, consumed and discarded by the
/// ingestion service after it has been folded into session state.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DebugEvent {
    // ========================================================================
    // Header
    // ========================================================================
    /// Always [`CONTRACT_VERSION`]
    pub version: u32,

    /// One of `EVENT_FUNCTION_ENTRY`, `EVENT_FUNCTION_EXIT`, `EVENT_BREAKPOINT`
    pub kind: u8,

    /// Bitset of `FLAG_*` constants
    pub flags: u8,

    #[allow(clippy::pub_underscore_fields)]
    pub _reserved: [u8; 2],

    // ========================================================================
    // Identification
    // ========================================================================
    /// Process ID (TGID in Linux terms)
    pub pid: u32,

    /// Thread ID (PID in Linux terms)
    pub tid: u32,

    /// CPU the probe fired on
    pub cpu: u32,

    #[allow(clippy::pub_underscore_fields)]
    pub _reserved2: u32,

    /// Monotonic timestamp in nanoseconds (from `bpf_ktime_get_ns()`)
    pub timestamp_ns: u64,

    // ========================================================================
    // Location
    // ========================================================================
    /// Address of the probed function
    pub instruction_pointer: u64,

    /// Return value for exit events, 0 otherwise
    pub return_value: u64,

    /// NUL-terminated function name, truncated to fit
    pub function_name: [u8; MAX_FUNCTION_NAME],

    /// Register state at the probe hit (see `flags` for validity)
    pub registers: RegisterSnapshot,
}

impl DebugEvent {
    /// An all-zero event carrying the current contract version
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            version: CONTRACT_VERSION,
            kind: EVENT_FUNCTION_ENTRY,
            flags: 0,
            _reserved: [0; 2],
            pid: 0,
            tid: 0,
            cpu: 0,
            _reserved2: 0,
            timestamp_ns: 0,
            instruction_pointer: 0,
            return_value: 0,
            function_name: [0; MAX_FUNCTION_NAME],
            registers: RegisterSnapshot::splat(0),
        }
    }

    /// Function name bytes up to (not including) the first NUL
    #[must_use]
    pub fn function_name_bytes(&self) -> &[u8] {
        let end =
            self.function_name.iter().position(|&b| b == 0).unwrap_or(self.function_name.len());
        &self.function_name[..end]
    }
}

/// Debugger control state, read by every probe invocation before emitting
///
/// Stored at [`CONTROL_KEY`] in the `CONTROL` array map. Written only by the
/// userspace breakpoint manager. Each field lives in its own naturally
/// aligned slot so a probe never observes a half-written field.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ControlState {
    /// Master switch: 0 = every probe returns immediately
    pub global_enable: u32,

    /// 0 = trace all processes, otherwise only this TGID
    pub target_pid: u32,

    /// `MODE_FULL` or `MODE_BREAKPOINTS_ONLY`
    pub debug_mode: u8,

    #[allow(clippy::pub_underscore_fields)]
    pub _reserved: [u8; 3],

    #[allow(clippy::pub_underscore_fields)]
    pub _reserved2: u32,
}

impl ControlState {
    /// Whether a probe hit from `pid` may emit an event
    ///
    /// O(1) and side-effect-free; this is the hot-path check.
    #[inline(always)]
    #[must_use]
    pub const fn admits(&self, pid: u32) -> bool {
        self.global_enable != 0 && (self.target_pid == 0 || self.target_pid == pid)
    }

    /// What the exit probe does with a return from `pid`
    ///
    /// `entry_recorded` is whether `ENTRY_IPS` held a slot for the thread.
    /// Returns without a recorded entry were already counted by the entry probe.
    #[inline(always)]
    #[must_use]
    pub const fn exit_action(&self, pid: u32, entry_recorded: bool) -> ExitAction {
        if !entry_recorded {
            ExitAction::Skip
        } else if self.admits(pid) && self.debug_mode == MODE_FULL {
            ExitAction::Emit
        } else {
            ExitAction::Filter
        }
    }
}

/// Outcome of [`ControlState::exit_action`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitAction {
    /// Ignore silently
    Skip,
    /// Count as filtered
    Filter,
    /// Emit a function-exit event
    Emit,
}

/// Function name registered for a probed address (`PROBE_SYMBOLS` map value)
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeSymbol {
    pub name: [u8; MAX_FUNCTION_NAME],
}

impl ProbeSymbol {
    /// Build from a name, truncating and NUL-terminating it
    #[must_use]
    pub fn new(name: &[u8]) -> Self {
        let mut symbol = Self { name: [0; MAX_FUNCTION_NAME] };
        copy_name(&mut symbol.name, name);
        symbol
    }
}

/// Copy `src` into `dst` with guaranteed NUL termination
///
/// Copies at most `MAX_FUNCTION_NAME - 1` bytes, stops at the first NUL in
/// `src`, never reads past `src.len()`, and zero-fills the remainder.
/// Returns the number of name bytes copied.
#[inline(always)]
pub fn copy_name(dst: &mut [u8; MAX_FUNCTION_NAME], src: &[u8]) -> usize {
    let mut copied = 0;
    for i in 0..MAX_FUNCTION_NAME - 1 {
        if i >= src.len() || src[i] == 0 {
            break;
        }
        dst[i] = src[i];
        copied += 1;
    }
    for slot in dst.iter_mut().skip(copied) {
        *slot = 0;
    }
    copied
}

// Layout is part of the contract: a change here must bump CONTRACT_VERSION.
const _: () = assert!(core::mem::size_of::<RegisterSnapshot>() == REGISTER_COUNT * 8);
const _: () = assert!(core::mem::size_of::<DebugEvent>() == DEBUG_EVENT_SIZE);
const _: () = assert!(core::mem::size_of::<ControlState>() == CONTROL_STATE_SIZE);

#[cfg(feature = "user")]
use aya::Pod;

// Pod lets aya copy these types in and out of maps as plain bytes
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for DebugEvent {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for ControlState {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for ProbeSymbol {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_name_truncates_and_terminates() {
        let long = [b'x'; 200];
        let mut dst = [0xffu8; MAX_FUNCTION_NAME];
        let copied = copy_name(&mut dst, &long);
        assert_eq!(copied, MAX_FUNCTION_NAME - 1);
        assert_eq!(dst[MAX_FUNCTION_NAME - 1], 0);
    }

    #[test]
    fn test_copy_name_stops_at_nul_and_clears_tail() {
        let mut dst = [0xffu8; MAX_FUNCTION_NAME];
        let copied = copy_name(&mut dst, b"vfs_read\0garbage");
        assert_eq!(copied, 8);
        assert_eq!(&dst[..8], b"vfs_read");
        assert!(dst[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_control_admits() {
        let mut control = ControlState::default();
        assert!(!control.admits(42));

        control.global_enable = 1;
        assert!(control.admits(42));

        control.target_pid = 7;
        assert!(!control.admits(42));
        assert!(control.admits(7));
    }

    #[test]
    fn test_exit_action_counts_only_recorded_entries() {
        let mut control = ControlState { global_enable: 1, ..ControlState::default() };

        control.debug_mode = MODE_BREAKPOINTS_ONLY;
        assert_eq!(control.exit_action(42, false), ExitAction::Skip);
        assert_eq!(control.exit_action(42, true), ExitAction::Filter);

        control.debug_mode = MODE_FULL;
        assert_eq!(control.exit_action(42, false), ExitAction::Skip);
        assert_eq!(control.exit_action(42, true), ExitAction::Emit);

        control.target_pid = 7;
        assert_eq!(control.exit_action(42, true), ExitAction::Filter);
        assert_eq!(control.exit_action(7, true), ExitAction::Emit);
    }

    #[test]
    fn test_register_values_follow_names() {
        let regs = RegisterSnapshot { sp: 3, a0: 11, t6: 32, ..RegisterSnapshot::default() };
        let values = regs.values();
        assert_eq!(values[REGISTER_NAMES.iter().position(|n| *n == "sp").unwrap()], 3);
        assert_eq!(values[REGISTER_NAMES.iter().position(|n| *n == "a0").unwrap()], 11);
        assert_eq!(values[REGISTER_COUNT - 1], 32);
    }
}
