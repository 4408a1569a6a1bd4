//! # Wire Contract Decoding
//!
//! Turns raw ring buffer records into typed [`ProbeEvent`]s and back.
//!
//! ## Validation
//!
//! 1. Size: records shorter than [`DEBUG_EVENT_SIZE`] are malformed. Longer
//!    records are accepted; trailing bytes are reserved for future fields.
//! 2. Version: the leading word must equal [`CONTRACT_VERSION`]. Anything else
//!    is a [`ContractError`], which the ingestion service treats as fatal.
//! 3. Kind: an unknown event kind is malformed.

use std::fmt;

use kdbg_common::{
    DebugEvent, RegisterSnapshot, CONTRACT_VERSION, DEBUG_EVENT_SIZE, EVENT_BREAKPOINT,
    EVENT_FUNCTION_ENTRY, EVENT_FUNCTION_EXIT, FLAG_REGISTERS, FLAG_REGISTERS_PARTIAL,
    FLAG_RETURN_VALUE,
};

use crate::domain::{Address, ContractError, CpuId, DecodeError, Pid, Tid, Timestamp};

/// What the probe observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Entry,
    Exit,
    BreakpointHit,
}

impl TryFrom<u8> for EventKind {
    type Error = DecodeError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            EVENT_FUNCTION_ENTRY => Ok(EventKind::Entry),
            EVENT_FUNCTION_EXIT => Ok(EventKind::Exit),
            EVENT_BREAKPOINT => Ok(EventKind::BreakpointHit),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }
}

impl From<EventKind> for u8 {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Entry => EVENT_FUNCTION_ENTRY,
            EventKind::Exit => EVENT_FUNCTION_EXIT,
            EventKind::BreakpointHit => EVENT_BREAKPOINT,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            EventKind::Entry => "entry",
            EventKind::Exit => "exit",
            EventKind::BreakpointHit => "breakpoint",
        })
    }
}

/// How much of a register snapshot the trap context actually provided
///
/// `Partial` snapshots are advisory: zero may mean "not captured".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegisterConfidence {
    Full,
    Partial,
    #[default]
    Unavailable,
}

impl RegisterConfidence {
    fn from_flags(flags: u8) -> Self {
        if flags & FLAG_REGISTERS == 0 {
            RegisterConfidence::Unavailable
        } else if flags & FLAG_REGISTERS_PARTIAL != 0 {
            RegisterConfidence::Partial
        } else {
            RegisterConfidence::Full
        }
    }
}

/// A decoded probe event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeEvent {
    pub timestamp: Timestamp,
    pub pid: Pid,
    pub tid: Tid,
    pub cpu: CpuId,
    pub kind: EventKind,
    /// Empty when the probe had no symbol registered for the address
    pub function: String,
    pub address: Address,
    pub return_value: Option<u64>,
    pub registers: Option<RegisterSnapshot>,
    pub confidence: RegisterConfidence,
}

impl ProbeEvent {
    /// Function name, or the hex address when no name was captured
    #[must_use]
    pub fn display_name(&self) -> String {
        if self.function.is_empty() {
            format!("{}", self.address)
        } else {
            self.function.clone()
        }
    }
}

/// Decode and validate the fixed-size prefix of a record
///
/// # Errors
/// [`DecodeError::Truncated`] for short records, [`DecodeError::Contract`]
/// when the version tag does not match.
pub fn decode_raw(bytes: &[u8]) -> Result<DebugEvent, DecodeError> {
    if bytes.len() < DEBUG_EVENT_SIZE {
        return Err(DecodeError::Truncated { len: bytes.len(), min: DEBUG_EVENT_SIZE });
    }

    // SAFETY: the buffer holds at least size_of::<DebugEvent>() bytes and every
    // bit pattern is a valid DebugEvent (plain integers and byte arrays)
    #[allow(unsafe_code)]
    let event = unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<DebugEvent>()) };

    if event.version != CONTRACT_VERSION {
        return Err(ContractError::VersionMismatch {
            expected: CONTRACT_VERSION,
            found: event.version,
        }
        .into());
    }

    Ok(event)
}

/// Decode a record into a typed event
///
/// # Errors
/// See [`decode_raw`]; additionally [`DecodeError::UnknownKind`].
pub fn decode(bytes: &[u8]) -> Result<ProbeEvent, DecodeError> {
    let raw = decode_raw(bytes)?;
    let kind = EventKind::try_from(raw.kind)?;
    let confidence = RegisterConfidence::from_flags(raw.flags);

    Ok(ProbeEvent {
        timestamp: Timestamp(raw.timestamp_ns),
        pid: Pid(raw.pid),
        tid: Tid(raw.tid),
        cpu: CpuId(raw.cpu),
        kind,
        function: String::from_utf8_lossy(raw.function_name_bytes()).into_owned(),
        address: Address(raw.instruction_pointer),
        return_value: (raw.flags & FLAG_RETURN_VALUE != 0).then_some(raw.return_value),
        registers: (confidence != RegisterConfidence::Unavailable).then_some(raw.registers),
        confidence,
    })
}

/// Exact wire bytes of a raw event
#[must_use]
pub fn encode_event(event: &DebugEvent) -> Vec<u8> {
    // SAFETY: DebugEvent is repr(C) with explicit reserved fields and no
    // implicit padding, so all DEBUG_EVENT_SIZE bytes are initialised
    #[allow(unsafe_code)]
    let bytes = unsafe {
        std::slice::from_raw_parts(std::ptr::from_ref(event).cast::<u8>(), DEBUG_EVENT_SIZE)
    };
    bytes.to_vec()
}
