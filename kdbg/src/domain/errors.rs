//! Structured error types for kdbg
//!
//! Using thiserror for automatic Display implementation and error chaining.
//!
//! Severity follows the taxonomy of the pipeline: contract mismatches and
//! session invariant violations are fatal, everything else is recovered
//! locally or reported to the caller.

use std::io;

use thiserror::Error;

use super::types::Address;

/// Kernel probe and userspace decoder disagree on the wire layout (fatal)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContractError {
    #[error(
        "contract version mismatch: probe reports {found:#010x}, decoder expects {expected:#010x}"
    )]
    VersionMismatch { expected: u32, found: u32 },

    #[error("map {map} has value size {found}, contract expects {expected}")]
    LayoutMismatch { map: &'static str, expected: usize, found: usize },
}

/// A ring buffer record could not be decoded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record too short: {len} bytes, need at least {min}")]
    Truncated { len: usize, min: usize },

    #[error("unknown event kind {0}")]
    UnknownKind(u8),

    #[error(transparent)]
    Contract(#[from] ContractError),
}

impl DecodeError {
    /// Only a contract mismatch stops ingestion; other failures are counted
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, DecodeError::Contract(_))
    }
}

/// User command errors on the breakpoint set (no state change)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BreakpointError {
    #[error("breakpoint at {0} already exists")]
    DuplicateBreakpoint(Address),

    #[error("no breakpoint at {0}")]
    BreakpointNotFound(Address),

    #[error("breakpoint limit of {limit} reached")]
    TooManyBreakpoints { limit: usize },
}

/// Probe installation failures (session continues un-instrumented)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttachError {
    #[error("failed to attach probes to {function}: {reason}")]
    AttachFailed { function: String, reason: String },

    #[error("kernel symbol {0} not found in /proc/kallsyms")]
    SymbolNotFound(String),

    #[error("breakpoint {0} is not the entry of a kernel function")]
    NotFunctionEntry(Address),

    #[error("breakpoint {address} is a second {name}; probes by name only reach the first")]
    ShadowedSymbol { address: Address, name: String },

    #[error("unknown probe handle {0}")]
    UnknownHandle(u64),

    #[error("probe attachment unavailable: {0}")]
    Unavailable(String),
}

/// Failure to publish control state into the kernel maps
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("failed to update {map}: {reason}")]
    MapWrite { map: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session lock poisoned")]
    LockPoisoned,

    #[error("session corrupted: {0}")]
    SessionCorrupted(String),

    #[error(transparent)]
    Breakpoint(#[from] BreakpointError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Attach(#[from] AttachError),
}

impl SessionError {
    /// Invariant violations are the only errors that end the process
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::LockPoisoned | SessionError::SessionCorrupted(_))
    }
}

/// Errors that terminate the ingestion thread
#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("waiting for ring buffer data failed: {0}")]
    Wait(#[source] io::Error),

    #[error("reading records failed: {0}")]
    Read(#[source] io::Error),

    #[error("ingestion thread panicked")]
    Panicked,
}

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("unsupported breakpoint file version {0}")]
    UnsupportedVersion(u32),

    #[error("invalid breakpoint address {0:?}")]
    InvalidAddress(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breakpoint_error_display() {
        let err = BreakpointError::DuplicateBreakpoint(Address(0x1000));
        assert_eq!(err.to_string(), "breakpoint at 0x0000000000001000 already exists");
    }

    #[test]
    fn test_fatality() {
        assert!(DecodeError::Contract(ContractError::VersionMismatch { expected: 1, found: 2 })
            .is_fatal());
        assert!(!DecodeError::Truncated { len: 3, min: 368 }.is_fatal());
        assert!(SessionError::LockPoisoned.is_fatal());
        assert!(!SessionError::from(BreakpointError::BreakpointNotFound(Address(1))).is_fatal());
    }

    #[test]
    fn test_attach_error_mentions_function() {
        let err = AttachError::AttachFailed {
            function: "vfs_read".to_string(),
            reason: "symbol not found".to_string(),
        };
        assert!(err.to_string().contains("vfs_read"));
        assert!(err.to_string().contains("symbol not found"));
    }
}
