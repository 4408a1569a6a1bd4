//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers prevent common bugs like passing a TID where a
//! PID is expected, or a register value where a breakpoint address is.

use std::fmt;
use std::str::FromStr;

/// Process ID (TGID in kernel terms)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

/// Thread ID (PID in kernel terms)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Tid(pub u32);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TID:{}", self.0)
    }
}

/// CPU ID
///
/// Represents a CPU core ID (0, 1, 2, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CpuId(pub u32);

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CPU:{}", self.0)
    }
}

/// Timestamp in nanoseconds
///
/// Monotonic, relative to boot (from `bpf_ktime_get_ns()`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Convert to seconds (f64)
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn as_seconds(self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }
}

/// Kernel virtual address
///
/// Breakpoints are keyed by address; ordering is numeric so iteration over a
/// breakpoint set is deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub u64);

impl Address {
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

impl From<u64> for Address {
    fn from(value: u64) -> Self {
        Address(value)
    }
}

impl FromStr for Address {
    type Err = std::num::ParseIntError;

    /// Accepts `0x`-prefixed hex or plain decimal
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16)?,
            None => s.parse()?,
        };
        Ok(Address(value))
    }
}
