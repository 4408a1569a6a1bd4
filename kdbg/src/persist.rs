//! Breakpoint files
//!
//! ```json
//! { "version": 1,
//!   "breakpoints": [
//!     { "address": "0xffffffff81001000", "symbol": "vfs_read", "enabled": true }
//!   ] }
//! ```
//!
//! Addresses are hex strings: kernel addresses do not fit the integer range
//! many JSON tools handle exactly.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::breakpoints::Breakpoint;
use crate::domain::{Address, PersistError};

pub const BREAKPOINT_FILE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedBreakpoint {
    pub address: Address,
    pub symbol: String,
    pub enabled: bool,
}

#[derive(Serialize, Deserialize)]
struct BreakpointFile {
    version: u32,
    breakpoints: Vec<BreakpointEntry>,
}

#[derive(Serialize, Deserialize)]
struct BreakpointEntry {
    address: String,
    #[serde(default)]
    symbol: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// # Errors
/// Returns an error if serialization or writing fails.
pub fn write_breakpoints<W: Write>(out: W, breakpoints: &[Breakpoint]) -> Result<(), PersistError> {
    let file = BreakpointFile {
        version: BREAKPOINT_FILE_VERSION,
        breakpoints: breakpoints
            .iter()
            .map(|bp| BreakpointEntry {
                address: format!("{:#x}", bp.address.value()),
                symbol: bp.symbol.clone(),
                enabled: bp.enabled,
            })
            .collect(),
    };
    serde_json::to_writer_pretty(out, &file)?;
    Ok(())
}

/// # Errors
/// [`PersistError::UnsupportedVersion`], [`PersistError::InvalidAddress`] or a
/// JSON error.
pub fn read_breakpoints<R: Read>(input: R) -> Result<Vec<SavedBreakpoint>, PersistError> {
    let file: BreakpointFile = serde_json::from_reader(input)?;
    if file.version != BREAKPOINT_FILE_VERSION {
        return Err(PersistError::UnsupportedVersion(file.version));
    }

    file.breakpoints
        .into_iter()
        .map(|entry| {
            let address: Address = entry
                .address
                .parse()
                .map_err(|_| PersistError::InvalidAddress(entry.address.clone()))?;
            Ok(SavedBreakpoint { address, symbol: entry.symbol, enabled: entry.enabled })
        })
        .collect()
}

/// # Errors
/// Returns an error if the file cannot be created or written.
pub fn save_breakpoints(path: &Path, breakpoints: &[Breakpoint]) -> Result<(), PersistError> {
    let mut out = BufWriter::new(File::create(path)?);
    write_breakpoints(&mut out, breakpoints)?;
    out.flush()?;
    Ok(())
}

/// # Errors
/// Returns an error if the file cannot be read or parsed.
pub fn load_breakpoints(path: &Path) -> Result<Vec<SavedBreakpoint>, PersistError> {
    read_breakpoints(BufReader::new(File::open(path)?))
}
