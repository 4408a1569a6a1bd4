//! # eBPF Program Loading and Map Setup
//!
//! Loads the compiled probe object and takes ownership of its maps.
//!
//! ## Functions
//!
//! - [`load_ebpf_program()`] - Load eBPF bytecode from the embedded binary
//! - [`init_ebpf_logger()`] - Forward probe-side log lines to `log`
//! - [`take_event_source()`] - `EVENTS` + `EVENT_COUNTERS` as a record source
//! - [`EbpfControl::take()`] - `CONTROL` + `BREAKPOINTS` as a control sink
//!
//! Every typed map conversion checks the map's value size against the Rust
//! type; a mismatch is reported as [`ContractError::LayoutMismatch`].

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use aya::{
    include_bytes_aligned,
    maps::{Array, HashMap, MapData, MapError, PerCpuArray, RingBuf},
    Ebpf,
};
use aya_log::EbpfLogger;
use kdbg_common::{ControlState, CONTROL_KEY};
use log::{debug, warn};

use crate::breakpoints::{ControlSink, ControlUpdate};
use crate::domain::{Address, ContractError, ControlError};
use crate::ingest::RingBufSource;

/// Load the eBPF program binary
///
/// Always the release build: debug builds of BPF targets pull in formatting
/// code the verifier rejects.
///
/// # Errors
/// Returns an error if the eBPF program binary cannot be loaded
pub fn load_ebpf_program() -> Result<Ebpf> {
    let bpf =
        Ebpf::load(include_bytes_aligned!("../../../target/bpfel-unknown-none/release/kdbg"))
            .context("Failed to load eBPF object")?;
    Ok(bpf)
}

/// Initialize eBPF logger
pub fn init_ebpf_logger(bpf: &mut Ebpf) {
    if let Err(e) = EbpfLogger::init(bpf) {
        warn!("Failed to initialize eBPF logger: {e}");
    }
}

/// Turn a wrong value size into a contract error
pub(super) fn layout_checked<T>(map: &'static str, result: Result<T, MapError>) -> Result<T> {
    result.map_err(|e| match e {
        MapError::InvalidValueSize { size, expected } => {
            anyhow::Error::new(ContractError::LayoutMismatch { map, expected, found: size })
        }
        other => anyhow::Error::new(other).context(format!("{map} map has unexpected type")),
    })
}

/// Take the ring buffer and drop counters out of the object
///
/// # Errors
/// Returns an error if `EVENTS` is missing or has the wrong type
pub fn take_event_source(bpf: &mut Ebpf) -> Result<RingBufSource> {
    let ring = RingBuf::try_from(bpf.take_map("EVENTS").context("EVENTS map not found")?)?;

    let counters = match bpf.take_map("EVENT_COUNTERS") {
        Some(map) => Some(layout_checked("EVENT_COUNTERS", PerCpuArray::try_from(map))?),
        None => {
            warn!("EVENT_COUNTERS map not found, drop counts unavailable");
            None
        }
    };

    Ok(RingBufSource::new(ring, counters))
}

// ============================================================================
// Control sink
// ============================================================================

/// Publishes control updates into the `CONTROL` and `BREAKPOINTS` maps
///
/// Keeps the set of addresses known to be in `BREAKPOINTS` and only writes the
/// difference. New breakpoints are inserted before the control record is
/// written and stale ones removed after it, so a probe never sees
/// `global_enable` for a breakpoint that is not in the map yet.
pub struct EbpfControl {
    control: Array<MapData, ControlState>,
    breakpoints: HashMap<MapData, u64, u8>,
    published: BTreeSet<Address>,
}

impl EbpfControl {
    /// # Errors
    /// Returns an error if a map is missing or its layout does not match
    pub fn take(bpf: &mut Ebpf) -> Result<Self> {
        let control = layout_checked(
            "CONTROL",
            Array::try_from(bpf.take_map("CONTROL").context("CONTROL map not found")?),
        )?;
        let breakpoints = layout_checked(
            "BREAKPOINTS",
            HashMap::try_from(bpf.take_map("BREAKPOINTS").context("BREAKPOINTS map not found")?),
        )?;
        Ok(Self { control, breakpoints, published: BTreeSet::new() })
    }
}

impl ControlSink for EbpfControl {
    fn publish(&mut self, update: &ControlUpdate) -> Result<(), ControlError> {
        let desired: BTreeSet<Address> = update.enabled_addresses.iter().copied().collect();

        let missing: Vec<Address> = desired.difference(&self.published).copied().collect();
        for address in missing {
            self.breakpoints
                .insert(address.value(), 1, 0)
                .map_err(|e| map_write("BREAKPOINTS", &e))?;
            self.published.insert(address);
        }

        self.control
            .set(CONTROL_KEY, update.control, 0)
            .map_err(|e| map_write("CONTROL", &e))?;

        let stale: Vec<Address> = self.published.difference(&desired).copied().collect();
        for address in stale {
            match self.breakpoints.remove(&address.value()) {
                Ok(()) | Err(MapError::KeyNotFound) => {}
                Err(e) => return Err(map_write("BREAKPOINTS", &e)),
            }
            self.published.remove(&address);
        }

        debug!(
            "Published control: enable={} mode={} breakpoints={}",
            update.control.global_enable,
            update.control.debug_mode,
            self.published.len()
        );
        Ok(())
    }
}

fn map_write(map: &'static str, err: &MapError) -> ControlError {
    ControlError::MapWrite { map, reason: err.to_string() }
}
