//! # Kernel Probe Management
//!
//! Loading the probe object, attaching it to kernel functions and keeping its
//! control maps in sync with the breakpoint set.
//!
//! ## Sub-Modules
//!
//! - `ebpf_setup` - load the object, start the probe logger, take the maps
//! - `attach` - [`KprobeAttacher`], entry + exit kprobes per function
//! - `kallsyms` - `/proc/kallsyms` lookups
//! - `diagnostics` - end-of-session counter report

mod attach;
mod diagnostics;
mod ebpf_setup;
mod kallsyms;

pub use attach::KprobeAttacher;
pub use diagnostics::print_diagnostics;
pub use ebpf_setup::{init_ebpf_logger, load_ebpf_program, take_event_source, EbpfControl};
pub use kallsyms::{KernelSymbol, KernelSymbols};

use crate::domain::{Address, AttachError};

/// An installed pair of entry/exit probes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeHandle {
    pub id: u64,
    pub function: String,
    /// Kernel address the probe reports, when known
    pub address: Option<Address>,
}

/// Installs and removes probes on kernel functions
pub trait ProbeAttacher: Send {
    /// # Errors
    /// [`AttachError`] if the function cannot be probed.
    fn attach(&mut self, function: &str) -> Result<ProbeHandle, AttachError>;

    /// # Errors
    /// [`AttachError`] if the handle is unknown or removal failed.
    fn detach(&mut self, handle: &ProbeHandle) -> Result<(), AttachError>;
}
