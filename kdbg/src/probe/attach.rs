//! Entry/exit kprobe attachment

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use aya::{
    maps::{HashMap, MapData},
    programs::{kprobe::KProbeLinkId, KProbe, ProgramError},
    Ebpf,
};
use kdbg_common::ProbeSymbol;
use log::{info, warn};

use super::ebpf_setup::layout_checked;
use super::kallsyms::KernelSymbols;
use super::{ProbeAttacher, ProbeHandle};
use crate::domain::{Address, AttachError};

const ENTRY_PROGRAM: &str = "function_entry";
const EXIT_PROGRAM: &str = "function_exit";

struct AttachedProbe {
    function: String,
    address: Option<Address>,
    entry: KProbeLinkId,
    exit: KProbeLinkId,
}

/// Attaches the `function_entry` kprobe and `function_exit` kretprobe
///
/// Owns the loaded object for as long as probes may be attached; dropping the
/// attacher detaches everything.
pub struct KprobeAttacher {
    bpf: Ebpf,
    symbols: KernelSymbols,
    probe_symbols: HashMap<MapData, u64, ProbeSymbol>,
    attached: BTreeMap<u64, AttachedProbe>,
    next_id: u64,
}

impl KprobeAttacher {
    /// Load both programs into the kernel
    ///
    /// Take every map the caller needs out of `bpf` before handing it over.
    ///
    /// # Errors
    /// Returns an error if a program is missing or the verifier rejects it
    pub fn new(mut bpf: Ebpf, symbols: KernelSymbols) -> Result<Self> {
        let probe_symbols = layout_checked(
            "PROBE_SYMBOLS",
            HashMap::try_from(
                bpf.take_map("PROBE_SYMBOLS").context("PROBE_SYMBOLS map not found")?,
            ),
        )?;

        for name in [ENTRY_PROGRAM, EXIT_PROGRAM] {
            let program: &mut KProbe = bpf
                .program_mut(name)
                .with_context(|| format!("{name} program not found"))?
                .try_into()?;
            program.load().with_context(|| format!("Failed to load {name}"))?;
        }
        info!("✓ Loaded kprobe programs");

        Ok(Self { bpf, symbols, probe_symbols, attached: BTreeMap::new(), next_id: 1 })
    }

    fn program(&mut self, name: &str) -> Result<&mut KProbe, AttachError> {
        let program = self
            .bpf
            .program_mut(name)
            .ok_or_else(|| AttachError::Unavailable(format!("{name} program not found")))?;
        program.try_into().map_err(|e: ProgramError| AttachError::Unavailable(e.to_string()))
    }
}

impl ProbeAttacher for KprobeAttacher {
    fn attach(&mut self, function: &str) -> Result<ProbeHandle, AttachError> {
        let failed =
            |reason: String| AttachError::AttachFailed { function: function.to_string(), reason };

        if self.attached.values().any(|probe| probe.function == function) {
            return Err(failed("already attached".into()));
        }

        // Unknown names are left to the kernel; kallsyms may be restricted
        let address = self.symbols.address_of(function).filter(|a| a.value() != 0);
        if address.is_none() {
            warn!("{function} not found in kallsyms, events will carry no name");
        }

        let entry =
            self.program(ENTRY_PROGRAM)?.attach(function, 0).map_err(|e| failed(e.to_string()))?;
        let exit = match self.program(EXIT_PROGRAM)?.attach(function, 0) {
            Ok(link) => link,
            Err(e) => {
                if let Err(detach_err) = self.program(ENTRY_PROGRAM)?.detach(entry) {
                    warn!("Failed to roll back entry probe on {function}: {detach_err}");
                }
                return Err(failed(e.to_string()));
            }
        };

        if let Some(address) = address {
            let name = ProbeSymbol::new(function.as_bytes());
            if let Err(e) = self.probe_symbols.insert(address.value(), name, 0) {
                warn!("Failed to register name for {function}: {e}");
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        self.attached.insert(
            id,
            AttachedProbe { function: function.to_string(), address, entry, exit },
        );
        info!("✓ Attached kprobe + kretprobe: {function}");

        Ok(ProbeHandle { id, function: function.to_string(), address })
    }

    fn detach(&mut self, handle: &ProbeHandle) -> Result<(), AttachError> {
        let probe = self.attached.remove(&handle.id).ok_or(AttachError::UnknownHandle(handle.id))?;
        let failed = |e: ProgramError| AttachError::AttachFailed {
            function: probe.function.clone(),
            reason: format!("detach: {e}"),
        };

        self.program(ENTRY_PROGRAM)?.detach(probe.entry).map_err(failed)?;
        self.program(EXIT_PROGRAM)?.detach(probe.exit).map_err(failed)?;

        if let Some(address) = probe.address {
            let _ = self.probe_symbols.remove(&address.value());
        }
        info!("Detached probes from {}", probe.function);
        Ok(())
    }
}
