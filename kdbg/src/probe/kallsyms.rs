//! `/proc/kallsyms` parsing
//!
//! Each line is `<address> <type> <name> [\[module\]]`. Only text symbols
//! (types `t`, `T`, `w`, `W`) are kept; those are the ones a kprobe can target.
//! Without `CAP_SYSLOG` (or with `kptr_restrict`) every address reads as zero.

use std::collections::HashMap;
use std::fs;
use std::io;

use crate::domain::{Address, AttachError};

const KALLSYMS_PATH: &str = "/proc/kallsyms";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSymbol {
    pub address: Address,
    pub name: String,
    pub module: Option<String>,
}

/// Kernel text symbols, searchable by name and by address
#[derive(Debug, Default)]
pub struct KernelSymbols {
    /// Sorted by address
    symbols: Vec<KernelSymbol>,
    by_name: HashMap<String, usize>,
}

impl KernelSymbols {
    /// # Errors
    /// Returns an error if `/proc/kallsyms` cannot be read.
    pub fn load() -> io::Result<Self> {
        Ok(Self::parse(&fs::read_to_string(KALLSYMS_PATH)?))
    }

    /// Parse kallsyms text, skipping lines that do not fit the format
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut symbols: Vec<KernelSymbol> = text.lines().filter_map(parse_line).collect();
        symbols.sort_by_key(|s| s.address);

        let mut by_name = HashMap::with_capacity(symbols.len());
        for (i, symbol) in symbols.iter().enumerate() {
            // Duplicate static names: the lowest address wins
            by_name.entry(symbol.name.clone()).or_insert(i);
        }
        Self { symbols, by_name }
    }

    #[must_use]
    pub fn address_of(&self, name: &str) -> Option<Address> {
        self.by_name.get(name).map(|&i| self.symbols[i].address)
    }

    /// Symbol containing `address` and the offset into it
    #[must_use]
    pub fn resolve(&self, address: Address) -> Option<(&KernelSymbol, u64)> {
        let idx = self.symbols.partition_point(|s| s.address <= address).checked_sub(1)?;
        let symbol = &self.symbols[idx];
        Some((symbol, address.value() - symbol.address.value()))
    }

    /// Function whose entry is exactly `address`, reachable by a probe on its name
    ///
    /// # Errors
    /// [`AttachError::NotFunctionEntry`] for addresses inside a function or
    /// outside every known one, [`AttachError::ShadowedSymbol`] when an earlier
    /// function shares the name.
    pub fn function_at(&self, address: Address) -> Result<&KernelSymbol, AttachError> {
        let symbol = match self.resolve(address) {
            Some((symbol, 0)) if address.value() != 0 => symbol,
            _ => return Err(AttachError::NotFunctionEntry(address)),
        };
        if self.address_of(&symbol.name) != Some(address) {
            return Err(AttachError::ShadowedSymbol { address, name: symbol.name.clone() });
        }
        Ok(symbol)
    }

    /// Functions to probe: `probes` followed by the function of every
    /// breakpoint address, each once
    ///
    /// # Errors
    /// The first breakpoint address [`KernelSymbols::function_at`] rejects.
    pub fn probe_set(
        &self,
        probes: &[String],
        breakpoints: impl IntoIterator<Item = Address>,
    ) -> Result<Vec<String>, AttachError> {
        let mut set: Vec<String> = Vec::with_capacity(probes.len());
        for function in probes {
            if !set.contains(function) {
                set.push(function.clone());
            }
        }
        for address in breakpoints {
            let name = &self.function_at(address)?.name;
            if !set.contains(name) {
                set.push(name.clone());
            }
        }
        Ok(set)
    }

    /// Addresses are hidden from this process
    #[must_use]
    pub fn addresses_hidden(&self) -> bool {
        !self.symbols.is_empty() && self.symbols.iter().all(|s| s.address.value() == 0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

fn parse_line(line: &str) -> Option<KernelSymbol> {
    let mut fields = line.split_whitespace();
    let address = u64::from_str_radix(fields.next()?, 16).ok()?;
    let kind = fields.next()?;
    if !matches!(kind, "t" | "T" | "w" | "W") {
        return None;
    }
    let name = fields.next()?.to_string();
    let module = fields
        .next()
        .map(|m| m.trim_start_matches('[').trim_end_matches(']').to_string());

    Some(KernelSymbol { address: Address(address), name, module })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
ffffffff81000000 T _stext
ffffffff81001000 T vfs_read
ffffffff81001200 t helper_fn
ffffffff81002000 D some_data
ffffffffc0a00000 t ext4_fn\t[ext4]
ffffffff81003000 t helper_fn
garbage line
";

    #[test]
    fn test_parse_keeps_text_symbols() {
        let symbols = KernelSymbols::parse(SAMPLE);
        assert_eq!(symbols.len(), 5);
        assert_eq!(symbols.address_of("vfs_read"), Some(Address(0xffff_ffff_8100_1000)));
        assert_eq!(symbols.address_of("some_data"), None);
    }

    #[test]
    fn test_duplicate_name_resolves_to_lowest_address() {
        let symbols = KernelSymbols::parse(SAMPLE);
        assert_eq!(symbols.address_of("helper_fn"), Some(Address(0xffff_ffff_8100_1200)));
    }

    #[test]
    fn test_module_is_captured() {
        let symbols = KernelSymbols::parse(SAMPLE);
        let (symbol, offset) = symbols.resolve(Address(0xffff_ffff_c0a0_0010)).unwrap();
        assert_eq!(symbol.name, "ext4_fn");
        assert_eq!(symbol.module.as_deref(), Some("ext4"));
        assert_eq!(offset, 0x10);
    }

    #[test]
    fn test_resolve_by_address() {
        let symbols = KernelSymbols::parse(SAMPLE);
        let (symbol, offset) = symbols.resolve(Address(0xffff_ffff_8100_1004)).unwrap();
        assert_eq!(symbol.name, "vfs_read");
        assert_eq!(offset, 4);
        assert!(symbols.resolve(Address(0x1000)).is_none());
    }

    #[test]
    fn test_hidden_addresses() {
        let symbols =
            KernelSymbols::parse("0000000000000000 T vfs_read\n0000000000000000 T vfs_write\n");
        assert!(symbols.addresses_hidden());
        assert!(!KernelSymbols::parse(SAMPLE).addresses_hidden());
    }

    #[test]
    fn test_probe_set_adds_breakpoint_functions() {
        let symbols = KernelSymbols::parse(SAMPLE);
        let probes = symbols
            .probe_set(
                &["vfs_write".to_string(), "vfs_read".to_string()],
                [Address(0xffff_ffff_8100_1000), Address(0xffff_ffff_c0a0_0000)],
            )
            .unwrap();
        assert_eq!(probes, vec!["vfs_write", "vfs_read", "ext4_fn"]);
    }

    #[test]
    fn test_probe_set_rejects_unreachable_breakpoints() {
        let symbols = KernelSymbols::parse(SAMPLE);
        let reject = |address: u64| symbols.probe_set(&[], [Address(address)]).unwrap_err();

        // Inside a function
        assert!(matches!(reject(0xffff_ffff_8100_1004), AttachError::NotFunctionEntry(_)));
        // Below every symbol
        assert!(matches!(reject(0x1000), AttachError::NotFunctionEntry(_)));
        // Second static function of the same name
        assert!(matches!(
            reject(0xffff_ffff_8100_3000),
            AttachError::ShadowedSymbol { name, .. } if name == "helper_fn"
        ));
    }

    #[test]
    fn test_hidden_addresses_reject_every_breakpoint() {
        let symbols = KernelSymbols::parse("0000000000000000 T vfs_read\n");
        assert!(symbols.probe_set(&[], [Address(0xffff_ffff_8100_1000)]).is_err());
        assert!(symbols.probe_set(&[], [Address(0)]).is_err());
    }
}
