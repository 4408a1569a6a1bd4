//! Pre-flight checks for kdbg
//!
//! Validates system requirements before attempting to load eBPF programs.
//! Provides clear, actionable error messages when requirements aren't met.

#![allow(unsafe_code)] // geteuid() requires unsafe

use anyhow::{bail, Context, Result};
use log::warn;
use std::path::Path;

use crate::domain::Pid;

/// Ring buffer maps and `bpf_get_func_ip` for kprobes
const MIN_KERNEL_VERSION: (u32, u32) = (5, 15);

/// Run all pre-flight checks before eBPF loading
///
/// # Errors
/// Returns the first failed requirement
pub fn run_preflight_checks(target: Option<Pid>) -> Result<()> {
    check_privileges()?;
    check_kernel_version()?;
    check_kallsyms()?;
    if let Some(pid) = target {
        check_process_exists(pid)?;
    }
    Ok(())
}

/// Loading kprobes needs root (`CAP_BPF` + `CAP_PERFMON` + `CAP_SYSLOG`)
fn check_privileges() -> Result<()> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }

    bail!(
        "Permission denied: kdbg requires root privileges to attach kernel probes.\n\n\
         Run with: sudo kdbg ..."
    );
}

fn check_kernel_version() -> Result<()> {
    let version_str = std::fs::read_to_string("/proc/version")
        .context("Failed to read kernel version from /proc/version")?;

    // "Linux version 6.1.0-arch1-1 (...) ..."
    let release = version_str.split_whitespace().nth(2).unwrap_or("unknown");
    let Some((major, minor)) = parse_release(release) else {
        warn!("Could not parse kernel release {release:?}, skipping version check");
        return Ok(());
    };

    if (major, minor) < MIN_KERNEL_VERSION {
        bail!(
            "Kernel version {major}.{minor} is too old.\n\n\
             kdbg requires Linux {}.{} or newer (ring buffer maps, bpf_get_func_ip for kprobes).\n\
             Current kernel: {release}",
            MIN_KERNEL_VERSION.0,
            MIN_KERNEL_VERSION.1,
        );
    }

    Ok(())
}

/// `"6.1.0-arch1-1"` → `(6, 1)`
fn parse_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor: String = parts.next()?.chars().take_while(char::is_ascii_digit).collect();
    Some((major, minor.parse().ok()?))
}

/// Breakpoint symbols are resolved through kallsyms
fn check_kallsyms() -> Result<()> {
    let path = Path::new("/proc/kallsyms");
    std::fs::File::open(path).with_context(|| {
        "Cannot read /proc/kallsyms\n\n\
         Kernel symbol names cannot be resolved. Make sure /proc is mounted."
            .to_string()
    })?;
    Ok(())
}

/// Check if the target process exists
///
/// # Errors
/// Returns an error if `/proc/<pid>` does not exist
pub fn check_process_exists(pid: Pid) -> Result<()> {
    let proc_path = format!("/proc/{}", pid.0);
    if !Path::new(&proc_path).exists() {
        bail!(
            "Process {} not found.\n\n\
             Is the process still running? Check with: ps -p {}",
            pid.0,
            pid.0
        );
    }
    Ok(())
}
