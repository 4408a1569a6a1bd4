//! Resolve a process name to the PID used as the probe's PID filter.

use anyhow::{bail, Context, Result};
use std::fs;

use crate::domain::Pid;

/// A process found under `/proc`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub command: String,
}

/// Find a process by name
///
/// Compares against `/proc/<pid>/comm`. An exact match wins; otherwise a
/// single substring match is accepted.
///
/// # Errors
/// - No processes found
/// - Multiple processes found (ambiguous)
pub fn find_process_by_name(name: &str) -> Result<ProcessInfo> {
    let mut processes = Vec::new();
    for entry in fs::read_dir("/proc").context("Failed to read /proc")?.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        let Ok(comm) = fs::read_to_string(entry.path().join("comm")) else {
            continue;
        };
        processes.push(ProcessInfo { pid: Pid(pid), command: comm.trim_end().to_string() });
    }

    select_process(processes, name)
}

fn select_process(processes: Vec<ProcessInfo>, name: &str) -> Result<ProcessInfo> {
    // comm is truncated to 15 bytes by the kernel
    let wanted: String = name.chars().take(15).collect();

    let (exact, partial): (Vec<_>, Vec<_>) = processes
        .into_iter()
        .filter(|p| p.command.contains(wanted.as_str()))
        .partition(|p| p.command == wanted);

    let mut matches = if exact.is_empty() { partial } else { exact };
    match matches.len() {
        0 => bail!(
            "No process matching '{name}' found.\n\
             Check running processes with: ps aux | grep {name}"
        ),
        1 => Ok(matches.remove(0)),
        _ => {
            let list: Vec<String> =
                matches.iter().map(|m| format!("  {} ({})", m.pid.0, m.command)).collect();
            bail!(
                "Multiple processes match '{name}':\n{}\n\n\
                 Specify PID explicitly: kdbg --pid <PID>",
                list.join("\n")
            )
        }
    }
}
