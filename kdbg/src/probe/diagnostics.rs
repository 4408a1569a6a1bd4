use crate::ingest::IngestSummary;

/// Print end-of-session counters
///
/// Shows how many records reached user space and, for live sessions, what the
/// probe itself counted:
/// - Events emitted into the ring buffer
/// - Events dropped because the ring buffer was full
/// - Probe hits filtered out by PID or debug mode
pub fn print_diagnostics(summary: &IngestSummary) {
    let counters = &summary.counters;
    println!("\ningestion ({:.1}s):", summary.elapsed.as_secs_f64());
    println!("   - Records read: {}", counters.records);
    println!("   - Events applied: {}", counters.applied);
    println!("   - Malformed records: {}", counters.malformed);
    if counters.recording_failures > 0 {
        println!("   - Recording: stopped after a write failure");
    }

    match summary.kernel {
        Some(kernel) => {
            println!("probe:");
            println!("   - Events emitted: {}", kernel.emitted);
            println!("   - Events dropped (ring buffer full): {}", kernel.dropped);
            println!("   - Hits filtered: {}", kernel.filtered);
        }
        None if summary.exhausted => println!("   - Source: recording (replayed to the end)"),
        None => {}
    }
}
