//! Ingestion counters shared between the ingestion thread and the front end

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters updated by the ingestion loop
#[derive(Debug, Default)]
pub struct IngestStats {
    records: AtomicU64,
    applied: AtomicU64,
    malformed: AtomicU64,
    kernel_dropped: AtomicU64,
    recording_failures: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestCounters {
    /// Records read from the source
    pub records: u64,
    /// Records decoded and applied to the session
    pub applied: u64,
    /// Records discarded by the decoder
    pub malformed: u64,
    /// Events the probe could not reserve ring buffer space for
    pub kernel_dropped: u64,
    /// Failed writes to the recording, which is closed on the first one
    pub recording_failures: u64,
}

/// Per-CPU probe counters summed over all CPUs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelCounters {
    pub emitted: u64,
    pub dropped: u64,
    pub filtered: u64,
}

impl IngestStats {
    pub fn record_seen(&self) {
        self.records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_applied(&self) {
        self.applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recording_failed(&self) {
        self.recording_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// The kernel counter is absolute, so it is stored rather than added
    pub fn set_kernel_dropped(&self, dropped: u64) {
        self.kernel_dropped.store(dropped, Ordering::Relaxed);
    }

    #[must_use]
    pub fn counters(&self) -> IngestCounters {
        IngestCounters {
            records: self.records.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            kernel_dropped: self.kernel_dropped.load(Ordering::Relaxed),
            recording_failures: self.recording_failures.load(Ordering::Relaxed),
        }
    }
}
