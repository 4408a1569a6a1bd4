//! # Event Ingestion Service
//!
//! Drains a [`RecordSource`] on a dedicated thread and applies every decoded
//! event to the session.
//!
//! ## Loop
//!
//! 1. Drain at most [`DRAIN_BATCH`] records. For each record: count it, append
//!    it to the recording, decode it, apply it under the session lock.
//! 2. Refresh the kernel counters (at most every [`COUNTER_REFRESH`]).
//! 3. Unless the batch was full, wait on the source for at most the poll
//!    interval, outside the lock.
//! 4. Stop once the shared running flag is cleared or the source is exhausted.
//!
//! Malformed records are counted and skipped. A failing recording is counted,
//! closed and ingestion goes on without it. A contract mismatch, a poisoned
//! session lock or a failing source ends the loop and clears the running flag
//! so the front end shuts down as well.
//!
//! ## Ordering
//!
//! Events are applied in delivery order. The kernel ring buffer is shared by
//! all CPUs and hands out records in reservation order, so events of one CPU
//! are always in emission order; interleaving across CPUs is best-effort.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use log::{debug, error, info, warn};

use super::source::{RecordSource, RecordWriter};
use super::stats::{IngestCounters, KernelCounters};
use crate::contract::decode;
use crate::domain::{DecodeError, IngestError};
use crate::session::{SessionNotice, SharedSession};

/// Default bound on how long one wait may block
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Records applied between two checks of the running flag
pub const DRAIN_BATCH: usize = 4096;

/// Minimum time between two reads of the kernel counters
pub const COUNTER_REFRESH: Duration = Duration::from_millis(500);

/// Outcome of a clean ingestion run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub counters: IngestCounters,
    pub kernel: Option<KernelCounters>,
    /// The source ran dry (end of a recording)
    pub exhausted: bool,
    pub elapsed: Duration,
}

pub struct IngestionService {
    session: SharedSession,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
    recorder: Option<RecordWriter>,
    notices: Option<Sender<SessionNotice>>,
}

impl IngestionService {
    pub fn new(session: SharedSession, running: Arc<AtomicBool>) -> Self {
        Self {
            session,
            running,
            poll_interval: DEFAULT_POLL_INTERVAL,
            recorder: None,
            notices: None,
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Append every raw record to a recording
    #[must_use]
    pub fn with_recorder(mut self, recorder: RecordWriter) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Forward breakpoint hits and step completions; dropped when the channel is full
    #[must_use]
    pub fn with_notices(mut self, notices: Sender<SessionNotice>) -> Self {
        self.notices = Some(notices);
        self
    }

    /// Run the loop on a new thread
    ///
    /// # Errors
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn(self, source: Box<dyn RecordSource>) -> std::io::Result<IngestionHandle> {
        let running = Arc::clone(&self.running);
        let thread = std::thread::Builder::new()
            .name("kdbg-ingest".into())
            .spawn(move || self.run(source))?;
        Ok(IngestionHandle { running, thread })
    }

    /// Run the loop on the calling thread until shutdown or a fatal error
    ///
    /// # Errors
    /// [`IngestError`] for contract mismatches, a poisoned session lock or a
    /// failing source. The running flag is cleared before returning it.
    pub fn run(mut self, mut source: Box<dyn RecordSource>) -> Result<IngestSummary, IngestError> {
        let result = self.run_loop(source.as_mut());
        if let Some(recorder) = self.recorder.as_mut() {
            if let Err(e) = recorder.flush() {
                error!("Failed to flush recording: {e}");
            }
        }
        if let Err(e) = &result {
            error!("Ingestion stopped: {e}");
            self.running.store(false, Ordering::Release);
        }
        result
    }

    fn run_loop(&mut self, source: &mut dyn RecordSource) -> Result<IngestSummary, IngestError> {
        let started = Instant::now();
        let mut kernel = None;
        let mut last_refresh: Option<Instant> = None;

        while self.running.load(Ordering::Acquire) {
            let delivered = source.drain(DRAIN_BATCH, &mut |bytes| self.handle_record(bytes))?;
            if delivered > 0 {
                debug!("Applied batch of {delivered} records");
            }

            if last_refresh.is_none_or(|t| t.elapsed() >= COUNTER_REFRESH) {
                if let Some(counters) = source.kernel_counters() {
                    self.session.stats().set_kernel_dropped(counters.dropped);
                    kernel = Some(counters);
                }
                last_refresh = Some(Instant::now());
            }

            if source.exhausted() {
                info!("Record source exhausted");
                break;
            }

            // A full batch means more is pending
            if delivered < DRAIN_BATCH {
                source.wait(self.poll_interval)?;
            }
        }

        Ok(IngestSummary {
            counters: self.session.stats().counters(),
            kernel,
            exhausted: source.exhausted(),
            elapsed: started.elapsed(),
        })
    }

    fn handle_record(&mut self, bytes: &[u8]) -> Result<(), IngestError> {
        let stats = self.session.stats();
        stats.record_seen();

        if let Some(recorder) = self.recorder.as_mut() {
            if let Err(e) = recorder.write_record(bytes) {
                warn!("Recording stopped: {e}");
                stats.record_recording_failed();
                self.recorder = None;
            }
        }

        let event = match decode(bytes) {
            Ok(event) => event,
            Err(DecodeError::Contract(e)) => return Err(e.into()),
            Err(e) => {
                debug!("Discarding malformed record: {e}");
                stats.record_malformed();
                return Ok(());
            }
        };

        let notice = self.session.apply_event(&event)?;
        stats.record_applied();

        if let (Some(notice), Some(tx)) = (notice, &self.notices) {
            // A slow front end loses notices, never events
            let _ = tx.try_send(notice);
        }
        Ok(())
    }
}

/// Owner of the running ingestion thread
pub struct IngestionHandle {
    running: Arc<AtomicBool>,
    thread: JoinHandle<Result<IngestSummary, IngestError>>,
}

impl IngestionHandle {
    /// Ask the loop to stop; it notices within one poll interval
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the thread to exit
    ///
    /// # Errors
    /// The loop's fatal error, or [`IngestError::Panicked`].
    pub fn join(self) -> Result<IngestSummary, IngestError> {
        self.thread.join().map_err(|_| IngestError::Panicked)?
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use kdbg_common::{DebugEvent, CONTRACT_VERSION, EVENT_BREAKPOINT, EVENT_FUNCTION_ENTRY};

    use super::*;
    use crate::contract::encode_event;
    use crate::domain::Address;
    use crate::session::{DebugState, SessionState};

    /// Hands out queued records, one batch per drain
    struct QueueSource {
        batches: VecDeque<Vec<Vec<u8>>>,
        waits: usize,
    }

    impl QueueSource {
        fn new(batches: Vec<Vec<Vec<u8>>>) -> Self {
            Self { batches: batches.into(), waits: 0 }
        }
    }

    impl RecordSource for QueueSource {
        fn drain(
            &mut self,
            _limit: usize,
            on_record: &mut dyn FnMut(&[u8]) -> Result<(), IngestError>,
        ) -> Result<usize, IngestError> {
            let batch = self.batches.pop_front().unwrap_or_default();
            for record in &batch {
                on_record(record)?;
            }
            Ok(batch.len())
        }

        fn wait(&mut self, _timeout: Duration) -> Result<(), IngestError> {
            self.waits += 1;
            Ok(())
        }

        fn kernel_counters(&mut self) -> Option<KernelCounters> {
            Some(KernelCounters { emitted: 10, dropped: 2, filtered: 1 })
        }

        fn exhausted(&self) -> bool {
            self.batches.is_empty()
        }
    }

    fn record(kind: u8, address: u64) -> Vec<u8> {
        let mut event = DebugEvent::empty();
        event.kind = kind;
        event.instruction_pointer = address;
        encode_event(&event)
    }

    fn session_with_breakpoint(address: u64) -> SharedSession {
        let mut state = SessionState::new(None);
        state.breakpoints.add(Address(address), "bp").unwrap();
        state.continue_execution();
        SharedSession::new(state)
    }

    #[test]
    fn test_applies_records_and_counts_malformed() {
        let session = session_with_breakpoint(0x1000);
        let running = Arc::new(AtomicBool::new(true));
        let source = QueueSource::new(vec![
            vec![record(EVENT_FUNCTION_ENTRY, 0x2000), vec![0u8; 12]],
            vec![record(EVENT_BREAKPOINT, 0x1000)],
        ]);

        let summary = IngestionService::new(session.clone(), running)
            .run(Box::new(source))
            .unwrap();

        assert!(summary.exhausted);
        assert_eq!(summary.counters.records, 3);
        assert_eq!(summary.counters.applied, 2);
        assert_eq!(summary.counters.malformed, 1);
        assert_eq!(summary.counters.kernel_dropped, 2);

        let snapshot = session.snapshot().unwrap();
        assert_eq!(snapshot.debug_state, DebugState::AtBreakpoint);
        assert_eq!(snapshot.current_address, Address(0x1000));
    }

    #[test]
    fn test_contract_mismatch_is_fatal_and_clears_running() {
        let session = session_with_breakpoint(0x1000);
        let running = Arc::new(AtomicBool::new(true));
        let mut bad = DebugEvent::empty();
        bad.version = CONTRACT_VERSION ^ 0xff;
        let source = QueueSource::new(vec![vec![encode_event(&bad)], vec![]]);

        let err = IngestionService::new(session.clone(), Arc::clone(&running))
            .run(Box::new(source))
            .unwrap_err();

        assert!(matches!(err, IngestError::Contract(_)));
        assert!(!running.load(Ordering::Acquire));
        assert_eq!(session.snapshot().unwrap().events_applied, 0);
    }

    #[test]
    fn test_cleared_running_flag_stops_before_draining() {
        let session = session_with_breakpoint(0x1000);
        let running = Arc::new(AtomicBool::new(false));
        let source = QueueSource::new(vec![vec![record(EVENT_FUNCTION_ENTRY, 0x2000)]]);

        let summary = IngestionService::new(session, running).run(Box::new(source)).unwrap();
        assert_eq!(summary.counters.records, 0);
        assert!(!summary.exhausted);
    }

    #[test]
    fn test_notices_are_forwarded() {
        let session = session_with_breakpoint(0x1000);
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = crossbeam_channel::bounded(4);
        let source = QueueSource::new(vec![vec![record(EVENT_BREAKPOINT, 0x1000)]]);

        IngestionService::new(session, running)
            .with_notices(tx)
            .run(Box::new(source))
            .unwrap();

        assert!(matches!(
            rx.try_recv().unwrap(),
            SessionNotice::BreakpointHit { address: Address(0x1000), .. }
        ));
    }

    #[test]
    fn test_spawned_thread_joins_after_shutdown() {
        let session = session_with_breakpoint(0x1000);
        let running = Arc::new(AtomicBool::new(true));

        /// Never runs dry, never delivers
        struct IdleSource;
        impl RecordSource for IdleSource {
            fn drain(
                &mut self,
                _limit: usize,
                _on_record: &mut dyn FnMut(&[u8]) -> Result<(), IngestError>,
            ) -> Result<usize, IngestError> {
                Ok(0)
            }
            fn wait(&mut self, timeout: Duration) -> Result<(), IngestError> {
                std::thread::sleep(timeout);
                Ok(())
            }
        }

        let handle = IngestionService::new(session, running)
            .with_poll_interval(Duration::from_millis(5))
            .spawn(Box::new(IdleSource))
            .unwrap();
        handle.shutdown();
        let summary = handle.join().unwrap();
        assert!(!summary.exhausted);
        assert_eq!(summary.kernel, None);
    }

    /// Always has another record pending
    struct EndlessSource {
        record: Vec<u8>,
        waits: Arc<AtomicUsize>,
    }

    impl RecordSource for EndlessSource {
        fn drain(
            &mut self,
            limit: usize,
            on_record: &mut dyn FnMut(&[u8]) -> Result<(), IngestError>,
        ) -> Result<usize, IngestError> {
            for _ in 0..limit {
                on_record(&self.record)?;
            }
            Ok(limit)
        }

        fn wait(&mut self, _timeout: Duration) -> Result<(), IngestError> {
            self.waits.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[test]
    fn test_shutdown_under_sustained_load() {
        let session = session_with_breakpoint(0x1000);
        let running = Arc::new(AtomicBool::new(true));
        let waits = Arc::new(AtomicUsize::new(0));
        let source = EndlessSource {
            record: record(EVENT_FUNCTION_ENTRY, 0x2000),
            waits: Arc::clone(&waits),
        };

        let handle = IngestionService::new(session.clone(), running)
            .spawn(Box::new(source))
            .unwrap();
        while session.stats().counters().applied < DRAIN_BATCH as u64 {
            std::thread::yield_now();
        }
        handle.shutdown();
        let summary = handle.join().unwrap();

        assert!(summary.counters.applied >= DRAIN_BATCH as u64);
        assert_eq!(summary.counters.applied % DRAIN_BATCH as u64, 0);
        assert_eq!(waits.load(Ordering::Relaxed), 0);
    }

    /// Fails every write, like a full disk
    struct FullDisk;

    impl std::io::Write for FullDisk {
        fn write(&mut self, _data: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("no space left on device"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_failed_recording_does_not_stop_ingestion() {
        let session = session_with_breakpoint(0x1000);
        let running = Arc::new(AtomicBool::new(true));
        let source = QueueSource::new(vec![
            vec![record(EVENT_FUNCTION_ENTRY, 0x2000), record(EVENT_FUNCTION_ENTRY, 0x3000)],
            vec![record(EVENT_BREAKPOINT, 0x1000)],
        ]);

        let summary = IngestionService::new(session.clone(), Arc::clone(&running))
            .with_recorder(RecordWriter::new(FullDisk))
            .run(Box::new(source))
            .unwrap();

        assert!(running.load(Ordering::Acquire));
        assert_eq!(summary.counters.applied, 3);
        assert_eq!(summary.counters.recording_failures, 1);

        let snapshot = session.snapshot().unwrap();
        assert_eq!(snapshot.debug_state, DebugState::AtBreakpoint);
        assert_eq!(snapshot.events_applied, 3);
    }
}
