//! # Record Sources
//!
//! Where raw event records come from.
//!
//! - [`RingBufSource`] - the kernel `EVENTS` ring buffer, waiting with `poll(2)`
//! - [`ReplaySource`] - a recording made with [`RecordWriter`]
//!
//! ## Recording Format
//!
//! A flat sequence of `u32` little-endian length prefixes, each followed by
//! that many bytes of one raw record exactly as the ring buffer delivered it.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::time::Duration;

use aya::maps::{MapData, PerCpuArray, RingBuf};
use kdbg_common::{COUNTER_DROPPED, COUNTER_EMITTED, COUNTER_FILTERED};
use log::{debug, warn};

use super::stats::KernelCounters;
use crate::domain::IngestError;

/// Records larger than this in a recording are treated as corruption
const MAX_RECORDED_RECORD: usize = 64 * 1024;

/// A stream of raw records
pub trait RecordSource: Send {
    /// Hand at most `limit` of the records available right now to `on_record`
    ///
    /// Returns the number of records delivered. An error from `on_record`
    /// stops the drain and is returned as is.
    ///
    /// # Errors
    /// [`IngestError::Read`] if the source itself failed.
    fn drain(
        &mut self,
        limit: usize,
        on_record: &mut dyn FnMut(&[u8]) -> Result<(), IngestError>,
    ) -> Result<usize, IngestError>;

    /// Block until records may be available, for at most `timeout`
    ///
    /// # Errors
    /// [`IngestError::Wait`] if waiting failed.
    fn wait(&mut self, timeout: Duration) -> Result<(), IngestError>;

    /// Kernel-side probe counters, when the source has access to them
    fn kernel_counters(&mut self) -> Option<KernelCounters> {
        None
    }

    /// No further records will ever arrive
    fn exhausted(&self) -> bool {
        false
    }
}

// ============================================================================
// Kernel ring buffer
// ============================================================================

/// The probe's `EVENTS` ring buffer
pub struct RingBufSource {
    ring: RingBuf<MapData>,
    counters: Option<PerCpuArray<MapData, u64>>,
}

impl RingBufSource {
    #[must_use]
    pub fn new(ring: RingBuf<MapData>, counters: Option<PerCpuArray<MapData, u64>>) -> Self {
        Self { ring, counters }
    }
}

impl RecordSource for RingBufSource {
    fn drain(
        &mut self,
        limit: usize,
        on_record: &mut dyn FnMut(&[u8]) -> Result<(), IngestError>,
    ) -> Result<usize, IngestError> {
        let mut delivered = 0;
        while delivered < limit {
            let Some(item) = self.ring.next() else { break };
            on_record(&item)?;
            delivered += 1;
        }
        Ok(delivered)
    }

    fn wait(&mut self, timeout: Duration) -> Result<(), IngestError> {
        let mut fds = libc::pollfd { fd: self.ring.as_raw_fd(), events: libc::POLLIN, revents: 0 };
        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);

        // SAFETY: fds points to one valid pollfd for the duration of the call
        #[allow(unsafe_code)]
        let rc = unsafe { libc::poll(&mut fds, 1, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(IngestError::Wait(err));
        }
        Ok(())
    }

    fn kernel_counters(&mut self) -> Option<KernelCounters> {
        let map = self.counters.as_ref()?;
        let sum = |slot: u32| -> Option<u64> {
            match map.get(&slot, 0) {
                Ok(values) => Some(values.iter().sum()),
                Err(e) => {
                    debug!("Failed to read EVENT_COUNTERS[{slot}]: {e}");
                    None
                }
            }
        };
        Some(KernelCounters {
            emitted: sum(COUNTER_EMITTED)?,
            dropped: sum(COUNTER_DROPPED)?,
            filtered: sum(COUNTER_FILTERED)?,
        })
    }
}

// ============================================================================
// Recordings
// ============================================================================

/// Appends raw records to a recording
pub struct RecordWriter {
    out: Box<dyn Write + Send>,
}

impl RecordWriter {
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }

    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self { out: Box::new(out) }
    }

    /// # Errors
    /// Returns an error if the underlying writer fails or the record does not
    /// fit a `u32` length prefix.
    pub fn write_record(&mut self, record: &[u8]) -> io::Result<()> {
        let len = u32::try_from(record.len())
            .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "record too large"))?;
        self.out.write_all(&len.to_le_bytes())?;
        self.out.write_all(record)
    }

    /// # Errors
    /// Returns an error if flushing fails.
    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// Replays a recording
///
/// Without pacing the whole file is delivered as fast as the session can
/// apply it. With pacing one record is delivered per `wait`.
pub struct ReplaySource {
    reader: Box<dyn Read + Send>,
    pace: Option<Duration>,
    exhausted: bool,
    buf: Vec<u8>,
}

impl ReplaySource {
    /// # Errors
    /// Returns an error if the file cannot be opened.
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }

    pub fn new(reader: impl Read + Send + 'static) -> Self {
        Self { reader: Box::new(reader), pace: None, exhausted: false, buf: Vec::new() }
    }

    #[must_use]
    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = (!pace.is_zero()).then_some(pace);
        self
    }

    /// Read the next record into `self.buf`; `false` at end of recording
    fn next_record(&mut self) -> Result<bool, IngestError> {
        let mut len = [0u8; 4];
        if !read_exact_or_eof(&mut self.reader, &mut len)? {
            return Ok(false);
        }

        let len = u32::from_le_bytes(len) as usize;
        if len > MAX_RECORDED_RECORD {
            warn!("Recording corrupt: record of {len} bytes, stopping replay");
            return Ok(false);
        }

        self.buf.resize(len, 0);
        if !read_exact_or_eof(&mut self.reader, &mut self.buf)? {
            warn!("Recording truncated mid-record, stopping replay");
            return Ok(false);
        }
        Ok(true)
    }
}

/// Fill `buf` completely; `false` if the reader ended first
fn read_exact_or_eof(reader: &mut dyn Read, buf: &mut [u8]) -> Result<bool, IngestError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(IngestError::Read(e)),
    }
}

impl RecordSource for ReplaySource {
    fn drain(
        &mut self,
        limit: usize,
        on_record: &mut dyn FnMut(&[u8]) -> Result<(), IngestError>,
    ) -> Result<usize, IngestError> {
        let batch = if self.pace.is_some() { limit.min(1) } else { limit };
        let mut delivered = 0;

        while delivered < batch && !self.exhausted {
            if self.next_record()? {
                on_record(&self.buf)?;
                delivered += 1;
            } else {
                self.exhausted = true;
            }
        }
        Ok(delivered)
    }

    fn wait(&mut self, timeout: Duration) -> Result<(), IngestError> {
        if let Some(pace) = self.pace {
            std::thread::sleep(pace.min(timeout));
        }
        Ok(())
    }

    fn exhausted(&self) -> bool {
        self.exhausted
    }
}
