//! # Event Ingestion
//!
//! Moves records from the kernel (or a recording) into the session.
//!
//! ## Sub-Modules
//!
//! - `source` - [`RecordSource`] and its ring buffer / replay implementations
//! - `service` - the ingestion loop and its thread handle
//! - `stats` - lock-free counters read by the front end

mod service;
mod source;
mod stats;

pub use service::{
    IngestSummary, IngestionHandle, IngestionService, COUNTER_REFRESH, DEFAULT_POLL_INTERVAL,
};
pub use source::{RecordSource, RecordWriter, ReplaySource, RingBufSource};
pub use stats::{IngestCounters, IngestStats, KernelCounters};
