use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kdbg::contract::{decode, decode_raw, encode_event, EventKind, RegisterConfidence};
use kdbg::domain::{Address, DecodeError, IngestError};
use kdbg::ingest::{IngestionService, RecordWriter, ReplaySource};
use kdbg::session::{DebugState, SessionState, SharedSession};
use kdbg_common::{
    copy_name, DebugEvent, RegisterSnapshot, CONTRACT_VERSION, DEBUG_EVENT_SIZE, EVENT_BREAKPOINT,
    EVENT_FUNCTION_ENTRY, FLAG_REGISTERS,
};

fn sample_event() -> DebugEvent {
    let mut event = DebugEvent::empty();
    event.kind = EVENT_BREAKPOINT;
    event.flags = FLAG_REGISTERS;
    event.pid = 1234;
    event.tid = 1240;
    event.cpu = 3;
    event.timestamp_ns = 987_654_321;
    event.instruction_pointer = 0xffff_ffff_8123_4560;
    event.registers = RegisterSnapshot::splat(0xdead_beef);
    copy_name(&mut event.function_name, b"do_sys_openat2");
    event
}

#[test]
fn test_decode_then_encode_is_identity() {
    let bytes = encode_event(&sample_event());
    assert_eq!(bytes.len(), DEBUG_EVENT_SIZE);

    let decoded = decode_raw(&bytes).unwrap();
    assert_eq!(encode_event(&decoded), bytes);
}

#[test]
fn test_decoded_event_is_typed() {
    let event = decode(&encode_event(&sample_event())).unwrap();
    assert_eq!(event.kind, EventKind::BreakpointHit);
    assert_eq!(event.function, "do_sys_openat2");
    assert_eq!(event.address, Address(0xffff_ffff_8123_4560));
    assert_eq!(event.confidence, RegisterConfidence::Full);
    assert_eq!(event.registers, Some(RegisterSnapshot::splat(0xdead_beef)));
    assert_eq!(event.return_value, None);
}

#[test]
fn test_trailing_bytes_are_ignored() {
    let mut bytes = encode_event(&sample_event());
    bytes.extend_from_slice(&[0xaa; 16]);
    assert_eq!(decode_raw(&bytes).unwrap(), sample_event());
}

#[test]
fn test_short_record_is_counted_and_changes_nothing() {
    let mut state = SessionState::new(None);
    state.continue_execution();
    let session = SharedSession::new(state);
    let before = session.snapshot().unwrap();

    let bytes = encode_event(&sample_event());
    assert!(matches!(
        decode(&bytes[..DEBUG_EVENT_SIZE - 1]),
        Err(DecodeError::Truncated { min: DEBUG_EVENT_SIZE, .. })
    ));

    let recording = tempfile::NamedTempFile::new().unwrap();
    let mut writer = RecordWriter::create(recording.path()).unwrap();
    writer.write_record(&bytes[..DEBUG_EVENT_SIZE - 1]).unwrap();
    writer.write_record(&bytes[..8]).unwrap();
    writer.flush().unwrap();
    drop(writer);

    let summary = IngestionService::new(session.clone(), Arc::new(AtomicBool::new(true)))
        .run(Box::new(ReplaySource::open(recording.path()).unwrap()))
        .unwrap();
    assert!(summary.exhausted);
    assert_eq!(summary.counters.records, 2);
    assert_eq!(summary.counters.malformed, 2);
    assert_eq!(summary.counters.applied, 0);

    let after = session.snapshot().unwrap();
    assert_eq!(after.debug_state, before.debug_state);
    assert_eq!(after.update_counter, before.update_counter);
    assert_eq!(after.events_applied, before.events_applied);
    assert_eq!(after.current_address, before.current_address);
    assert_eq!(after.log, before.log);
    assert_eq!(after.ingest.malformed, 2);
}

#[test]
fn test_recording_replays_into_same_state() {
    let recording = tempfile::NamedTempFile::new().unwrap();
    let mut entry = sample_event();
    entry.kind = EVENT_FUNCTION_ENTRY;
    entry.instruction_pointer = 0x1000;

    let mut writer = RecordWriter::create(recording.path()).unwrap();
    for event in [&entry, &sample_event()] {
        writer.write_record(&encode_event(event)).unwrap();
    }
    writer.flush().unwrap();
    drop(writer);

    let replayed = SharedSession::new(SessionState::new(None));
    replayed.with_state(|s| s.continue_execution()).unwrap();
    IngestionService::new(replayed.clone(), Arc::new(AtomicBool::new(true)))
        .run(Box::new(ReplaySource::open(recording.path()).unwrap()))
        .unwrap();

    let snapshot = replayed.snapshot().unwrap();
    assert_eq!(snapshot.events_applied, 2);
    assert_eq!(snapshot.debug_state, DebugState::Running);
    assert_eq!(snapshot.current_address, Address(0xffff_ffff_8123_4560));
    assert_eq!(snapshot.registers, RegisterSnapshot::splat(0xdead_beef));
}

#[test]
fn test_version_mismatch_stops_ingestion() {
    let recording = tempfile::NamedTempFile::new().unwrap();
    let mut event = sample_event();
    event.version = CONTRACT_VERSION + 1;
    let mut writer = RecordWriter::create(recording.path()).unwrap();
    writer.write_record(&encode_event(&event)).unwrap();
    writer.flush().unwrap();
    drop(writer);

    let session = SharedSession::new(SessionState::new(None));
    let running = Arc::new(AtomicBool::new(true));
    let err = IngestionService::new(session.clone(), Arc::clone(&running))
        .run(Box::new(ReplaySource::open(recording.path()).unwrap()))
        .unwrap_err();

    assert!(matches!(err, IngestError::Contract(_)));
    assert!(!running.load(Ordering::Acquire));
    assert_eq!(session.snapshot().unwrap().events_applied, 0);
}
