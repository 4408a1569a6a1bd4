use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, TryRecvError};
use kdbg::contract::encode_event;
use kdbg::domain::IngestError;
use kdbg::ingest::{IngestionService, RecordSource};
use kdbg::session::{SessionState, SharedSession};
use kdbg_common::{DebugEvent, RegisterSnapshot, EVENT_FUNCTION_ENTRY, FLAG_REGISTERS};

const EVENTS: u64 = 5_000;

/// Records pushed by another thread; runs dry when the sender is dropped
struct ChannelSource {
    rx: Receiver<Vec<u8>>,
    closed: bool,
}

impl RecordSource for ChannelSource {
    fn drain(
        &mut self,
        limit: usize,
        on_record: &mut dyn FnMut(&[u8]) -> Result<(), IngestError>,
    ) -> Result<usize, IngestError> {
        let mut delivered = 0;
        while delivered < limit {
            match self.rx.try_recv() {
                Ok(record) => {
                    on_record(&record)?;
                    delivered += 1;
                }
                Err(TryRecvError::Empty) => return Ok(delivered),
                Err(TryRecvError::Disconnected) => {
                    self.closed = true;
                    return Ok(delivered);
                }
            }
        }
        Ok(delivered)
    }

    fn wait(&mut self, timeout: Duration) -> Result<(), IngestError> {
        std::thread::sleep(timeout.min(Duration::from_micros(200)));
        Ok(())
    }

    fn exhausted(&self) -> bool {
        self.closed
    }
}

/// Event `n` carries `n` in every register
fn numbered_record(n: u64) -> Vec<u8> {
    let mut event = DebugEvent::empty();
    event.kind = EVENT_FUNCTION_ENTRY;
    event.flags = FLAG_REGISTERS;
    event.tid = 7;
    event.instruction_pointer = 0x1000 + (n % 16) * 0x10;
    event.registers = RegisterSnapshot::splat(n);
    encode_event(&event)
}

#[test]
fn test_snapshots_never_see_torn_registers() {
    let mut state = SessionState::new(None);
    state.continue_execution();
    let session = SharedSession::new(state);

    let (tx, rx) = unbounded();
    let handle = IngestionService::new(session.clone(), Arc::new(AtomicBool::new(true)))
        .with_poll_interval(Duration::from_millis(1))
        .spawn(Box::new(ChannelSource { rx, closed: false }))
        .unwrap();

    let producer = std::thread::spawn(move || {
        for n in 1..=EVENTS {
            tx.send(numbered_record(n)).unwrap();
        }
    });

    let mut last_counter = 0;
    let mut observed = 0u64;
    loop {
        let finished = handle.is_finished();
        let snapshot = session.snapshot().unwrap();

        // Every register was written by the same update the counter names
        assert_eq!(snapshot.registers, RegisterSnapshot::splat(snapshot.update_counter));
        assert!(snapshot.update_counter >= last_counter);
        last_counter = snapshot.update_counter;
        observed += 1;

        if finished {
            break;
        }
    }

    producer.join().unwrap();
    let summary = handle.join().unwrap();
    assert!(summary.exhausted);
    assert_eq!(summary.counters.applied, EVENTS);
    assert_eq!(last_counter, EVENTS);
    assert!(observed > 0);
}
