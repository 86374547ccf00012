//! Committed batches survive a simulated crash (the writer is dropped
//! without a clean shutdown); anything still buffered and never flushed is
//! lost, not half-written.

use std::sync::Arc;
use std::time::Duration;

use meshgate_core::domain::{NodeId, PositionEvent, ProcessedEvent};
use meshgate_core::metrics::Metrics;
use meshgate_store::BatchWriter;

fn position(node_num: u32, timestamp: i64) -> ProcessedEvent {
    ProcessedEvent::Position(PositionEvent {
        node_id: NodeId::from_node_num(node_num),
        node_num,
        latitude: 10.0,
        longitude: 20.0,
        altitude: None,
        precision_bits: None,
        timestamp,
        snr: None,
        rssi: None,
    })
}

#[test]
fn only_flushed_batches_survive_a_crash_and_reopen() {
    let db = integration::TempDb::new();

    {
        let mut writer =
            BatchWriter::open(&db.path, 100, Duration::from_secs(1), 30, Arc::new(Metrics::new())).unwrap();
        writer.add(position(1, 1000));
        writer.flush().unwrap();

        // This second event is buffered but never flushed before the
        // writer (and its connection) is dropped, simulating a crash.
        writer.add(position(2, 2000));
    }

    let conn = rusqlite::Connection::open(&db.path).unwrap();
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM positions", [], |r| r.get(0)).unwrap();
    assert_eq!(count, 1, "only the committed batch should be on disk");
    drop(conn);

    // Reopening against the same file must succeed (schema re-verification
    // is idempotent) and pick back up where the committed state left off.
    let mut writer =
        BatchWriter::open(&db.path, 100, Duration::from_secs(1), 30, Arc::new(Metrics::new())).unwrap();
    writer.add(position(2, 2000));
    writer.flush().unwrap();

    let conn = rusqlite::Connection::open(&db.path).unwrap();
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM positions", [], |r| r.get(0)).unwrap();
    assert_eq!(count, 2);
    let node_count: i64 = conn.query_row("SELECT COUNT(*) FROM nodes", [], |r| r.get(0)).unwrap();
    assert_eq!(node_count, 2, "each position's stub node also survived independently");
}
