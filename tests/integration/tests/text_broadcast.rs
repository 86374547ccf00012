//! Default-channel broadcast text message: classify → admit → persist →
//! read back, end to end through a real SQLite file.

use std::sync::Arc;
use std::time::Duration;

use meshgate_core::domain::ProcessedEvent;
use meshgate_core::metrics::Metrics;
use meshgate_store::BatchWriter;

#[test]
fn broadcast_text_message_lands_in_messages_table() {
    let (classifier, _metrics) = integration::classifier();
    let (topic, payload) = integration::text_message_envelope(
        0x298A_814D,
        meshgate_core::domain::BROADCAST_NODE_NUM,
        0x0012_3456,
        "LongFast",
        "Hello mesh",
    );

    let events = classifier.classify(&topic, &payload);
    assert_eq!(events.len(), 1);
    let event = events.into_iter().next().unwrap();
    assert!(matches!(&event, ProcessedEvent::Message(m) if m.to_id == "broadcast"));

    let db = integration::TempDb::new();
    let mut writer = BatchWriter::open(&db.path, 100, Duration::from_secs(1), 30, Arc::new(Metrics::new()))
        .expect("open writer");
    writer.add(event);
    writer.flush().expect("flush batch");

    let conn = rusqlite::Connection::open(&db.path).unwrap();
    let (from_id, to_id, text): (String, String, String) = conn
        .query_row(
            "SELECT from_id, to_id, text FROM messages WHERE from_id = '!298a814d'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .expect("message row");
    assert_eq!(from_id, "!298a814d");
    assert_eq!(to_id, "broadcast");
    assert_eq!(text, "Hello mesh");

    let node_count: i64 = conn.query_row("SELECT COUNT(*) FROM nodes", [], |r| r.get(0)).unwrap();
    assert_eq!(node_count, 1, "stub node row should back the message's FK");
}
