//! Position fix: classify → persist → read back in degrees, with the
//! fixed-point wire values converted exactly once.

use std::sync::Arc;
use std::time::Duration;

use meshgate_core::domain::ProcessedEvent;
use meshgate_core::metrics::Metrics;
use meshgate_store::BatchWriter;

#[test]
fn position_fix_converts_fixed_point_and_creates_stub_node() {
    let (classifier, _metrics) = integration::classifier();
    let (topic, payload) = integration::position_envelope(0x0102_0304, 1, 377_780_208, -1_224_400_000);

    let events = classifier.classify(&topic, &payload);
    assert_eq!(events.len(), 1);
    let event = events.into_iter().next().unwrap();
    let ProcessedEvent::Position(pos) = &event else {
        panic!("expected a position event, got {event:?}");
    };
    assert!((pos.latitude - 37.7780208).abs() < 1e-6);
    assert!((pos.longitude - (-122.44)).abs() < 1e-6);
    assert_eq!(pos.altitude, Some(30));

    let db = integration::TempDb::new();
    let mut writer = BatchWriter::open(&db.path, 100, Duration::from_secs(1), 30, Arc::new(Metrics::new()))
        .expect("open writer");
    writer.add(event);
    writer.flush().expect("flush batch");

    let conn = rusqlite::Connection::open(&db.path).unwrap();
    let (latitude, longitude, node_id): (f64, f64, String) = conn
        .query_row(
            "SELECT latitude, longitude, node_id FROM positions",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .expect("position row");
    assert!((latitude - 37.7780208).abs() < 1e-6);
    assert!((longitude - (-122.44)).abs() < 1e-6);
    assert_eq!(node_id, "!01020304");

    let (short_name, long_name): (String, String) = conn
        .query_row(
            "SELECT short_name, long_name FROM nodes WHERE id = '!01020304'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .expect("stub node row");
    assert_eq!(short_name, "UNK");
    assert_eq!(long_name, "Unknown Node");
}
