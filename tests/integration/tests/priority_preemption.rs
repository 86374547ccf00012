//! A saturated queue of low-priority backlog must still make room for a
//! critical event classified off a real low-battery telemetry payload.

use meshgate_core::domain::{NodeId, ProcessedEvent, TelemetryEvent};
use meshgate_ingest::queue::Priority;
use meshgate_ingest::PriorityQueue;

fn filler_event() -> ProcessedEvent {
    ProcessedEvent::Telemetry(TelemetryEvent {
        node_id: NodeId::from_node_num(1),
        node_num: 1,
        timestamp: 0,
        battery_level: Some(90),
        voltage: None,
        channel_utilization: None,
        air_util_tx: None,
        uptime_seconds: None,
        temperature: None,
        snr: None,
        rssi: None,
    })
}

#[test]
fn critical_telemetry_preempts_a_full_low_priority_backlog() {
    let mut queue = PriorityQueue::new(10_000);
    for i in 0..10_000u32 {
        assert!(queue.enqueue(format!("low-{i}"), filler_event(), Some(Priority::Low)));
    }
    assert_eq!(queue.stats().total, 10_000);

    // A real low-battery stat payload, classified through the gateway-stats
    // JSON path rather than constructed by hand.
    let (classifier, _metrics) = integration::classifier();
    let payload = br#"{"battery_level":5,"voltage":3.3}"#;
    let events = classifier.classify("msh/US/2/stat/!0badc0de", payload);
    assert_eq!(events.len(), 1);
    let event = events.into_iter().next().unwrap();
    let ProcessedEvent::Telemetry(t) = &event else {
        panic!("expected telemetry, got {event:?}");
    };
    assert_eq!(t.battery_level, Some(5));

    assert!(queue.enqueue("critical".to_string(), event, None));
    let stats = queue.stats();
    assert_eq!(stats.total, 10_000, "queue stays at capacity after preemption");
    assert_eq!(stats.critical, 1);
    assert_eq!(stats.low, 9_999, "exactly one low entry was evicted");

    let dequeued = queue.dequeue(1);
    assert_eq!(dequeued[0].queue_id, "critical", "critical jumps the entire backlog");
}
