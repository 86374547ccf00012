//! A single node flooding ten gateway-stat reports inside one window gets
//! exactly one admitted and nine denied, keyed off the classified event's
//! source node id.

use meshgate_ingest::ratelimit::{Admission, RateLimiter};

#[test]
fn ten_stat_reports_from_one_source_in_one_window_admit_only_one() {
    let (classifier, _metrics) = integration::classifier();
    let limiter = RateLimiter::with_defaults();

    let mut admitted = 0;
    let mut denied = 0;
    for _ in 0..10 {
        let events = classifier.classify(
            "msh/US/2/stat/!cafef00d",
            br#"{"battery_level":88,"voltage":4.1}"#,
        );
        assert_eq!(events.len(), 1);
        let source = events[0]
            .source_node_id()
            .expect("telemetry events carry a source node id")
            .as_str()
            .to_string();
        match limiter.check(&source) {
            Admission::Admitted => admitted += 1,
            Admission::Denied { .. } => denied += 1,
        }
    }

    assert_eq!(admitted, 1);
    assert_eq!(denied, 9);
    assert_eq!(limiter.source_count(), 1);
}

#[test]
fn two_different_gateways_are_rate_limited_independently() {
    let (classifier, _metrics) = integration::classifier();
    let limiter = RateLimiter::with_defaults();

    for topic in ["msh/US/2/stat/!aaaaaaaa", "msh/US/2/stat/!bbbbbbbb"] {
        let events = classifier.classify(topic, br#"{"battery_level":50}"#);
        let source = events[0].source_node_id().unwrap().as_str().to_string();
        assert_eq!(limiter.check(&source), Admission::Admitted);
    }
    assert_eq!(limiter.source_count(), 2);
}
