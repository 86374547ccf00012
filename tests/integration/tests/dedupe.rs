//! The same packet relayed through two different gateways must classify
//! identically but admit only once past the deduplicator.

use std::time::Duration;

use meshgate_core::domain::ProcessedEvent;
use meshgate_ingest::dedup::{DedupKey, Deduplicator};

#[test]
fn same_packet_id_from_two_gateways_deduplicates() {
    let (classifier, _metrics) = integration::classifier();
    let (topic_a, payload) =
        integration::text_message_envelope(0x1111_2222, meshgate_core::domain::BROADCAST_NODE_NUM, 77, "LongFast", "dup me");

    // The second gateway relays the identical ciphertext on its own topic
    // suffix; the classified event (and so the dedupe key) is the same.
    let topic_b = "msh/US/2/e/LongFast/!deadbeef".to_string();

    let first = classifier.classify(&topic_a, &payload);
    let second = classifier.classify(&topic_b, &payload);
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);

    let mut dedup = Deduplicator::new(Duration::from_secs(60), 100);
    let key_packet_id = |event: &ProcessedEvent| match event {
        ProcessedEvent::Message(m) => m.packet_id,
        other => panic!("expected Message, got {other:?}"),
    };

    let first_admit = dedup.check_and_insert(&DedupKey::Message {
        packet_id: key_packet_id(&first[0]),
    });
    let second_admit = dedup.check_and_insert(&DedupKey::Message {
        packet_id: key_packet_id(&second[0]),
    });

    assert!(first_admit, "first delivery should be admitted");
    assert!(!second_admit, "redelivery via the second gateway should be rejected");
    assert_eq!(dedup.deduplicated_count, 1);
}
