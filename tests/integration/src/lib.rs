//! Shared scaffolding for the scenario tests in `tests/`: builds classifiers
//! against a throwaway SQLite file and assembles encrypted envelope
//! payloads the same way the classifier's own unit tests do, just exposed
//! for reuse across multiple scenario files.

use std::sync::Arc;

use meshgate_core::crypto::{self, DEFAULT_PSK};
use meshgate_core::domain::BROADCAST_NODE_NUM;
use meshgate_core::metrics::Metrics;
use meshgate_core::wire::{
    encode_data, encode_position, encode_service_envelope, Data, MeshPacket, PacketBody, Position,
    ServiceEnvelope,
};
use meshgate_ingest::channel_index::InMemoryChannelIndex;
use meshgate_ingest::{Classifier, KeyRing};

/// A SQLite file under a throwaway directory, kept alive for the scope of a
/// test so the directory isn't reaped before the writer is done with it.
pub struct TempDb {
    pub path: String,
    _dir: tempfile::TempDir,
}

impl TempDb {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("meshgate-test.db").to_string_lossy().to_string();
        Self { path, _dir: dir }
    }
}

pub fn classifier() -> (Classifier<InMemoryChannelIndex>, Arc<Metrics>) {
    let metrics = Arc::new(Metrics::new());
    let classifier = Classifier::new(InMemoryChannelIndex::new(), KeyRing::new(), metrics.clone());
    (classifier, metrics)
}

/// Default-channel encrypted `TEXT_MESSAGE_APP` envelope, as carried on
/// `msh/<region>/2/e/LongFast/<gateway>`.
pub fn text_message_envelope(
    from: u32,
    to: u32,
    packet_id: u32,
    channel_name: &str,
    text: &str,
) -> (String, Vec<u8>) {
    let key = crypto::expand_psk(&DEFAULT_PSK).unwrap();
    let plaintext = encode_data(&Data {
        portnum: meshgate_ingest::classify::PORT_TEXT_MESSAGE,
        payload: text.as_bytes().to_vec(),
        ..Default::default()
    });
    let ciphertext = crypto::encrypt(&plaintext, &key, packet_id as u64, from);
    let packet = MeshPacket {
        from,
        to,
        id: packet_id,
        body: PacketBody::Encrypted(ciphertext),
        ..Default::default()
    };
    let envelope = ServiceEnvelope {
        packet: Some(packet),
        channel_id: Some(channel_name.to_string()),
        gateway_id: Some("!abcdef00".to_string()),
    };
    let topic = format!("msh/US/2/e/{channel_name}/!abcdef00");
    (topic, encode_service_envelope(&envelope))
}

/// Default-channel encrypted `POSITION_APP` envelope.
pub fn position_envelope(
    from: u32,
    packet_id: u32,
    latitude_i: i32,
    longitude_i: i32,
) -> (String, Vec<u8>) {
    let key = crypto::expand_psk(&DEFAULT_PSK).unwrap();
    let position = encode_position(&Position {
        latitude_i: Some(latitude_i),
        longitude_i: Some(longitude_i),
        altitude: Some(30),
        time: Some(1_700_000_000),
        precision_bits: Some(16),
    });
    let data = encode_data(&Data {
        portnum: meshgate_ingest::classify::PORT_POSITION,
        payload: position,
        ..Default::default()
    });
    let ciphertext = crypto::encrypt(&data, &key, packet_id as u64, from);
    let packet = MeshPacket {
        from,
        to: BROADCAST_NODE_NUM,
        id: packet_id,
        body: PacketBody::Encrypted(ciphertext),
        ..Default::default()
    };
    let envelope = ServiceEnvelope {
        packet: Some(packet),
        channel_id: Some("LongFast".to_string()),
        gateway_id: None,
    };
    let topic = "msh/US/2/e/LongFast/!abcdef00".to_string();
    (topic, encode_service_envelope(&envelope))
}
