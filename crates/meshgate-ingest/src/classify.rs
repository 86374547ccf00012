//! Message classifier — topic routing, port dispatch, JSON variants.
//!
//! Follows `summitd::dispatch::ServiceDispatcher`'s shape: a struct holding
//! lookup state (here: the learned channel-index map behind a single
//! mutex-free `DashMap`, per §5) rather than a bare match statement at the
//! top level, though port dispatch itself is a match — there's no dynamic
//! registration need for a fixed, spec-named port table.

use std::sync::Arc;

use base64::Engine;
use serde::Deserialize;
use thiserror::Error;

use meshgate_core::crypto::{self, ExpandedKey};
use meshgate_core::domain::{
    HwModel, MessageEvent, MqttRawEvent, NodeEvent, NodeId, NodeRole, PositionEvent, ProcessedEvent,
    TelemetryEvent, TracerouteEvent, BROADCAST_NODE_NUM, BROADCAST_TO_ID,
};
use meshgate_core::metrics::Metrics;
use meshgate_core::wire::{self, DecodeError, PacketBody};

use crate::channel_index::ChannelIndexStore;
use crate::topic::{parse_topic, ChannelType};

// Meshtastic port numbers the core classifier dispatches on.
pub const PORT_TEXT_MESSAGE: u32 = 1;
pub const PORT_POSITION: u32 = 3;
pub const PORT_NODEINFO: u32 = 4;
pub const PORT_ADMIN: u32 = 6;
pub const PORT_TELEMETRY: u32 = 67;
pub const PORT_TRACEROUTE: u32 = 70;
pub const PORT_MAP_REPORT: u32 = 73;

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("unrecognized topic shape: {0}")]
    BadTopic(String),
    #[error("structural decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("decryption did not yield a plausible record")]
    EncryptedUnresolved,
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Holds per-channel raw PSK candidates supplied by configuration, tried
/// after the channel-name-derived default (§4.B "channel key discovery").
#[derive(Default)]
pub struct KeyRing {
    configured: std::collections::HashMap<String, Vec<u8>>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_channel_key(&mut self, channel_name: impl Into<String>, raw_psk: Vec<u8>) {
        self.configured.insert(channel_name.into(), raw_psk);
    }

    /// Candidate expanded keys for a channel, default first (per the
    /// channel's well-known PSK index) then the configured override, if
    /// any and distinct.
    fn candidates(&self, channel_name: &str) -> Vec<ExpandedKey> {
        let mut out = Vec::new();
        let default_index = crypto::default_psk_index_for_channel(channel_name);
        if let Ok(key) = crypto::expand_psk(&[default_index]) {
            out.push(key);
        }
        if let Some(raw) = self.configured.get(channel_name) {
            if let Ok(key) = crypto::expand_psk(raw) {
                out.push(key);
            }
        }
        out
    }
}

pub struct Classifier<S: ChannelIndexStore> {
    channel_store: Arc<S>,
    keys: KeyRing,
    metrics: Arc<Metrics>,
}

impl<S: ChannelIndexStore> Classifier<S> {
    pub fn new(channel_store: Arc<S>, keys: KeyRing, metrics: Arc<Metrics>) -> Self {
        Self {
            channel_store,
            keys,
            metrics,
        }
    }

    /// Classify one MQTT delivery. Never propagates an error past this
    /// call — failures are counted and surfaced only as an `mqtt_raw`
    /// diagnostic event (§4.C).
    pub fn classify(&self, topic: &str, payload: &[u8]) -> Vec<ProcessedEvent> {
        Metrics::incr(&self.metrics.received);
        match self.try_classify(topic, payload) {
            Ok(events) => events,
            Err(err) => {
                Metrics::incr(&self.metrics.messages_failed);
                tracing::warn!(topic, error = %err, "classification failed");
                vec![ProcessedEvent::MqttRaw(MqttRawEvent {
                    topic: topic.to_string(),
                    payload_b64: base64::engine::general_purpose::STANDARD.encode(payload),
                    parsed_type: None,
                    node_id: None,
                    data: None,
                })]
            }
        }
    }

    fn try_classify(&self, topic: &str, payload: &[u8]) -> Result<Vec<ProcessedEvent>, ClassifyError> {
        let parsed = parse_topic(topic).ok_or_else(|| ClassifyError::BadTopic(topic.to_string()))?;
        match parsed.channel_type {
            ChannelType::Envelope => {
                let channel_name = parsed.channel_name.unwrap_or_default();
                self.classify_envelope(&channel_name, payload)
            }
            ChannelType::Channel => self.classify_channel_json(payload),
            ChannelType::Stat => self.classify_stat(parsed.gateway_id.as_deref(), payload),
            ChannelType::Map => self.classify_map(payload),
            ChannelType::Json => self.classify_json(parsed.gateway_id.as_deref(), payload),
        }
    }

    fn classify_envelope(
        &self,
        channel_name: &str,
        payload: &[u8],
    ) -> Result<Vec<ProcessedEvent>, ClassifyError> {
        let envelope = wire::decode_service_envelope(payload)?;
        let channel_name = envelope.channel_id.as_deref().unwrap_or(channel_name);
        self.channel_store.resolve(channel_name);

        let packet = envelope.packet.ok_or(DecodeError::MissingField("packet"))?;
        let body_bytes = match &packet.body {
            PacketBody::Decoded(data) => return Ok(self.dispatch_data(&packet, data)),
            PacketBody::Encrypted(bytes) => bytes,
            PacketBody::None => return Ok(vec![]),
        };

        let candidates = self.keys.candidates(channel_name);
        let plaintext = crypto::try_decrypt_candidates(
            body_bytes,
            packet.id as u64,
            packet.from,
            candidates.iter(),
        )
        .ok_or(ClassifyError::EncryptedUnresolved)?;

        let data = wire::decode_data(&plaintext)?;
        Ok(self.dispatch_data(&packet, &data))
    }

    fn dispatch_data(&self, packet: &wire::MeshPacket, data: &wire::Data) -> Vec<ProcessedEvent> {
        let from_id = NodeId::from_node_num(packet.from);
        let now_ms = packet.rx_time as i64 * 1000;

        match data.portnum {
            PORT_ADMIN => {
                Metrics::incr(&self.metrics.unknown_count);
                vec![]
            }
            PORT_TEXT_MESSAGE => match std::str::from_utf8(&data.payload) {
                Ok(text) => {
                    let to_id = if packet.to == BROADCAST_NODE_NUM {
                        BROADCAST_TO_ID.to_string()
                    } else {
                        NodeId::from_node_num(packet.to).0
                    };
                    vec![ProcessedEvent::Message(MessageEvent {
                        packet_id: packet.id,
                        from_id,
                        to_id,
                        channel: packet.channel,
                        text: text.to_string(),
                        timestamp: now_ms,
                        snr: Some(packet.rx_snr),
                        rssi: Some(packet.rx_rssi),
                        hops_away: Some(packet.hop_start.saturating_sub(packet.hop_limit)),
                        reply_to: data.reply_id,
                    })]
                }
                Err(_) => {
                    Metrics::incr(&self.metrics.decode_encoding_errors);
                    vec![]
                }
            },
            PORT_POSITION => match wire::decode_position(&data.payload) {
                Ok(pos) => self.position_event(&from_id, packet, &pos).into_iter().collect(),
                Err(_) => {
                    Metrics::incr(&self.metrics.decode_structural_errors);
                    vec![]
                }
            },
            PORT_NODEINFO => match wire::decode_user(&data.payload) {
                Ok(user) => vec![ProcessedEvent::Node(self.node_event_from_user(packet, &user))],
                Err(_) => {
                    Metrics::incr(&self.metrics.decode_structural_errors);
                    vec![]
                }
            },
            PORT_TELEMETRY => match wire::decode_telemetry(&data.payload) {
                Ok(t) => vec![ProcessedEvent::Telemetry(self.telemetry_event(&from_id, packet, &t))],
                Err(_) => {
                    Metrics::incr(&self.metrics.decode_structural_errors);
                    vec![]
                }
            },
            PORT_TRACEROUTE => match wire::decode_route_discovery(&data.payload) {
                Ok(route) => vec![ProcessedEvent::Traceroute(self.traceroute_event(
                    packet, data, &route,
                ))],
                Err(_) => {
                    Metrics::incr(&self.metrics.decode_structural_errors);
                    vec![]
                }
            },
            PORT_MAP_REPORT => match wire::decode_map_report(&data.payload) {
                Ok(report) => self.map_report_events(packet, &report),
                Err(_) => {
                    Metrics::incr(&self.metrics.decode_structural_errors);
                    vec![]
                }
            },
            _ => {
                Metrics::incr(&self.metrics.unknown_count);
                vec![]
            }
        }
    }

    fn position_event(
        &self,
        from_id: &NodeId,
        packet: &wire::MeshPacket,
        pos: &wire::Position,
    ) -> Option<ProcessedEvent> {
        let lat_i = pos.latitude_i?;
        let lon_i = pos.longitude_i?;
        if lat_i == 0 && lon_i == 0 && pos.altitude.is_none() {
            return None; // "unknown" per §4.C
        }
        let latitude = (lat_i as f64 / 1e7).clamp(-90.0, 90.0);
        let longitude = (lon_i as f64 / 1e7).clamp(-180.0, 180.0);
        Some(ProcessedEvent::Position(PositionEvent {
            node_id: from_id.clone(),
            node_num: packet.from,
            latitude,
            longitude,
            altitude: pos.altitude,
            precision_bits: pos.precision_bits,
            timestamp: pos.time.map(|t| t as i64 * 1000).unwrap_or(packet.rx_time as i64 * 1000),
            snr: Some(packet.rx_snr),
            rssi: Some(packet.rx_rssi),
        }))
    }

    fn node_event_from_user(&self, packet: &wire::MeshPacket, user: &wire::User) -> NodeEvent {
        NodeEvent {
            id: user
                .id
                .as_ref()
                .map(|s| NodeId(s.clone()))
                .unwrap_or_else(|| NodeId::from_node_num(packet.from)),
            node_num: packet.from,
            short_name: user.short_name.clone(),
            long_name: user.long_name.clone(),
            hw_model: Some(HwModel::from_wire(user.hw_model)),
            role: Some(NodeRole::from_wire(user.role)),
            last_heard: packet.rx_time as i64 * 1000,
            snr: Some(packet.rx_snr),
            rssi: Some(packet.rx_rssi),
            hops_away: Some(packet.hop_start.saturating_sub(packet.hop_limit)),
        }
    }

    fn telemetry_event(
        &self,
        from_id: &NodeId,
        packet: &wire::MeshPacket,
        t: &wire::Telemetry,
    ) -> TelemetryEvent {
        let metrics = t.device_metrics.clone().unwrap_or_default();
        TelemetryEvent {
            node_id: from_id.clone(),
            node_num: packet.from,
            timestamp: t.time.map(|v| v as i64 * 1000).unwrap_or(packet.rx_time as i64 * 1000),
            battery_level: metrics.battery_level,
            voltage: metrics.voltage,
            channel_utilization: metrics.channel_utilization,
            air_util_tx: metrics.air_util_tx,
            uptime_seconds: metrics.uptime_seconds,
            temperature: None, // environmental metrics out of core scope
            snr: Some(packet.rx_snr),
            rssi: Some(packet.rx_rssi),
        }
    }

    fn traceroute_event(
        &self,
        packet: &wire::MeshPacket,
        data: &wire::Data,
        route: &wire::RouteDiscovery,
    ) -> TracerouteEvent {
        let success = data.reply_id.is_some();
        let to_id = if packet.to == BROADCAST_NODE_NUM {
            NodeId::from_node_num(BROADCAST_NODE_NUM)
        } else {
            NodeId::from_node_num(packet.to)
        };
        TracerouteEvent {
            from_id: NodeId::from_node_num(packet.from),
            to_id,
            timestamp: packet.rx_time as i64 * 1000,
            route: route.route.clone(),
            route_back: (!route.route_back.is_empty()).then(|| route.route_back.clone()),
            snr_towards: (!route.snr_towards.is_empty()).then(|| route.snr_towards.clone()),
            snr_back: (!route.snr_back.is_empty()).then(|| route.snr_back.clone()),
            hops: route.route.len() as u32,
            success,
            latency_ms: None,
        }
    }

    fn map_report_events(&self, packet: &wire::MeshPacket, report: &wire::MapReport) -> Vec<ProcessedEvent> {
        let from_id = NodeId::from_node_num(packet.from);
        let mut out = vec![ProcessedEvent::Node(NodeEvent {
            id: from_id.clone(),
            node_num: packet.from,
            short_name: report.short_name.clone(),
            long_name: report.long_name.clone(),
            hw_model: Some(HwModel::from_wire(report.hw_model)),
            role: Some(NodeRole::from_wire(report.role)),
            last_heard: packet.rx_time as i64 * 1000,
            snr: Some(packet.rx_snr),
            rssi: Some(packet.rx_rssi),
            hops_away: None,
        })];

        if let (Some(lat_i), Some(lon_i)) = (report.latitude_i, report.longitude_i) {
            if !(lat_i == 0 && lon_i == 0 && report.altitude.is_none()) {
                out.push(ProcessedEvent::Position(PositionEvent {
                    node_id: from_id,
                    node_num: packet.from,
                    latitude: (lat_i as f64 / 1e7).clamp(-90.0, 90.0),
                    longitude: (lon_i as f64 / 1e7).clamp(-180.0, 180.0),
                    altitude: report.altitude,
                    precision_bits: report.position_precision,
                    timestamp: packet.rx_time as i64 * 1000,
                    snr: Some(packet.rx_snr),
                    rssi: Some(packet.rx_rssi),
                }));
            }
        }
        out
    }

    // ── JSON categories ───────────────────────────────────────────────────

    fn classify_channel_json(&self, payload: &[u8]) -> Result<Vec<ProcessedEvent>, ClassifyError> {
        #[derive(Deserialize)]
        struct ChannelJson {
            text: Option<String>,
            from: Option<u32>,
            to: Option<u32>,
            #[serde(default)]
            channel: u32,
        }
        let parsed: ChannelJson = serde_json::from_slice(payload)?;
        let Some(text) = parsed.text else {
            return Ok(vec![]);
        };
        let from = parsed.from.unwrap_or(0);
        let to_id = match parsed.to {
            Some(BROADCAST_NODE_NUM) | None => BROADCAST_TO_ID.to_string(),
            Some(to) => NodeId::from_node_num(to).0,
        };
        Ok(vec![ProcessedEvent::Message(MessageEvent {
            packet_id: 0,
            from_id: NodeId::from_node_num(from),
            to_id,
            channel: parsed.channel,
            text,
            timestamp: now_ms(),
            snr: None,
            rssi: None,
            hops_away: None,
            reply_to: None,
        })])
    }

    fn classify_stat(
        &self,
        gateway_id: Option<&str>,
        payload: &[u8],
    ) -> Result<Vec<ProcessedEvent>, ClassifyError> {
        #[derive(Deserialize, Default)]
        struct StatJson {
            battery_level: Option<u32>,
            voltage: Option<f32>,
            channel_utilization: Option<f32>,
            air_util_tx: Option<f32>,
            uptime_seconds: Option<u32>,
        }
        let parsed: StatJson = serde_json::from_slice(payload)?;
        let Some(gateway_id) = gateway_id else {
            return Ok(vec![]);
        };
        let node_id = NodeId(gateway_id.to_string());
        let node_num = node_id.parse_node_num().unwrap_or(0);
        Ok(vec![ProcessedEvent::Telemetry(TelemetryEvent {
            node_id,
            node_num,
            timestamp: now_ms(),
            battery_level: parsed.battery_level,
            voltage: parsed.voltage,
            channel_utilization: parsed.channel_utilization,
            air_util_tx: parsed.air_util_tx,
            uptime_seconds: parsed.uptime_seconds,
            temperature: None,
            snr: None,
            rssi: None,
        })])
    }

    fn classify_map(&self, payload: &[u8]) -> Result<Vec<ProcessedEvent>, ClassifyError> {
        #[derive(Deserialize)]
        struct MapJson {
            lat: Option<f64>,
            lon: Option<f64>,
            node_id: Option<String>,
        }
        if let Ok(parsed) = serde_json::from_slice::<MapJson>(payload) {
            if let (Some(lat), Some(lon)) = (parsed.lat, parsed.lon) {
                let node_id = parsed
                    .node_id
                    .map(NodeId)
                    .unwrap_or_else(|| NodeId::from_node_num(0));
                let node_num = node_id.parse_node_num().unwrap_or(0);
                return Ok(vec![ProcessedEvent::Position(PositionEvent {
                    node_id,
                    node_num,
                    latitude: lat.clamp(-90.0, 90.0),
                    longitude: lon.clamp(-180.0, 180.0),
                    altitude: None,
                    precision_bits: None,
                    timestamp: now_ms(),
                    snr: None,
                    rssi: None,
                })]);
            }
        }
        // Not JSON with lat/lon — try a raw map-report wire record.
        let report = wire::decode_map_report(payload)?;
        let synthetic_packet = wire::MeshPacket {
            from: 0,
            rx_time: (now_ms() / 1000) as u32,
            ..Default::default()
        };
        Ok(self.map_report_events(&synthetic_packet, &report))
    }

    fn classify_json(
        &self,
        gateway_id: Option<&str>,
        payload: &[u8],
    ) -> Result<Vec<ProcessedEvent>, ClassifyError> {
        #[derive(Deserialize)]
        struct Discriminated {
            #[serde(rename = "type")]
            kind: String,
        }
        let disc: Discriminated = serde_json::from_slice(payload)?;
        match disc.kind.as_str() {
            "text" => self.classify_channel_json(payload),
            "telemetry" => self.classify_stat(gateway_id, payload),
            "position" | "map" => self.classify_map(payload),
            _ => Ok(vec![]),
        }
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_index::InMemoryChannelIndex;
    use meshgate_core::crypto::DEFAULT_PSK;
    use meshgate_core::wire::{
        encode_data, encode_mesh_packet, encode_position, encode_service_envelope, Data,
        MeshPacket, PacketBody, Position, ServiceEnvelope,
    };

    fn classifier() -> Classifier<InMemoryChannelIndex> {
        Classifier::new(InMemoryChannelIndex::new(), KeyRing::new(), Arc::new(Metrics::new()))
    }

    #[test]
    fn default_channel_text_broadcast_scenario() {
        let c = classifier();
        let key = crypto::expand_psk(&DEFAULT_PSK).unwrap();
        let plaintext = encode_data(&Data {
            portnum: PORT_TEXT_MESSAGE,
            payload: b"Hello".to_vec(),
            ..Default::default()
        });
        let ct = crypto::encrypt(&plaintext, &key, 0x00123456, 0x298A814D);
        let packet = MeshPacket {
            from: 0x298A814D,
            to: BROADCAST_NODE_NUM,
            channel: 0,
            id: 0x00123456,
            body: PacketBody::Encrypted(ct),
            ..Default::default()
        };
        let envelope = ServiceEnvelope {
            packet: Some(packet),
            channel_id: Some("LongFast".to_string()),
            gateway_id: Some("!abcdef00".to_string()),
        };
        let payload = encode_service_envelope(&envelope);
        let events = c.classify("msh/US/2/e/LongFast/!abcdef00", &payload);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ProcessedEvent::Message(m) => {
                assert_eq!(m.from_id.as_str(), "!298a814d");
                assert_eq!(m.to_id, "broadcast");
                assert_eq!(m.text, "Hello");
                assert_eq!(m.packet_id, 0x00123456);
            }
            other => panic!("expected Message, got {other:?}"),
        }
    }

    #[test]
    fn fresh_position_scenario() {
        let c = classifier();
        let key = crypto::expand_psk(&DEFAULT_PSK).unwrap();
        let position = encode_position(&Position {
            latitude_i: Some(377780208),
            longitude_i: Some(-1224400000),
            altitude: Some(42),
            time: Some(1700000000),
            precision_bits: Some(16),
        });
        let data = encode_data(&Data {
            portnum: PORT_POSITION,
            payload: position,
            ..Default::default()
        });
        let ct = crypto::encrypt(&data, &key, 1, 0x01020304);
        let packet = MeshPacket {
            from: 0x01020304,
            to: BROADCAST_NODE_NUM,
            id: 1,
            body: PacketBody::Encrypted(ct),
            ..Default::default()
        };
        let envelope = ServiceEnvelope {
            packet: Some(packet),
            channel_id: Some("LongFast".to_string()),
            gateway_id: None,
        };
        let payload = encode_service_envelope(&envelope);
        let events = c.classify("msh/US/2/e/LongFast/!01020304", &payload);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ProcessedEvent::Position(p) => {
                assert_eq!(p.node_id.as_str(), "!01020304");
                assert!((p.latitude - 37.7780208).abs() < 1e-5);
                assert_eq!(p.altitude, Some(42));
            }
            other => panic!("expected Position, got {other:?}"),
        }
    }

    #[test]
    fn unresolved_decryption_falls_back_to_mqtt_raw() {
        let c = classifier();
        let packet = MeshPacket {
            from: 1,
            body: PacketBody::Encrypted(vec![1, 2, 3, 4, 5, 6, 7, 8]),
            ..Default::default()
        };
        let envelope = ServiceEnvelope {
            packet: Some(packet),
            channel_id: Some("SomeOtherChannel".to_string()),
            gateway_id: None,
        };
        let payload = encode_service_envelope(&envelope);
        let events = c.classify("msh/US/2/e/SomeOtherChannel", &payload);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ProcessedEvent::MqttRaw(_)));
    }

    #[test]
    fn admin_port_produces_no_event() {
        let c = classifier();
        let key = crypto::expand_psk(&DEFAULT_PSK).unwrap();
        let data = encode_data(&Data {
            portnum: PORT_ADMIN,
            payload: vec![1, 2, 3],
            ..Default::default()
        });
        let ct = crypto::encrypt(&data, &key, 1, 1);
        let packet = MeshPacket {
            from: 1,
            id: 1,
            body: PacketBody::Encrypted(ct),
            ..Default::default()
        };
        let envelope = ServiceEnvelope {
            packet: Some(packet),
            channel_id: Some("admin".to_string()),
            gateway_id: None,
        };
        let payload = encode_service_envelope(&envelope);
        let events = c.classify("msh/US/2/e/admin", &payload);
        assert!(events.is_empty());
    }

    #[test]
    fn channel_json_text_event() {
        let c = classifier();
        let payload = br#"{"text":"hi there","from":16}"#;
        let events = c.classify("msh/US/2/c/LongFast", payload);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ProcessedEvent::Message(m) if m.text == "hi there"));
    }

    #[test]
    fn malformed_topic_yields_mqtt_raw() {
        let c = classifier();
        let events = c.classify("not-a-valid-topic", b"{}");
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ProcessedEvent::MqttRaw(_)));
    }

    #[test]
    fn json_telemetry_threads_gateway_id_from_topic() {
        let c = classifier();
        let payload = br#"{"type":"telemetry","battery_level":71}"#;
        let events = c.classify("msh/US/2/json/!abcdef00", payload);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ProcessedEvent::Telemetry(t) => {
                assert_eq!(t.node_id.as_str(), "!abcdef00");
                assert_eq!(t.battery_level, Some(71));
            }
            other => panic!("expected Telemetry, got {other:?}"),
        }
    }
}
