//! Domain event types — the typed, normalized shapes the classifier
//! produces and the writer/broadcaster consume. This is the ground truth
//! every consumer matches on exhaustively (see SPEC_FULL §9).

use serde::{Deserialize, Serialize};

/// A mesh node's textual id: `!` followed by 8 lowercase hex digits of its
/// 32-bit node number. `id ↔ node_num` is a bijection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn from_node_num(node_num: u32) -> Self {
        Self(format!("!{node_num:08x}"))
    }

    /// Parse the 32-bit node number back out of a textual id of the form
    /// `!xxxxxxxx`. Used by the batch writer to synthesize stub-node rows
    /// from a bare id when no node number was carried alongside it.
    pub fn parse_node_num(&self) -> Option<u32> {
        u32::from_str_radix(self.0.strip_prefix('!')?, 16).ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sentinel to-id used for broadcast messages (wire value `0xFFFFFFFF`).
pub const BROADCAST_TO_ID: &str = "broadcast";
pub const BROADCAST_NODE_NUM: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HwModel {
    Unset,
    TBeam,
    Heltec,
    TLora,
    RakWisblock,
    Station,
    Other(u32),
}

impl HwModel {
    pub fn from_wire(v: u32) -> Self {
        match v {
            0 => Self::Unset,
            4 => Self::TBeam,
            5 => Self::Heltec,
            2 => Self::TLora,
            25 => Self::RakWisblock,
            43 => Self::Station,
            other => Self::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Client,
    ClientMute,
    Router,
    RouterClient,
    Repeater,
    Tracker,
    Sensor,
    Other(u32),
}

impl NodeRole {
    pub fn from_wire(v: u32) -> Self {
        match v {
            0 => Self::Client,
            1 => Self::ClientMute,
            2 => Self::Router,
            3 => Self::RouterClient,
            4 => Self::Repeater,
            5 => Self::Tracker,
            6 => Self::Sensor,
            other => Self::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRole {
    Disabled,
    Primary,
    Secondary,
}

/// Node identity — emitted on NODEINFO_APP payloads and map-reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub id: NodeId,
    pub node_num: u32,
    pub short_name: Option<String>,
    pub long_name: Option<String>,
    pub hw_model: Option<HwModel>,
    pub role: Option<NodeRole>,
    pub last_heard: i64,
    pub snr: Option<f32>,
    pub rssi: Option<i32>,
    pub hops_away: Option<u32>,
}

/// Position fix — degrees, not the wire's fixed-point integer form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionEvent {
    pub node_id: NodeId,
    pub node_num: u32,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<i32>,
    pub precision_bits: Option<u32>,
    pub timestamp: i64,
    pub snr: Option<f32>,
    pub rssi: Option<i32>,
}

/// Device telemetry — environmental metrics are out of core scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub node_id: NodeId,
    pub node_num: u32,
    pub timestamp: i64,
    pub battery_level: Option<u32>,
    pub voltage: Option<f32>,
    pub channel_utilization: Option<f32>,
    pub air_util_tx: Option<f32>,
    pub uptime_seconds: Option<u32>,
    pub temperature: Option<f32>,
    pub snr: Option<f32>,
    pub rssi: Option<i32>,
}

/// Text message. `to_id` is normalized to `"broadcast"` for the wire's
/// `0xFFFFFFFF` sentinel (SPEC_FULL §9 decides this is the canonical form;
/// the raw value is deliberately not carried alongside it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub packet_id: u32,
    pub from_id: NodeId,
    pub to_id: String,
    pub channel: u32,
    pub text: String,
    pub timestamp: i64,
    pub snr: Option<f32>,
    pub rssi: Option<i32>,
    pub hops_away: Option<u32>,
    pub reply_to: Option<u32>,
}

/// Traceroute result or request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracerouteEvent {
    pub from_id: NodeId,
    pub to_id: NodeId,
    pub timestamp: i64,
    pub route: Vec<u32>,
    pub route_back: Option<Vec<u32>>,
    pub snr_towards: Option<Vec<i32>>,
    pub snr_back: Option<Vec<i32>>,
    pub hops: u32,
    pub success: bool,
    pub latency_ms: Option<u64>,
}

/// A raw MQTT payload the classifier couldn't turn into a typed event —
/// forwarded to the broadcaster for diagnostic visibility only, never
/// persisted. Field names follow §6's literal frame shape
/// (`{topic, payload_b64, parsedType, nodeId?, data?}`), which mixes snake
/// and camel case, so the renames here are deliberate, not an oversight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttRawEvent {
    pub topic: String,
    pub payload_b64: String,
    #[serde(rename = "parsedType")]
    pub parsed_type: Option<String>,
    #[serde(rename = "nodeId")]
    pub node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// The ground-truth discriminated union every downstream consumer
/// (dedupe, rate limiter, priority queue, batch writer, broadcaster)
/// matches on exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ProcessedEvent {
    Node(NodeEvent),
    Position(PositionEvent),
    Telemetry(TelemetryEvent),
    Message(MessageEvent),
    Traceroute(TracerouteEvent),
    MqttRaw(MqttRawEvent),
}

impl ProcessedEvent {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Node(_) => "node",
            Self::Position(_) => "position",
            Self::Telemetry(_) => "telemetry",
            Self::Message(_) => "message",
            Self::Traceroute(_) => "traceroute",
            Self::MqttRaw(_) => "mqtt_raw",
        }
    }

    /// The source node id this event is about, when it has one. Used by
    /// the rate limiter and stub-node insertion (§4.G step 3).
    pub fn source_node_id(&self) -> Option<&NodeId> {
        match self {
            Self::Node(e) => Some(&e.id),
            Self::Position(e) => Some(&e.node_id),
            Self::Telemetry(e) => Some(&e.node_id),
            Self::Message(e) => Some(&e.from_id),
            Self::Traceroute(e) => Some(&e.from_id),
            Self::MqttRaw(_) => None,
        }
    }
}

/// Learned channel (§4.C / §4.H). Channel index → name is stable once
/// assigned; role defaults to `Primary` for the first-learned channel on a
/// topic tree and `Secondary` thereafter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub index: u8,
    pub name: String,
    pub role: ChannelRole,
    pub has_key: bool,
    pub last_seen: i64,
}
