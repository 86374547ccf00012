//! Fan-out session registry and frame types shared between `meshgated`'s
//! broadcaster task (§4.J) and `meshgate-api`'s websocket handler. Kept
//! dependency-free of storage so this module can sit in the core crate:
//! the snapshot a freshly-registered session receives is built by whoever
//! constructs a `Broadcaster` (the daemon, via `SnapshotProvider`), not by
//! this module.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::domain::{MessageEvent, MqttRawEvent, NodeEvent, PositionEvent, ProcessedEvent, TelemetryEvent};

pub const MAX_OUTBOUND_BUFFER_BYTES: usize = 1_048_576;
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const HEARTBEAT_MISS_LIMIT: Duration = Duration::from_secs(60);
pub const DEFAULT_COALESCE_INTERVAL: Duration = Duration::from_millis(250);
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionFilter {
    pub kinds: Option<HashSet<String>>,
    #[serde(rename = "nodeIds", default)]
    pub node_ids: Option<HashSet<String>>,
    #[serde(default)]
    pub channels: Option<HashSet<u32>>,
}

impl SessionFilter {
    /// Whether `event` should be delivered to a session carrying this filter.
    /// An absent filter component admits everything; a present one must
    /// match when the event carries the corresponding attribute.
    pub fn admits(&self, event: &ProcessedEvent) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(event.kind_name()) {
                return false;
            }
        }
        if let Some(node_ids) = &self.node_ids {
            if let Some(id) = event.source_node_id() {
                if !node_ids.contains(id.as_str()) {
                    return false;
                }
            }
        }
        if let Some(channels) = &self.channels {
            if let ProcessedEvent::Message(m) = event {
                if !channels.contains(&m.channel) {
                    return false;
                }
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotData {
    pub nodes: Vec<NodeEvent>,
    pub positions: Vec<PositionEvent>,
    #[serde(rename = "recentMessages")]
    pub recent_messages: Vec<MessageEvent>,
}

/// Implemented by whoever owns the store; keeps this crate free of a
/// `rusqlite` dependency.
pub trait SnapshotProvider: Send + Sync {
    fn build_snapshot(&self) -> SnapshotData;
}

/// Frames the client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Ping,
    Subscribe { filter: SessionFilter },
    Unsubscribe,
    RequestSnapshot,
}

/// Frames pushed to the client. `Disconnected` is a supplement to §6's
/// literal frame list: §4.K requires "explicit disconnect frames" on
/// shutdown and §4.J requires the overflow drop to carry "a specific
/// reason", and neither is expressible with the frames §6 enumerates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastFrame {
    Connected { timestamp: i64 },
    Pong { timestamp: i64 },
    Snapshot { data: SnapshotData },
    NodeUpdate { nodes: Vec<NodeEvent> },
    PositionUpdate { positions: Vec<PositionEvent> },
    TelemetryUpdate { telemetry: Vec<TelemetryEvent> },
    Message { messages: Vec<MessageEvent> },
    MqttRaw { packets: Vec<MqttRawEvent> },
    Disconnected { reason: String },
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Handed back to the websocket layer on registration: the receiving end
/// of the session's outbound queue, and the byte counter it must decrement
/// after each frame actually hits the socket.
pub struct SessionOutbox {
    pub session_id: SessionId,
    pub rx: mpsc::Receiver<(BroadcastFrame, usize)>,
    pending_bytes: Arc<AtomicUsize>,
}

impl SessionOutbox {
    pub fn ack_sent(&self, bytes: usize) {
        self.pending_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }
}

struct SessionHandle {
    connected_at: Instant,
    last_inbound: Mutex<Instant>,
    bytes_sent: AtomicU64,
    messages_sent: AtomicU64,
    pending_bytes: Arc<AtomicUsize>,
    filter: RwLock<SessionFilter>,
    tx: mpsc::Sender<(BroadcastFrame, usize)>,
}

/// Why a session was dropped. Surfaced in the `Disconnected` frame and in
/// logs; the session is removed from the registry regardless.
pub enum DropReason {
    OutboundBufferOverflow,
    HeartbeatTimeout,
    ServerShutdown,
}

impl DropReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::OutboundBufferOverflow => "outbound_buffer_overflow",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::ServerShutdown => "server_shutdown",
        }
    }
}

/// Session registry plus ingestion-event coalescing. Owns no I/O itself —
/// `meshgated::broadcaster` drives the periodic coalesce/heartbeat ticks,
/// `meshgate-api::ws` drives per-socket read/write loops against the
/// handles this type hands out.
pub struct Broadcaster {
    sessions: DashMap<SessionId, SessionHandle>,
    next_id: AtomicU64,
    pending_nodes: Mutex<Vec<NodeEvent>>,
    pending_positions: Mutex<Vec<PositionEvent>>,
    pending_telemetry: Mutex<Vec<TelemetryEvent>>,
    pending_messages: Mutex<Vec<MessageEvent>>,
    pending_mqtt_raw: Mutex<Vec<MqttRawEvent>>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            pending_nodes: Mutex::new(Vec::new()),
            pending_positions: Mutex::new(Vec::new()),
            pending_telemetry: Mutex::new(Vec::new()),
            pending_messages: Mutex::new(Vec::new()),
            pending_mqtt_raw: Mutex::new(Vec::new()),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Register a new session; sends the `connected` frame and returns the
    /// outbox the caller must drain to the real socket.
    pub fn register(&self) -> SessionOutbox {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let pending_bytes = Arc::new(AtomicUsize::new(0));
        let handle = SessionHandle {
            connected_at: Instant::now(),
            last_inbound: Mutex::new(Instant::now()),
            bytes_sent: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            pending_bytes: pending_bytes.clone(),
            filter: RwLock::new(SessionFilter::default()),
            tx,
        };
        self.sessions.insert(id, handle);
        self.push_frame(id, BroadcastFrame::Connected { timestamp: now_ms() });
        SessionOutbox { session_id: id, rx, pending_bytes }
    }

    pub fn unregister(&self, id: SessionId) {
        self.sessions.remove(&id);
    }

    pub fn touch(&self, id: SessionId) {
        if let Some(handle) = self.sessions.get(&id) {
            *handle.last_inbound.lock().unwrap() = Instant::now();
        }
    }

    pub fn set_filter(&self, id: SessionId, filter: SessionFilter) {
        if let Some(handle) = self.sessions.get(&id) {
            *handle.filter.write().unwrap() = filter;
        }
    }

    pub fn clear_filter(&self, id: SessionId) {
        self.set_filter(id, SessionFilter::default());
    }

    pub fn send_snapshot(&self, id: SessionId, data: SnapshotData) {
        self.push_frame(id, BroadcastFrame::Snapshot { data });
    }

    /// Buffer an admitted event for the next coalesced flush (§4.J). Called
    /// from the queue-drain task, never blocks on a session socket.
    pub fn dispatch(&self, event: ProcessedEvent) {
        match event {
            ProcessedEvent::Node(e) => self.pending_nodes.lock().unwrap().push(e),
            ProcessedEvent::Position(e) => self.pending_positions.lock().unwrap().push(e),
            ProcessedEvent::Telemetry(e) => self.pending_telemetry.lock().unwrap().push(e),
            ProcessedEvent::Message(e) => self.pending_messages.lock().unwrap().push(e),
            ProcessedEvent::Traceroute(_) => {} // no dedicated wire frame; dashboard reads via snapshot
            ProcessedEvent::MqttRaw(e) => self.pending_mqtt_raw.lock().unwrap().push(e),
        }
    }

    /// Flush whatever accumulated since the last tick as typed update
    /// frames, skipping sessions whose filter rejects every event of a
    /// given kind. Called every `coalesce_interval` (default 250ms).
    pub fn flush_coalesced(&self) {
        let nodes = std::mem::take(&mut *self.pending_nodes.lock().unwrap());
        let positions = std::mem::take(&mut *self.pending_positions.lock().unwrap());
        let telemetry = std::mem::take(&mut *self.pending_telemetry.lock().unwrap());
        let messages = std::mem::take(&mut *self.pending_messages.lock().unwrap());
        let mqtt_raw = std::mem::take(&mut *self.pending_mqtt_raw.lock().unwrap());

        if nodes.is_empty()
            && positions.is_empty()
            && telemetry.is_empty()
            && messages.is_empty()
            && mqtt_raw.is_empty()
        {
            return;
        }

        // Snapshot (id, filter) pairs before pushing frames: push_frame may
        // remove a session on overflow, which must not happen while a
        // DashMap iterator still holds that shard's read lock.
        let targets: Vec<(SessionId, SessionFilter)> = self
            .sessions
            .iter()
            .map(|entry| (*entry.key(), entry.value().filter.read().unwrap().clone()))
            .collect();

        for (id, filter) in targets {
            let admitted_nodes: Vec<_> = nodes
                .iter()
                .filter(|n| filter.admits(&ProcessedEvent::Node((*n).clone())))
                .cloned()
                .collect();
            if !admitted_nodes.is_empty() {
                self.push_frame(id, BroadcastFrame::NodeUpdate { nodes: admitted_nodes });
            }

            let admitted_positions: Vec<_> = positions
                .iter()
                .filter(|p| filter.admits(&ProcessedEvent::Position((*p).clone())))
                .cloned()
                .collect();
            if !admitted_positions.is_empty() {
                self.push_frame(id, BroadcastFrame::PositionUpdate { positions: admitted_positions });
            }

            let admitted_telemetry: Vec<_> = telemetry
                .iter()
                .filter(|t| filter.admits(&ProcessedEvent::Telemetry((*t).clone())))
                .cloned()
                .collect();
            if !admitted_telemetry.is_empty() {
                self.push_frame(id, BroadcastFrame::TelemetryUpdate { telemetry: admitted_telemetry });
            }

            let admitted_messages: Vec<_> = messages
                .iter()
                .filter(|m| filter.admits(&ProcessedEvent::Message((*m).clone())))
                .cloned()
                .collect();
            if !admitted_messages.is_empty() {
                self.push_frame(id, BroadcastFrame::Message { messages: admitted_messages });
            }

            let admitted_raw: Vec<_> = mqtt_raw
                .iter()
                .filter(|r| filter.admits(&ProcessedEvent::MqttRaw((*r).clone())))
                .cloned()
                .collect();
            if !admitted_raw.is_empty() {
                self.push_frame(id, BroadcastFrame::MqttRaw { packets: admitted_raw });
            }
        }
    }

    /// Send heartbeats and prune sessions that missed two in a row.
    pub fn heartbeat_sweep(&self) {
        let now = now_ms();
        let mut stale = Vec::new();
        for entry in self.sessions.iter() {
            let id = *entry.key();
            let elapsed = entry.value().last_inbound.lock().unwrap().elapsed();
            if elapsed >= HEARTBEAT_MISS_LIMIT {
                stale.push(id);
            }
        }
        for id in stale {
            self.drop_session(id, DropReason::HeartbeatTimeout);
        }
        let remaining: Vec<SessionId> = self.sessions.iter().map(|e| *e.key()).collect();
        for id in remaining {
            self.push_frame(id, BroadcastFrame::Pong { timestamp: now });
        }
    }

    /// Close every session with an explicit reason, used by the supervisor
    /// during shutdown.
    pub fn shutdown(&self) {
        let ids: Vec<_> = self.sessions.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.drop_session(id, DropReason::ServerShutdown);
        }
    }

    /// Remove a session, attempting a best-effort `Disconnected` frame
    /// first. Buffer overflow is the one reason that skips the frame — the
    /// queue is, by definition, already full.
    fn drop_session(&self, id: SessionId, reason: DropReason) {
        if !matches!(reason, DropReason::OutboundBufferOverflow) {
            self.push_frame(id, BroadcastFrame::Disconnected { reason: reason.as_str().to_string() });
        }
        self.sessions.remove(&id);
    }

    fn push_frame(&self, id: SessionId, frame: BroadcastFrame) {
        let overflowed = {
            let Some(handle) = self.sessions.get(&id) else { return };
            let serialized_len = serde_json::to_string(&frame).map(|s| s.len()).unwrap_or(0);
            let pending = handle.pending_bytes.load(Ordering::Relaxed);
            if pending + serialized_len > MAX_OUTBOUND_BUFFER_BYTES {
                true
            } else {
                if handle.tx.try_send((frame, serialized_len)).is_ok() {
                    handle.pending_bytes.fetch_add(serialized_len, Ordering::Relaxed);
                    handle.bytes_sent.fetch_add(serialized_len as u64, Ordering::Relaxed);
                    handle.messages_sent.fetch_add(1, Ordering::Relaxed);
                }
                false
            }
        };
        if overflowed {
            tracing::warn!(session_id = id.0, "outbound buffer overflow, dropping session");
            self.drop_session(id, DropReason::OutboundBufferOverflow);
        }
    }
}
