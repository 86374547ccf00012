//! `SnapshotProvider` (§4.J) — a dedicated read-only SQLite connection so a
//! freshly-connected dashboard session can be caught up without contending
//! with the writer's single owned connection.

use std::sync::Mutex;

use rusqlite::Connection;

use meshgate_core::broadcast::{SnapshotData, SnapshotProvider};
use meshgate_core::domain::{HwModel, MessageEvent, NodeEvent, NodeId, NodeRole, PositionEvent};

fn parse_hw_model(s: Option<String>) -> Option<HwModel> {
    match s.as_deref() {
        None => None,
        Some("unset") => Some(HwModel::Unset),
        Some("tbeam") => Some(HwModel::TBeam),
        Some("heltec") => Some(HwModel::Heltec),
        Some("tlora") => Some(HwModel::TLora),
        Some("rak_wisblock") => Some(HwModel::RakWisblock),
        Some("station") => Some(HwModel::Station),
        Some(other) => other
            .strip_prefix("other(")
            .and_then(|s| s.strip_suffix(')'))
            .and_then(|n| n.parse().ok())
            .map(HwModel::Other),
    }
}

fn parse_node_role(s: Option<String>) -> Option<NodeRole> {
    match s.as_deref() {
        None => None,
        Some("client") => Some(NodeRole::Client),
        Some("client_mute") => Some(NodeRole::ClientMute),
        Some("router") => Some(NodeRole::Router),
        Some("router_client") => Some(NodeRole::RouterClient),
        Some("repeater") => Some(NodeRole::Repeater),
        Some("tracker") => Some(NodeRole::Tracker),
        Some("sensor") => Some(NodeRole::Sensor),
        Some(other) => other
            .strip_prefix("other(")
            .and_then(|s| s.strip_suffix(')'))
            .and_then(|n| n.parse().ok())
            .map(NodeRole::Other),
    }
}

/// Wraps its own `rusqlite::Connection`, opened separately from the
/// writer's. `rusqlite::Connection` is `!Sync`, so reads are serialized
/// behind a mutex the same way the teacher serializes its on-disk cache.
pub struct SqliteSnapshotProvider {
    conn: Mutex<Connection>,
    max_nodes: usize,
    max_events: usize,
}

impl SqliteSnapshotProvider {
    pub fn open(database_path: &str, max_nodes: usize, max_events: usize) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(database_path)?;
        conn.pragma_update(None, "query_only", true)?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_nodes,
            max_events,
        })
    }

    fn fetch_nodes(&self, conn: &Connection) -> Vec<NodeEvent> {
        let mut stmt = match conn.prepare(
            "SELECT id, node_num, short_name, long_name, hw_model, role, last_heard, snr, rssi, hops_away \
             FROM nodes ORDER BY last_heard DESC LIMIT ?1",
        ) {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        let rows = stmt.query_map([self.max_nodes as i64], |row| {
            Ok(NodeEvent {
                id: NodeId(row.get(0)?),
                node_num: row.get::<_, i64>(1)? as u32,
                short_name: row.get(2)?,
                long_name: row.get(3)?,
                hw_model: parse_hw_model(row.get(4)?),
                role: parse_node_role(row.get(5)?),
                last_heard: row.get(6)?,
                snr: row.get(7)?,
                rssi: row.get(8)?,
                hops_away: row.get::<_, Option<i64>>(9)?.map(|v| v as u32),
            })
        });
        match rows {
            Ok(iter) => iter.filter_map(Result::ok).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn fetch_positions(&self, conn: &Connection) -> Vec<PositionEvent> {
        let mut stmt = match conn.prepare(
            "SELECT node_id, node_num, latitude, longitude, altitude, precision_bits, timestamp, snr, rssi \
             FROM positions ORDER BY timestamp DESC LIMIT ?1",
        ) {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        let rows = stmt.query_map([self.max_events as i64], |row| {
            Ok(PositionEvent {
                node_id: NodeId(row.get(0)?),
                node_num: row.get::<_, i64>(1)? as u32,
                latitude: row.get(2)?,
                longitude: row.get(3)?,
                altitude: row.get::<_, Option<i64>>(4)?.map(|v| v as i32),
                precision_bits: row.get::<_, Option<i64>>(5)?.map(|v| v as u32),
                timestamp: row.get(6)?,
                snr: row.get(7)?,
                rssi: row.get(8)?,
            })
        });
        match rows {
            Ok(iter) => iter.filter_map(Result::ok).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn fetch_messages(&self, conn: &Connection) -> Vec<MessageEvent> {
        let mut stmt = match conn.prepare(
            "SELECT id, from_id, to_id, channel, text, timestamp, snr, rssi, hops_away, reply_to \
             FROM messages ORDER BY timestamp DESC LIMIT ?1",
        ) {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        let rows = stmt.query_map([self.max_events as i64], |row| {
            Ok(MessageEvent {
                packet_id: row.get::<_, i64>(0)? as u32,
                from_id: NodeId(row.get(1)?),
                to_id: row.get(2)?,
                channel: row.get::<_, i64>(3)? as u32,
                text: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                timestamp: row.get(5)?,
                snr: row.get(6)?,
                rssi: row.get(7)?,
                hops_away: row.get::<_, Option<i64>>(8)?.map(|v| v as u32),
                reply_to: row.get::<_, Option<i64>>(9)?.map(|v| v as u32),
            })
        });
        match rows {
            Ok(iter) => iter.filter_map(Result::ok).collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl SnapshotProvider for SqliteSnapshotProvider {
    fn build_snapshot(&self) -> SnapshotData {
        let conn = match self.conn.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        SnapshotData {
            nodes: self.fetch_nodes(&conn),
            positions: self.fetch_positions(&conn),
            recent_messages: self.fetch_messages(&conn),
        }
    }
}
