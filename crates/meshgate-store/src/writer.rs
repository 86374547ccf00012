//! Batch writer — buffers admitted domain events and commits them to
//! SQLite in size- or timer-triggered batches, one transaction per batch.
//!
//! Grounded on the teacher's declared-but-unused `rusqlite` dependency and
//! on `ApiState`'s "one struct holds every shared handle" composition; the
//! single-writer-owns-the-connection rule (no `Arc<Mutex<Connection>>`
//! anywhere) is this crate's entire concurrency story.

use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{broadcast, mpsc};

use meshgate_core::domain::{
    HwModel, MessageEvent, NodeEvent, NodeId, NodeRole, PositionEvent, ProcessedEvent,
    TelemetryEvent, TracerouteEvent,
};
use meshgate_core::metrics::Metrics;

use crate::schema;

#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("schema error: {0}")]
    Schema(#[from] schema::SchemaError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Command sent to the writer task. Retention sweeps share the same
/// channel as events so they're processed between normal batches rather
/// than racing the connection from a second thread (§5).
pub enum WriterCommand {
    Event(ProcessedEvent),
    RetentionSweep,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriterStats {
    pub total_processed: u64,
    pub failed: u64,
    pub batch_count: u64,
    pub last_batch_size: usize,
    pub avg_batch_size: f64,
    pub last_batch_latency: Duration,
    pub avg_batch_latency: Duration,
}

fn hw_model_str(m: HwModel) -> String {
    match m {
        HwModel::Unset => "unset".to_string(),
        HwModel::TBeam => "tbeam".to_string(),
        HwModel::Heltec => "heltec".to_string(),
        HwModel::TLora => "tlora".to_string(),
        HwModel::RakWisblock => "rak_wisblock".to_string(),
        HwModel::Station => "station".to_string(),
        HwModel::Other(n) => format!("other({n})"),
    }
}

fn node_role_str(r: NodeRole) -> String {
    match r {
        NodeRole::Client => "client".to_string(),
        NodeRole::ClientMute => "client_mute".to_string(),
        NodeRole::Router => "router".to_string(),
        NodeRole::RouterClient => "router_client".to_string(),
        NodeRole::Repeater => "repeater".to_string(),
        NodeRole::Tracker => "tracker".to_string(),
        NodeRole::Sensor => "sensor".to_string(),
        NodeRole::Other(n) => format!("other({n})"),
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub struct BatchWriter {
    conn: Connection,
    buffer: Vec<ProcessedEvent>,
    max_batch: usize,
    max_wait: Duration,
    retention_days: i64,
    stats: Arc<RwLock<WriterStats>>,
    metrics: Arc<Metrics>,
}

impl BatchWriter {
    pub fn open(
        database_path: &str,
        max_batch: usize,
        max_wait: Duration,
        retention_days: i64,
        metrics: Arc<Metrics>,
    ) -> Result<Self, WriterError> {
        let conn = schema::open(database_path)?;
        Ok(Self {
            conn,
            buffer: Vec::with_capacity(max_batch),
            max_batch,
            max_wait,
            retention_days,
            stats: Arc::new(RwLock::new(WriterStats::default())),
            metrics,
        })
    }

    pub fn stats_handle(&self) -> Arc<RwLock<WriterStats>> {
        self.stats.clone()
    }

    pub fn stats(&self) -> WriterStats {
        *self.stats.read().unwrap()
    }

    /// Healthy when the buffer is under 90% of the batch size and the last
    /// flush committed under the 200ms soft limit.
    pub fn is_healthy(&self) -> bool {
        let stats = self.stats.read().unwrap();
        self.buffer.len() < (self.max_batch * 9 / 10)
            && (stats.batch_count == 0 || stats.last_batch_latency < Duration::from_millis(200))
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn add(&mut self, event: ProcessedEvent) {
        if matches!(event, ProcessedEvent::MqttRaw(_)) {
            return; // diagnostic-only, never persisted
        }
        self.buffer.push(event);
    }

    pub fn should_flush_on_size(&self) -> bool {
        self.buffer.len() >= self.max_batch
    }

    /// Run one full batch-commit cycle. On transaction failure, retries
    /// once after a 100ms backoff; a second failure discards the batch and
    /// counts every event in it as failed (§7).
    pub fn flush(&mut self) -> anyhow::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let batch: Vec<ProcessedEvent> = std::mem::take(&mut self.buffer);
        let batch_size = batch.len();
        let started = Instant::now();

        let mut result = self.commit_batch(&batch);
        if result.is_err() {
            std::thread::sleep(Duration::from_millis(100));
            result = self.commit_batch(&batch);
        }

        let latency = started.elapsed();
        let mut stats = self.stats.write().unwrap();
        match result {
            Ok(()) => {
                stats.total_processed += batch_size as u64;
                for event in &batch {
                    Metrics::incr(&self.metrics.admitted);
                    let _ = event;
                }
            }
            Err(ref err) => {
                tracing::error!(error = %err, batch_size, "batch commit failed after retry, discarding");
                stats.failed += batch_size as u64;
                for _ in 0..batch_size {
                    Metrics::incr(&self.metrics.storage_errors);
                }
            }
        }
        stats.batch_count += 1;
        stats.last_batch_size = batch_size;
        stats.avg_batch_size = ((stats.avg_batch_size * (stats.batch_count - 1) as f64)
            + batch_size as f64)
            / stats.batch_count as f64;
        stats.last_batch_latency = latency;
        let prior_total_nanos = stats.avg_batch_latency.as_nanos() as f64 * (stats.batch_count - 1) as f64;
        stats.avg_batch_latency =
            Duration::from_nanos(((prior_total_nanos + latency.as_nanos() as f64) / stats.batch_count as f64) as u64);

        result
    }

    fn commit_batch(&mut self, batch: &[ProcessedEvent]) -> anyhow::Result<()> {
        use anyhow::Context;

        let mut nodes: Vec<&NodeEvent> = Vec::new();
        let mut positions: Vec<&PositionEvent> = Vec::new();
        let mut telemetry: Vec<&TelemetryEvent> = Vec::new();
        let mut messages: Vec<&MessageEvent> = Vec::new();
        let mut traceroutes: Vec<&TracerouteEvent> = Vec::new();

        for event in batch {
            match event {
                ProcessedEvent::Node(n) => nodes.push(n),
                ProcessedEvent::Position(p) => positions.push(p),
                ProcessedEvent::Telemetry(t) => telemetry.push(t),
                ProcessedEvent::Message(m) => messages.push(m),
                ProcessedEvent::Traceroute(tr) => traceroutes.push(tr),
                ProcessedEvent::MqttRaw(_) => {}
            }
        }

        let tx = self.conn.transaction().context("begin batch transaction")?;
        let now = now_ms();
        let mut upserted: std::collections::HashSet<String> = std::collections::HashSet::new();

        // Step 2: upsert nodes.
        for node in &nodes {
            tx.execute(
                "INSERT INTO nodes (id, node_num, short_name, long_name, hw_model, role, last_heard, snr, rssi, hops_away, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
                 ON CONFLICT(id) DO UPDATE SET
                    short_name = COALESCE(excluded.short_name, nodes.short_name),
                    long_name = COALESCE(excluded.long_name, nodes.long_name),
                    hw_model = COALESCE(excluded.hw_model, nodes.hw_model),
                    role = COALESCE(excluded.role, nodes.role),
                    last_heard = MAX(nodes.last_heard, excluded.last_heard),
                    snr = excluded.snr,
                    rssi = excluded.rssi,
                    hops_away = excluded.hops_away,
                    updated_at = excluded.updated_at",
                params![
                    node.id.as_str(),
                    node.node_num,
                    node.short_name,
                    node.long_name,
                    node.hw_model.map(hw_model_str),
                    node.role.map(node_role_str),
                    node.last_heard,
                    node.snr,
                    node.rssi,
                    node.hops_away,
                    now,
                ],
            )
            .context("upsert node")?;
            upserted.insert(node.id.as_str().to_string());
        }

        // Step 3: stub nodes for positions/telemetry referencing an id not
        // already upserted this batch, so the foreign key never fails even
        // under out-of-order arrival.
        let mut ensure_stub = |id: &NodeId| -> anyhow::Result<()> {
            if upserted.contains(id.as_str()) {
                return Ok(());
            }
            let node_num = id.parse_node_num().unwrap_or(0);
            let changed = tx
                .execute(
                    "INSERT OR IGNORE INTO nodes (id, node_num, short_name, long_name, last_heard, created_at, updated_at)
                     VALUES (?1, ?2, 'UNK', 'Unknown Node', ?3, ?3, ?3)",
                    params![id.as_str(), node_num, now],
                )
                .context("insert stub node")?;
            if changed > 0 {
                upserted.insert(id.as_str().to_string());
            }
            Ok(())
        };
        for position in &positions {
            ensure_stub(&position.node_id)?;
        }
        for t in &telemetry {
            ensure_stub(&t.node_id)?;
        }

        // Step 4: bulk insert positions.
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO positions (node_id, node_num, latitude, longitude, altitude, precision_bits, timestamp, snr, rssi)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                )
                .context("prepare position insert")?;
            for p in &positions {
                if !(-90.0..=90.0).contains(&p.latitude) || !(-180.0..=180.0).contains(&p.longitude) {
                    continue; // out-of-range coordinates never reach storage
                }
                stmt.execute(params![
                    p.node_id.as_str(),
                    p.node_num,
                    p.latitude,
                    p.longitude,
                    p.altitude,
                    p.precision_bits,
                    p.timestamp,
                    p.snr,
                    p.rssi,
                ])
                .context("insert position")?;
            }
        }

        // Step 5: bulk insert telemetry, and refresh each node's latest
        // battery/voltage for fast dashboard reads.
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO telemetry (node_id, node_num, timestamp, battery_level, voltage, channel_utilization, air_util_tx, uptime_seconds, temperature, snr, rssi)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                )
                .context("prepare telemetry insert")?;
            for t in &telemetry {
                stmt.execute(params![
                    t.node_id.as_str(),
                    t.node_num,
                    t.timestamp,
                    t.battery_level,
                    t.voltage,
                    t.channel_utilization,
                    t.air_util_tx,
                    t.uptime_seconds,
                    t.temperature,
                    t.snr,
                    t.rssi,
                ])
                .context("insert telemetry")?;

                if t.battery_level.is_some() || t.voltage.is_some() {
                    tx.execute(
                        "UPDATE nodes SET
                            battery_level = COALESCE(?2, battery_level),
                            voltage = COALESCE(?3, voltage)
                         WHERE id = ?1",
                        params![t.node_id.as_str(), t.battery_level, t.voltage],
                    )
                    .context("refresh node battery/voltage")?;
                }
            }
        }

        // Step 6: bulk insert messages; duplicate packet ids (redelivered
        // past the dedupe window) are ignored rather than erroring.
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT OR IGNORE INTO messages (id, from_id, to_id, channel, text, timestamp, snr, rssi, hops_away, reply_to)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                )
                .context("prepare message insert")?;
            for m in &messages {
                ensure_stub(&m.from_id)?;
                stmt.execute(params![
                    m.packet_id,
                    m.from_id.as_str(),
                    m.to_id,
                    m.channel,
                    m.text,
                    m.timestamp,
                    m.snr,
                    m.rssi,
                    m.hops_away,
                    m.reply_to,
                ])
                .context("insert message")?;
            }
        }

        // Step 7: traceroute records.
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO traceroutes (from_id, to_id, timestamp, route, route_back, snr_towards, snr_back, hops, success, latency_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                )
                .context("prepare traceroute insert")?;
            for r in &traceroutes {
                ensure_stub(&r.from_id)?;
                ensure_stub(&r.to_id)?;
                stmt.execute(params![
                    r.from_id.as_str(),
                    r.to_id.as_str(),
                    r.timestamp,
                    serde_json::to_string(&r.route).unwrap_or_default(),
                    r.route_back.as_ref().map(|v| serde_json::to_string(v).unwrap_or_default()),
                    r.snr_towards.as_ref().map(|v| serde_json::to_string(v).unwrap_or_default()),
                    r.snr_back.as_ref().map(|v| serde_json::to_string(v).unwrap_or_default()),
                    r.hops,
                    r.success,
                    r.latency_ms.map(|v| v as i64),
                ])
                .context("insert traceroute")?;
            }
        }

        drop(ensure_stub);
        tx.commit().context("commit batch")?;
        Ok(())
    }

    /// Daily retention sweep: delete time-series rows older than
    /// `retention_days`; `VACUUM` if more than 1000 rows were removed.
    pub fn retention_sweep(&mut self) -> anyhow::Result<usize> {
        use anyhow::Context;
        let cutoff = now_ms() - self.retention_days * 24 * 60 * 60 * 1000;
        let tx = self.conn.transaction().context("begin retention transaction")?;
        let mut removed = 0usize;
        removed += tx
            .execute("DELETE FROM positions WHERE timestamp < ?1", params![cutoff])
            .context("sweep positions")?;
        removed += tx
            .execute("DELETE FROM telemetry WHERE timestamp < ?1", params![cutoff])
            .context("sweep telemetry")?;
        removed += tx
            .execute("DELETE FROM messages WHERE timestamp < ?1", params![cutoff])
            .context("sweep messages")?;
        tx.commit().context("commit retention sweep")?;

        if removed > 1000 {
            self.conn.execute_batch("VACUUM;").context("vacuum after large sweep")?;
        }
        Ok(removed)
    }

    /// Look up a node's current row count, used by tests and the snapshot
    /// builder for the fan-out broadcaster.
    pub fn node_count(&self) -> rusqlite::Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM nodes", [], |r| r.get(0))
            .optional()
            .map(|v| v.unwrap_or(0))
    }
}

/// Drive the writer from a bounded command channel until shutdown. Runs on
/// the single task that owns the database handle (§5); flush is triggered
/// either by batch size (checked inline after every `add`) or by the
/// `max_wait` timer.
pub async fn run(
    mut writer: BatchWriter,
    mut rx: mpsc::Receiver<WriterCommand>,
    mut shutdown: broadcast::Receiver<()>,
    shutdown_drain_timeout: Duration,
) {
    let mut tick = tokio::time::interval(writer.max_wait);
    tick.tick().await;

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(WriterCommand::Event(event)) => {
                        writer.add(event);
                        if writer.should_flush_on_size() {
                            if let Err(err) = writer.flush() {
                                tracing::error!(error = %err, "size-triggered flush failed");
                            }
                        }
                    }
                    Some(WriterCommand::RetentionSweep) => {
                        match writer.retention_sweep() {
                            Ok(removed) => tracing::info!(removed, "retention sweep complete"),
                            Err(err) => tracing::warn!(error = %err, "retention sweep failed"),
                        }
                    }
                    None => break,
                }
            }
            _ = tick.tick() => {
                if writer.buffer_len() > 0 {
                    if let Err(err) = writer.flush() {
                        tracing::error!(error = %err, "timer-triggered flush failed");
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("writer draining before shutdown");
                let deadline = Instant::now() + shutdown_drain_timeout;
                while Instant::now() < deadline {
                    match rx.try_recv() {
                        Ok(WriterCommand::Event(event)) => writer.add(event),
                        Ok(WriterCommand::RetentionSweep) => {}
                        Err(_) => break,
                    }
                }
                if writer.buffer_len() > 0 {
                    if let Err(err) = writer.flush() {
                        tracing::error!(error = %err, "final flush failed during shutdown");
                    }
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_core::domain::BROADCAST_TO_ID;

    fn test_writer() -> BatchWriter {
        BatchWriter::open(":memory:", 100, Duration::from_millis(500), 30, Arc::new(Metrics::new())).unwrap()
    }

    #[test]
    fn flush_with_empty_buffer_is_noop() {
        let mut writer = test_writer();
        writer.flush().unwrap();
        assert_eq!(writer.stats().batch_count, 0);
    }

    #[test]
    fn position_on_fresh_node_creates_stub_node_row() {
        let mut writer = test_writer();
        writer.add(ProcessedEvent::Position(PositionEvent {
            node_id: NodeId::from_node_num(0x01020304),
            node_num: 0x01020304,
            latitude: 37.7780208,
            longitude: -122.44,
            altitude: Some(42),
            precision_bits: Some(16),
            timestamp: 1_700_000_000_000,
            snr: None,
            rssi: None,
        }));
        writer.flush().unwrap();
        assert_eq!(writer.node_count().unwrap(), 1);
        let stats = writer.stats();
        assert_eq!(stats.total_processed, 1);
        assert_eq!(stats.failed, 0);
    }

    #[test]
    fn duplicate_message_id_is_ignored_not_errored() {
        let mut writer = test_writer();
        let msg = MessageEvent {
            packet_id: 42,
            from_id: NodeId::from_node_num(1),
            to_id: BROADCAST_TO_ID.to_string(),
            channel: 0,
            text: "hi".to_string(),
            timestamp: 0,
            snr: None,
            rssi: None,
            hops_away: None,
            reply_to: None,
        };
        writer.add(ProcessedEvent::Message(msg.clone()));
        writer.flush().unwrap();
        writer.add(ProcessedEvent::Message(msg));
        writer.flush().unwrap();
        assert_eq!(writer.stats().failed, 0);
    }

    #[test]
    fn node_identity_upsert_is_idempotent_and_monotonic() {
        let mut writer = test_writer();
        let node = NodeEvent {
            id: NodeId::from_node_num(7),
            node_num: 7,
            short_name: Some("N7".to_string()),
            long_name: Some("Node Seven".to_string()),
            hw_model: Some(HwModel::TBeam),
            role: Some(NodeRole::Client),
            last_heard: 1000,
            snr: Some(5.0),
            rssi: Some(-80),
            hops_away: Some(1),
        };
        writer.add(ProcessedEvent::Node(node.clone()));
        writer.flush().unwrap();
        writer.add(ProcessedEvent::Node(node));
        writer.flush().unwrap();
        assert_eq!(writer.node_count().unwrap(), 1);
    }

    #[test]
    fn retention_sweep_removes_old_rows() {
        let mut writer = test_writer();
        writer.add(ProcessedEvent::Position(PositionEvent {
            node_id: NodeId::from_node_num(1),
            node_num: 1,
            latitude: 1.0,
            longitude: 1.0,
            altitude: None,
            precision_bits: None,
            timestamp: 0, // far in the past relative to now_ms()
            snr: None,
            rssi: None,
        }));
        writer.flush().unwrap();
        let removed = writer.retention_sweep().unwrap();
        assert_eq!(removed, 1);
    }

    #[test]
    fn healthy_when_buffer_below_90_percent_and_no_slow_batch() {
        let writer = test_writer();
        assert!(writer.is_healthy());
    }

    #[test]
    fn out_of_range_coordinates_are_dropped_silently() {
        let mut writer = test_writer();
        writer.add(ProcessedEvent::Position(PositionEvent {
            node_id: NodeId::from_node_num(1),
            node_num: 1,
            latitude: 999.0,
            longitude: 1.0,
            altitude: None,
            precision_bits: None,
            timestamp: 0,
            snr: None,
            rssi: None,
        }));
        writer.flush().unwrap();
        let count: i64 = writer
            .conn
            .query_row("SELECT COUNT(*) FROM positions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
