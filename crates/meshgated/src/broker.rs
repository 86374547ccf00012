//! Broker client (§4.I) — one `rumqttc` session, subscribed to the
//! configured topic pattern, feeding every delivery through the
//! classify → dedupe → rate-limit → enqueue pipeline inline on the
//! broker-receive task (§5: this task never blocks on the database).
//!
//! `rumqttc`'s `EventLoop::poll` already retries the underlying connection
//! on error; this loop just logs and keeps polling, rather than tearing
//! anything down, so reconnection is transparent to callers.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS, Transport};
use tokio::sync::broadcast;

use meshgate_core::broadcast::Broadcaster;
use meshgate_core::config::BrokerConfig;
use meshgate_core::domain::{NodeId, ProcessedEvent};
use meshgate_core::metrics::Metrics;

use meshgate_ingest::channel_index::InMemoryChannelIndex;
use meshgate_ingest::{Classifier, DedupKey, Deduplicator, PriorityQueue, RateLimiter};
use meshgate_ingest::ratelimit::Admission;

/// Parsed `(host, port)` from a `scheme://host:port` broker URL. Falls back
/// to the scheme's conventional port when none is given.
fn parse_broker_url(url: &str) -> anyhow::Result<(String, u16)> {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let host_port = without_scheme.split('/').next().unwrap_or(without_scheme);
    match host_port.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), port.parse()?)),
        None => Ok((host_port.to_string(), 1883)),
    }
}

fn build_options(config: &BrokerConfig) -> anyhow::Result<MqttOptions> {
    let (host, port) = parse_broker_url(&config.url)?;
    let mut options = MqttOptions::new(config.client_id.clone(), host, port);
    options.set_keep_alive(Duration::from_secs(60));
    if let (Some(user), Some(pass)) = (&config.username, &config.password) {
        options.set_credentials(user.clone(), pass.clone());
    }
    if config.use_tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    Ok(options)
}

pub struct BrokerHandle {
    pub client: AsyncClient,
    pub connected: Arc<AtomicBool>,
    pub last_message_at: Arc<AtomicI64>,
}

impl BrokerHandle {
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        self.client.publish(topic, QoS::AtLeastOnce, false, payload).await?;
        Ok(())
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn dedup_key_for<'a>(event: &'a ProcessedEvent) -> Option<DedupKey<'a>> {
    match event {
        ProcessedEvent::Node(n) => Some(DedupKey::NodeIdentity {
            id: &n.id,
            hw_model: n.hw_model.map(hw_model_wire_code).unwrap_or(0),
            role: n.role.map(node_role_wire_code).unwrap_or(0),
        }),
        ProcessedEvent::Position(p) => Some(DedupKey::Position {
            id: &p.node_id,
            latitude: p.latitude,
            longitude: p.longitude,
        }),
        ProcessedEvent::Telemetry(t) => Some(DedupKey::Telemetry {
            id: &t.node_id,
            timestamp_ms: t.timestamp,
        }),
        ProcessedEvent::Message(m) => Some(DedupKey::Message { packet_id: m.packet_id }),
        // Traceroute and mqtt_raw have no dedicated dedup key (§4.D names four kinds).
        ProcessedEvent::Traceroute(_) | ProcessedEvent::MqttRaw(_) => None,
    }
}

/// Inverse of `HwModel::from_wire` — recovers the wire code so the dedupe
/// key matches across repeated deliveries of the same identity.
fn hw_model_wire_code(m: meshgate_core::domain::HwModel) -> u32 {
    use meshgate_core::domain::HwModel;
    match m {
        HwModel::Unset => 0,
        HwModel::TLora => 2,
        HwModel::TBeam => 4,
        HwModel::Heltec => 5,
        HwModel::RakWisblock => 25,
        HwModel::Station => 43,
        HwModel::Other(n) => n,
    }
}

fn node_role_wire_code(r: meshgate_core::domain::NodeRole) -> u32 {
    use meshgate_core::domain::NodeRole;
    match r {
        NodeRole::Client => 0,
        NodeRole::ClientMute => 1,
        NodeRole::Router => 2,
        NodeRole::RouterClient => 3,
        NodeRole::Repeater => 4,
        NodeRole::Tracker => 5,
        NodeRole::Sensor => 6,
        NodeRole::Other(n) => n,
    }
}

/// Spawn the broker connection and return a handle plus the event loop to
/// drive. Split so `main` can wire the handle into `ApiState`/health before
/// handing the event loop to `run_receive_loop`.
pub fn connect(config: &BrokerConfig) -> anyhow::Result<(BrokerHandle, EventLoop)> {
    let options = build_options(config)?;
    let (client, eventloop) = AsyncClient::new(options, 256);
    let handle = BrokerHandle {
        client,
        connected: Arc::new(AtomicBool::new(false)),
        last_message_at: Arc::new(AtomicI64::new(0)),
    };
    Ok((handle, eventloop))
}

#[allow(clippy::too_many_arguments)]
pub async fn run_receive_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topic_pattern: String,
    reconnect_period: Duration,
    channel_store: Arc<InMemoryChannelIndex>,
    classifier: Classifier<InMemoryChannelIndex>,
    queue: Arc<Mutex<PriorityQueue>>,
    broadcaster: Arc<Broadcaster>,
    metrics: Arc<Metrics>,
    connected: Arc<AtomicBool>,
    last_message_at: Arc<AtomicI64>,
    dedupe_window: Duration,
    rate_limit_window_ms: u64,
    rate_limit_max_per_window: u32,
    mut shutdown: broadcast::Receiver<()>,
) {
    let _ = channel_store; // owned by `classifier`; kept alive by the caller
    let mut dedup = Deduplicator::new(dedupe_window, meshgate_ingest::queue::DEFAULT_CAPACITY * 2);
    let rate_limiter = RateLimiter::new(rate_limit_window_ms, rate_limit_max_per_window);
    let mut gc_tick = tokio::time::interval(Duration::from_secs(5 * 60));
    gc_tick.tick().await;

    loop {
        tokio::select! {
            _ = gc_tick.tick() => {
                rate_limiter.gc_idle();
            }
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        connected.store(true, Ordering::Relaxed);
                        tracing::info!(topic = %topic_pattern, "broker connected, subscribing");
                        if let Err(err) = client.subscribe(&topic_pattern, QoS::AtLeastOnce).await {
                            tracing::error!(error = %err, "subscribe failed");
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        last_message_at.store(now_ms(), Ordering::Relaxed);
                        handle_publish(
                            &publish.topic,
                            &publish.payload,
                            &classifier,
                            &mut dedup,
                            &rate_limiter,
                            &queue,
                            &broadcaster,
                            &metrics,
                        ).await;
                    }
                    Ok(Event::Incoming(Incoming::Disconnect)) => {
                        connected.store(false, Ordering::Relaxed);
                        tracing::warn!("broker disconnected");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        connected.store(false, Ordering::Relaxed);
                        Metrics::incr(&metrics.transport_errors);
                        tracing::warn!(error = %err, "broker connection error, retrying");
                        tokio::time::sleep(reconnect_period).await;
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("broker-receive task stopping");
                break;
            }
        }
    }
}

/// Classify one delivery and drive it through dedupe, rate-limit, and
/// admission into the shared priority queue. `mqtt_raw` diagnostics bypass
/// all three and go straight to the broadcaster (§4.C: "surface... as an
/// mqtt_raw diagnostic event; do not propagate further"). Everything else
/// is hung off to the queue-drain task, which alone calls the writer and
/// broadcaster for admitted events (§4.K).
async fn handle_publish(
    topic: &str,
    payload: &[u8],
    classifier: &Classifier<InMemoryChannelIndex>,
    dedup: &mut Deduplicator,
    rate_limiter: &RateLimiter,
    queue: &Arc<Mutex<PriorityQueue>>,
    broadcaster: &Arc<Broadcaster>,
    metrics: &Arc<Metrics>,
) {
    for event in classifier.classify(topic, payload) {
        if let ProcessedEvent::MqttRaw(raw) = event {
            broadcaster.dispatch(ProcessedEvent::MqttRaw(raw));
            continue;
        }

        if let Some(key) = dedup_key_for(&event) {
            if !dedup.check_and_insert(&key) {
                Metrics::incr(&metrics.duplicate_count);
                continue;
            }
        }

        let source = event
            .source_node_id()
            .map(NodeId::as_str)
            .unwrap_or("unknown")
            .to_string();
        if let Admission::Denied { .. } = rate_limiter.check(&source) {
            Metrics::incr(&metrics.rate_limited_count);
            continue;
        }

        let queue_id = uuid_like_id();
        let admitted = {
            let mut q = queue.lock().unwrap();
            q.enqueue(queue_id, event, None)
        };
        if !admitted {
            Metrics::incr(&metrics.overflow_errors);
        }
    }
}

/// Lightweight id generator for `PriorityQueue`'s `queue_id`, independent of
/// the dedupe hash (events with no dedup key, like traceroutes, still need
/// one). Same shape as `dedup::make_queue_id` without requiring a key.
fn uuid_like_id() -> String {
    use rand::Rng;
    let millis = now_ms();
    let mut rng = rand::thread_rng();
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let suffix: String = (0..12).map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char).collect();
    format!("{millis}-{suffix}")
}
