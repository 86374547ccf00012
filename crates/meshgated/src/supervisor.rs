//! Health supervisor (§4.K, §7) — computes the `/health` verdict from the
//! same atomics the broker and writer tasks already maintain. Queried
//! fresh on every request rather than polled into a cache.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use meshgate_api::health::{Health, HealthSource, HealthStatus};
use meshgate_ingest::PriorityQueue;
use meshgate_store::WriterStats;

const STALE_AFTER: Duration = Duration::from_secs(5 * 60);
const WRITER_LATENCY_BUDGET: Duration = Duration::from_millis(200);

pub struct Supervisor {
    pub queue: Arc<Mutex<PriorityQueue>>,
    pub queue_capacity: usize,
    pub broker_connected: Arc<AtomicBool>,
    pub last_message_at: Arc<AtomicI64>,
    pub writer_stats: Arc<RwLock<WriterStats>>,
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl HealthSource for Supervisor {
    fn current(&self) -> HealthStatus {
        let mut issues = Vec::new();
        let mut worst = Health::Healthy;

        let depth = {
            let q = self.queue.lock().unwrap();
            q.stats().total
        };
        if self.queue_capacity > 0 && depth * 10 >= self.queue_capacity * 9 {
            issues.push(format!("priority queue at {depth}/{} capacity", self.queue_capacity));
            worst = Health::Degraded;
        }

        if !self.broker_connected.load(Ordering::Relaxed) {
            issues.push("broker disconnected".to_string());
            worst = worst.max(Health::Degraded);
        }

        let last = self.last_message_at.load(Ordering::Relaxed);
        if last > 0 {
            let age_ms = now_ms() - last;
            if age_ms > STALE_AFTER.as_millis() as i64 {
                issues.push(format!("no messages received in {}s", age_ms / 1000));
                worst = worst.max(Health::Degraded);
            }
        }

        let stats = *self.writer_stats.read().unwrap();
        if stats.batch_count > 0 && stats.last_batch_latency > WRITER_LATENCY_BUDGET {
            issues.push(format!(
                "writer batch latency {}ms over budget",
                stats.last_batch_latency.as_millis()
            ));
            worst = worst.max(Health::Degraded);
        }
        if stats.failed > 0 {
            issues.push(format!("{} failed write batches", stats.failed));
            worst = worst.max(Health::Degraded);
        }

        HealthStatus { status: worst, issues }
    }
}

impl Health {
    fn max(self, other: Health) -> Health {
        use Health::*;
        match (self, other) {
            (Unhealthy, _) | (_, Unhealthy) => Unhealthy,
            (Degraded, _) | (_, Degraded) => Degraded,
            _ => Healthy,
        }
    }
}
