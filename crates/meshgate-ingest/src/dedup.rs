//! Deduplicator — content-hash keys with a time-windowed membership set.
//!
//! A ring buffer of `(hash, inserted_at)` backs eviction; a `HashSet<u64>`
//! backs the O(1) membership check. Both structures are owned by the
//! broker-receive task only (§5: no cross-task concurrent access), so this
//! type is plain and un-synchronized — wrap it in a mutex only if a caller
//! genuinely needs to share it across tasks.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use meshgate_core::domain::NodeId;

/// Default dedupe window: 60 seconds.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Stable per-type keys the spec defines (§4.D). Each produces a distinct
/// hash space even for colliding field values across types.
pub enum DedupKey<'a> {
    NodeIdentity {
        id: &'a NodeId,
        hw_model: u32,
        role: u32,
    },
    Position {
        id: &'a NodeId,
        latitude: f64,
        longitude: f64,
    },
    Telemetry {
        id: &'a NodeId,
        timestamp_ms: i64,
    },
    Message {
        packet_id: u32,
    },
}

impl DedupKey<'_> {
    fn stable_string(&self) -> String {
        match self {
            DedupKey::NodeIdentity { id, hw_model, role } => {
                format!("nodeinfo:{id}:{hw_model}:{role}")
            }
            DedupKey::Position {
                id,
                latitude,
                longitude,
            } => {
                let lat = (latitude * 1e3).round() / 1e3;
                let lon = (longitude * 1e3).round() / 1e3;
                format!("position:{id}:{lat}:{lon}")
            }
            DedupKey::Telemetry { id, timestamp_ms } => {
                let floored = (timestamp_ms / 10_000) * 10_000;
                format!("telemetry:{id}:{floored}")
            }
            DedupKey::Message { packet_id } => format!("message:{packet_id}"),
        }
    }

    fn hash(&self) -> u64 {
        // blake3 over the stable string — deterministic across processes,
        // unlike std's randomized SipHash default, which matters for tests
        // asserting on the same key producing the same hash. Truncated to
        // the first 8 bytes; the dedupe set only needs collision resistance
        // within a 60s window, not cryptographic strength.
        let s = self.stable_string();
        let digest = blake3::hash(s.as_bytes());
        u64::from_be_bytes(digest.as_bytes()[..8].try_into().unwrap())
    }
}

pub struct Deduplicator {
    window: Duration,
    capacity: usize,
    seen: HashSet<u64>,
    order: VecDeque<(u64, Instant)>,
    pub deduplicated_count: u64,
}

impl Deduplicator {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity,
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            deduplicated_count: 0,
        }
    }

    pub fn with_defaults(queue_capacity: usize) -> Self {
        Self::new(DEFAULT_WINDOW, queue_capacity * 2)
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some((hash, inserted_at)) = self.order.front() {
            if now.duration_since(*inserted_at) > self.window {
                let (hash, _) = self.order.pop_front().unwrap();
                self.seen.remove(&hash);
            } else {
                let _ = hash;
                break;
            }
        }
        // Capacity is a backstop in case the window alone lets the set grow
        // unbounded under a flood; evict oldest entries past capacity too.
        while self.order.len() > self.capacity {
            if let Some((hash, _)) = self.order.pop_front() {
                self.seen.remove(&hash);
            }
        }
    }

    /// Check-and-insert: returns `true` if this is the first time the key
    /// has been seen within the window (admit), `false` if it's a
    /// duplicate (drop, already counted).
    pub fn check_and_insert(&mut self, key: &DedupKey) -> bool {
        let now = Instant::now();
        self.evict_expired(now);

        let hash = key.hash();
        if self.seen.contains(&hash) {
            self.deduplicated_count += 1;
            return false;
        }
        self.seen.insert(hash);
        self.order.push_back((hash, now));
        true
    }
}

/// Opaque queue id attached to each admitted event for queue-level
/// tracking: `<16-hex of hash>-<ms timestamp>-<7-char random>`.
pub fn make_queue_id(key: &DedupKey) -> String {
    let hash = key.hash();
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let suffix: String = {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
        (0..7).map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char).collect()
    };
    format!("{hash:016x}-{millis}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_rejects_duplicate_message() {
        let mut dedup = Deduplicator::new(DEFAULT_WINDOW, 100);
        let key = DedupKey::Message { packet_id: 42 };
        assert!(dedup.check_and_insert(&key));
        assert!(!dedup.check_and_insert(&key));
        assert!(!dedup.check_and_insert(&key));
        assert_eq!(dedup.deduplicated_count, 2);
    }

    #[test]
    fn dedupe_window_expires_entries() {
        let mut dedup = Deduplicator::new(Duration::from_millis(20), 100);
        let key = DedupKey::Message { packet_id: 1 };
        assert!(dedup.check_and_insert(&key));
        std::thread::sleep(Duration::from_millis(40));
        assert!(dedup.check_and_insert(&key), "entry should have expired");
    }

    #[test]
    fn position_key_rounds_to_1e3() {
        let id = NodeId::from_node_num(1);
        let a = DedupKey::Position {
            id: &id,
            latitude: 37.77801,
            longitude: -122.44002,
        };
        let b = DedupKey::Position {
            id: &id,
            latitude: 37.77804,
            longitude: -122.44001,
        };
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn telemetry_key_floors_to_10s() {
        let id = NodeId::from_node_num(1);
        let a = DedupKey::Telemetry {
            id: &id,
            timestamp_ms: 1_700_000_004_000,
        };
        let b = DedupKey::Telemetry {
            id: &id,
            timestamp_ms: 1_700_000_009_999,
        };
        assert_eq!(a.hash(), b.hash());
        let c = DedupKey::Telemetry {
            id: &id,
            timestamp_ms: 1_700_000_010_000,
        };
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn queue_id_has_expected_shape() {
        let key = DedupKey::Message { packet_id: 7 };
        let id = make_queue_id(&key);
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 16);
        assert_eq!(parts[2].len(), 7);
    }

    #[test]
    fn capacity_evicts_oldest_regardless_of_window() {
        let mut dedup = Deduplicator::new(Duration::from_secs(3600), 2);
        for i in 0..5u32 {
            let key = DedupKey::Message { packet_id: i };
            assert!(dedup.check_and_insert(&key));
        }
        assert!(dedup.order.len() <= 2);
    }
}
