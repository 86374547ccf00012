//! Priority queue — four bounded levels with admission/eviction by
//! priority. Owned exclusively by the broker-receive task (§5); no locking
//! internally, matching `TokenBucket`'s "no lock needed, one owner" shape.

use meshgate_core::domain::{MessageEvent, ProcessedEvent, TelemetryEvent};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

/// Default priority derivation from an event (§4.F).
pub fn default_priority(event: &ProcessedEvent) -> Priority {
    match event {
        ProcessedEvent::Telemetry(TelemetryEvent {
            battery_level,
            channel_utilization,
            ..
        }) => {
            if battery_level.is_some_and(|b| b < 20) {
                Priority::Critical
            } else if channel_utilization.is_some_and(|u| u > 80.0) {
                Priority::High
            } else {
                Priority::Normal
            }
        }
        ProcessedEvent::Message(MessageEvent { to_id, .. }) => {
            if to_id == meshgate_core::domain::BROADCAST_TO_ID {
                Priority::Normal
            } else {
                Priority::High
            }
        }
        ProcessedEvent::Node(_) => Priority::High,
        ProcessedEvent::Position(_) => Priority::Normal,
        ProcessedEvent::Traceroute(_) | ProcessedEvent::MqttRaw(_) => Priority::Normal,
    }
}

pub struct QueuedEvent {
    pub queue_id: String,
    pub event: ProcessedEvent,
}

pub const DEFAULT_CAPACITY: usize = 10_000;

pub struct PriorityQueue {
    capacity: usize,
    levels: [VecDeque<QueuedEvent>; 4],
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub total: usize,
    pub utilization: f64,
}

impl PriorityQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            levels: [
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
            ],
        }
    }

    fn level_index(priority: Priority) -> usize {
        match priority {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    fn total_len(&self) -> usize {
        self.levels.iter().map(|l| l.len()).sum()
    }

    /// Admit an event at the given priority (or its spec-derived default).
    /// Returns `false` if the queue is full and the event could not be
    /// admitted even after the critical/high eviction policy ran.
    pub fn enqueue(&mut self, queue_id: String, event: ProcessedEvent, priority: Option<Priority>) -> bool {
        let priority = priority.unwrap_or_else(|| default_priority(&event));
        if self.total_len() < self.capacity {
            self.levels[Self::level_index(priority)].push_back(QueuedEvent { queue_id, event });
            return true;
        }

        match priority {
            Priority::Low | Priority::Normal => false,
            Priority::Critical | Priority::High => {
                // Evict one low, then one normal, to make room.
                if self.levels[Self::level_index(Priority::Low)].pop_front().is_some()
                    || self.levels[Self::level_index(Priority::Normal)].pop_front().is_some()
                {
                    self.levels[Self::level_index(priority)]
                        .push_back(QueuedEvent { queue_id, event });
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Dequeue up to `n` events in strict priority order, FIFO within
    /// level.
    pub fn dequeue(&mut self, n: usize) -> Vec<QueuedEvent> {
        let mut out = Vec::with_capacity(n.min(self.total_len()));
        for level in self.levels.iter_mut() {
            while out.len() < n {
                match level.pop_front() {
                    Some(item) => out.push(item),
                    None => break,
                }
            }
            if out.len() >= n {
                break;
            }
        }
        out
    }

    pub fn stats(&self) -> QueueStats {
        let critical = self.levels[0].len();
        let high = self.levels[1].len();
        let normal = self.levels[2].len();
        let low = self.levels[3].len();
        let total = critical + high + normal + low;
        QueueStats {
            critical,
            high,
            normal,
            low,
            total,
            utilization: total as f64 / self.capacity as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_core::domain::{NodeId, TelemetryEvent};

    fn telemetry_event(battery: u32) -> ProcessedEvent {
        ProcessedEvent::Telemetry(TelemetryEvent {
            node_id: NodeId::from_node_num(1),
            node_num: 1,
            timestamp: 0,
            battery_level: Some(battery),
            voltage: None,
            channel_utilization: None,
            air_util_tx: None,
            uptime_seconds: None,
            temperature: None,
            snr: None,
            rssi: None,
        })
    }

    #[test]
    fn priority_ordering_strict_and_fifo_within_level() {
        let mut q = PriorityQueue::new(10);
        q.enqueue("a".into(), telemetry_event(80), None); // normal
        q.enqueue("b".into(), telemetry_event(5), None); // critical
        q.enqueue("c".into(), telemetry_event(80), None); // normal
        q.enqueue("d".into(), telemetry_event(5), None); // critical

        let out = q.dequeue(4);
        assert_eq!(out[0].queue_id, "b");
        assert_eq!(out[1].queue_id, "d");
        assert_eq!(out[2].queue_id, "a");
        assert_eq!(out[3].queue_id, "c");
    }

    #[test]
    fn full_queue_rejects_low_and_normal() {
        let mut q = PriorityQueue::new(2);
        assert!(q.enqueue("1".into(), telemetry_event(80), Some(Priority::Low)));
        assert!(q.enqueue("2".into(), telemetry_event(80), Some(Priority::Low)));
        assert!(!q.enqueue("3".into(), telemetry_event(80), Some(Priority::Low)));
        assert!(!q.enqueue("4".into(), telemetry_event(80), Some(Priority::Normal)));
    }

    #[test]
    fn critical_evicts_low_then_normal_when_full() {
        let mut q = PriorityQueue::new(2);
        assert!(q.enqueue("low".into(), telemetry_event(80), Some(Priority::Low)));
        assert!(q.enqueue("normal".into(), telemetry_event(80), Some(Priority::Normal)));
        assert!(q.enqueue("crit".into(), telemetry_event(5), Some(Priority::Critical)));
        let stats = q.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.critical, 1);
        assert_eq!(stats.low, 0);
    }

    #[test]
    fn priority_preemption_scenario_10000_low_then_one_critical() {
        let mut q = PriorityQueue::new(10_000);
        for i in 0..10_000u32 {
            assert!(q.enqueue(format!("low-{i}"), telemetry_event(80), Some(Priority::Low)));
        }
        assert!(q.enqueue("crit".into(), telemetry_event(5), None));
        let out = q.dequeue(1);
        assert_eq!(out[0].queue_id, "crit");
    }
}
