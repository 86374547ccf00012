//! Rate limiter — per-source sliding window admission.
//!
//! Grounded on the teacher's `TokenBucket` (same crate-free,
//! `std::time::Instant`-based, single-struct-per-source shape) but
//! implements a sliding log instead of a refill bucket: §4.E's admission
//! rule is a window-count rule (`count < max_per_window`), not a refill
//! rate, so a bucket would need to be reparameterized to fake it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;

pub const DEFAULT_WINDOW_MS: u64 = 1_000;
pub const DEFAULT_MAX_PER_WINDOW: u32 = 1;
const GC_IDLE_AFTER: Duration = Duration::from_secs(5 * 60);

/// Outcome of a rate-limit check. Not an error — callers branch on this
/// directly (§9's "avoid ad-hoc nullable returns" redesign note).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Admitted,
    Denied { time_until_next: Duration },
}

struct SourceWindow {
    admits: VecDeque<Instant>,
    last_touched: Instant,
}

pub struct RateLimiter {
    window: Duration,
    max_per_window: u32,
    sources: DashMap<String, SourceWindow>,
}

impl RateLimiter {
    pub fn new(window_ms: u64, max_per_window: u32) -> Self {
        Self {
            window: Duration::from_millis(window_ms),
            max_per_window,
            sources: DashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_WINDOW_MS, DEFAULT_MAX_PER_WINDOW)
    }

    /// Check admission for `source` and, if admitted, record it.
    pub fn check(&self, source: &str) -> Admission {
        let now = Instant::now();
        let mut entry = self
            .sources
            .entry(source.to_string())
            .or_insert_with(|| SourceWindow {
                admits: VecDeque::new(),
                last_touched: now,
            });
        entry.last_touched = now;

        while let Some(front) = entry.admits.front() {
            if now.duration_since(*front) > self.window {
                entry.admits.pop_front();
            } else {
                break;
            }
        }

        if (entry.admits.len() as u32) < self.max_per_window {
            entry.admits.push_back(now);
            Admission::Admitted
        } else {
            let oldest = *entry.admits.front().unwrap();
            let next_allowed = oldest + self.window;
            let time_until_next = next_allowed.saturating_duration_since(now);
            Admission::Denied { time_until_next }
        }
    }

    /// Drop sources that haven't admitted anything in 5 minutes.
    pub fn gc_idle(&self) {
        let now = Instant::now();
        self.sources
            .retain(|_, window| now.duration_since(window.last_touched) < GC_IDLE_AFTER);
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_first_then_denies_within_window() {
        let limiter = RateLimiter::new(1_000, 1);
        assert_eq!(limiter.check("node-a"), Admission::Admitted);
        match limiter.check("node-a") {
            Admission::Denied { time_until_next } => {
                assert!(time_until_next <= Duration::from_millis(1_000));
            }
            Admission::Admitted => panic!("second admit within window should be denied"),
        }
    }

    #[test]
    fn different_sources_are_independent() {
        let limiter = RateLimiter::new(1_000, 1);
        assert_eq!(limiter.check("a"), Admission::Admitted);
        assert_eq!(limiter.check("b"), Admission::Admitted);
    }

    #[test]
    fn admits_again_after_window_elapses() {
        let limiter = RateLimiter::new(20, 1);
        assert_eq!(limiter.check("a"), Admission::Admitted);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(limiter.check("a"), Admission::Admitted);
    }

    #[test]
    fn max_per_window_greater_than_one() {
        let limiter = RateLimiter::new(1_000, 3);
        assert_eq!(limiter.check("a"), Admission::Admitted);
        assert_eq!(limiter.check("a"), Admission::Admitted);
        assert_eq!(limiter.check("a"), Admission::Admitted);
        assert!(matches!(limiter.check("a"), Admission::Denied { .. }));
    }

    #[test]
    fn ten_events_in_400ms_admits_one_denies_nine() {
        let limiter = RateLimiter::with_defaults();
        let mut admitted = 0;
        let mut denied = 0;
        for _ in 0..10 {
            match limiter.check("flooder") {
                Admission::Admitted => admitted += 1,
                Admission::Denied { .. } => denied += 1,
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(denied, 9);
    }
}
