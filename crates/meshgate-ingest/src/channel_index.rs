//! Learned channel-name → index mapping (§4.C, §9's "callback-based
//! channel-mapping persistence" redesign). The classifier depends on the
//! `ChannelIndexStore` trait, not a concrete type, so the supervisor can
//! swap in a DB-backed implementation without the classifier knowing.

use dashmap::DashMap;
use meshgate_core::domain::{Channel, ChannelRole};
use std::sync::Arc;

pub const MAX_CHANNEL_INDEX: u8 = 7;

pub trait ChannelIndexStore: Send + Sync {
    /// Resolve a channel name to its learned index, assigning the next
    /// unused index (≤ 7) if this is the first time the name is observed.
    /// Returns `None` if all 8 slots are already assigned to other names.
    fn resolve(&self, name: &str) -> Option<u8>;

    fn snapshot(&self) -> Vec<Channel>;
}

/// Default in-memory implementation, grounded on `summit_services`'s
/// `DashMap`-per-registry pattern (`PeerRegistry`, `MessageStore`).
#[derive(Default)]
pub struct InMemoryChannelIndex {
    by_name: DashMap<String, Channel>,
}

impl InMemoryChannelIndex {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn now_ms() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

impl ChannelIndexStore for InMemoryChannelIndex {
    fn resolve(&self, name: &str) -> Option<u8> {
        if let Some(mut existing) = self.by_name.get_mut(name) {
            existing.last_seen = Self::now_ms();
            return Some(existing.index);
        }

        let used: std::collections::HashSet<u8> =
            self.by_name.iter().map(|e| e.value().index).collect();
        let next = (0..=MAX_CHANNEL_INDEX).find(|i| !used.contains(i))?;

        let role = if self.by_name.is_empty() {
            ChannelRole::Primary
        } else {
            ChannelRole::Secondary
        };

        self.by_name.insert(
            name.to_string(),
            Channel {
                index: next,
                name: name.to_string(),
                role,
                has_key: true,
                last_seen: Self::now_ms(),
            },
        );
        Some(next)
    }

    fn snapshot(&self) -> Vec<Channel> {
        self.by_name.iter().map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_name_gets_next_free_index() {
        let store = InMemoryChannelIndex::new();
        assert_eq!(store.resolve("LongFast"), Some(0));
        assert_eq!(store.resolve("admin"), Some(1));
        assert_eq!(store.resolve("LongFast"), Some(0));
    }

    #[test]
    fn first_channel_is_primary_rest_secondary() {
        let store = InMemoryChannelIndex::new();
        store.resolve("LongFast");
        store.resolve("admin");
        let snap = store.snapshot();
        let primary = snap.iter().find(|c| c.name == "LongFast").unwrap();
        let secondary = snap.iter().find(|c| c.name == "admin").unwrap();
        assert_eq!(primary.role, ChannelRole::Primary);
        assert_eq!(secondary.role, ChannelRole::Secondary);
    }

    #[test]
    fn exhausts_after_eight_channels() {
        let store = InMemoryChannelIndex::new();
        for i in 0..8 {
            assert!(store.resolve(&format!("ch{i}")).is_some());
        }
        assert_eq!(store.resolve("ch8"), None);
    }
}
