//! meshgate-ingest — the classification and admission pipeline between the
//! broker connection and the batch writer: topic parsing, decryption,
//! structural decode, deduplication, rate limiting, and priority queueing.

pub mod channel_index;
pub mod classify;
pub mod dedup;
pub mod queue;
pub mod ratelimit;
pub mod topic;

pub use channel_index::{ChannelIndexStore, InMemoryChannelIndex};
pub use classify::{ClassifyError, Classifier, KeyRing};
pub use dedup::{DedupKey, Deduplicator};
pub use queue::{Priority, PriorityQueue, QueueStats, QueuedEvent};
pub use ratelimit::{Admission, RateLimiter};
pub use topic::{parse_topic, ChannelType, ParsedTopic};
