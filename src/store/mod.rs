//! Three-Tier Store
//!
//! Storage backends the orchestrator writes through. Stores only store and
//! retrieve; validity is judged by the orchestrator.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          Cache Orchestrator                              │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  EphemeralStore       │ DurableKeyStore      │ DurableBulkStore          │
//! │  ┌────────────────┐   │ ┌────────────────┐   │ ┌────────────────────┐    │
//! │  │ HashMap        │   │ │ KeyValueBackend│   │ │ BulkBackend        │    │
//! │  │ (sync, memory) │   │ │ (sync, durable)│   │ │ (async, durable)   │    │
//! │  │ lost on exit   │   │ │ small records  │   │ │ large payloads     │    │
//! │  └────────────────┘   │ └────────────────┘   │ └────────────────────┘    │
//! │                                                                          │
//! │        Eviction: lowest priority band first, oldest written first        │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Durable tiers degrade instead of failing: storage errors are logged and
//! counted, and the operation behaves as a miss or a dropped write.

mod bulk;
mod durable_key;
mod ephemeral;

pub use bulk::{
    BulkBackend, BulkBackendStats, DurableBulkStore, FsBulkBackend, InMemoryBulkBackend,
};
pub use durable_key::{
    DurableKeyStore, FileKeyValueBackend, KeyValueBackend, MemoryKeyValueBackend,
};
pub use ephemeral::EphemeralStore;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::entry::{CacheEntry, CacheKey, Priority};
use crate::policy::TierKind;

/// Synchronous tier contract
pub trait TierStore: Send + Sync {
    /// Which tier this is
    fn tier(&self) -> TierKind;

    /// Fetch the stored entry, if any
    fn get(&self, key: &CacheKey) -> Option<CacheEntry>;

    /// Store an entry, evicting if the tier is full
    fn set(&self, key: &CacheKey, entry: CacheEntry);

    /// Remove an entry; returns whether it was present
    fn remove(&self, key: &CacheKey) -> bool;

    /// Drop every entry
    fn clear(&self);

    /// Current statistics
    fn stats(&self) -> TierStats;
}

/// Per-tier statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierStats {
    /// Tier
    pub tier: TierKind,
    /// Number of entries
    pub count: usize,
    /// Approximate stored bytes
    pub approx_bytes: u64,
    /// Entry capacity
    pub capacity: usize,
    /// Reads that found an entry
    pub hits: u64,
    /// Reads that found nothing
    pub misses: u64,
    /// Entries removed to make room
    pub evictions: u64,
    /// Writes dropped after a storage failure
    pub dropped_writes: u64,
}

/// Eviction bookkeeping for one stored entry
#[derive(Debug, Clone, Copy)]
pub(crate) struct IndexEntry {
    pub size_bytes: u64,
    pub written_at: DateTime<Utc>,
    pub priority: Priority,
}

impl IndexEntry {
    pub fn of(entry: &CacheEntry, size_bytes: u64) -> Self {
        Self {
            size_bytes,
            written_at: entry.written_at,
            priority: entry.priority,
        }
    }

    fn eviction_key(&self) -> (std::cmp::Reverse<u8>, DateTime<Utc>) {
        (
            std::cmp::Reverse(self.priority.eviction_band()),
            self.written_at,
        )
    }
}

/// Pick `count` victims: lowest priority band first, oldest first within it
pub(crate) fn select_victims<'a, I>(entries: I, count: usize) -> Vec<CacheKey>
where
    I: IntoIterator<Item = (&'a CacheKey, &'a IndexEntry)>,
{
    let mut candidates: Vec<_> = entries
        .into_iter()
        .map(|(key, meta)| (meta.eviction_key(), key))
        .collect();
    candidates.sort();
    candidates
        .into_iter()
        .take(count)
        .map(|(_, key)| key.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::HashMap;

    #[test]
    fn test_select_victims_order() {
        let now = Utc::now();
        let mut index = HashMap::new();
        let mut add = |name: &str, priority, age_mins| {
            index.insert(
                CacheKey::new(name),
                IndexEntry {
                    size_bytes: 1,
                    written_at: now - Duration::minutes(age_mins),
                    priority,
                },
            );
        };
        add("critical-old", Priority::Critical, 100);
        add("low-new", Priority::Low, 1);
        add("low-old", Priority::Low, 50);
        add("medium-old", Priority::Medium, 90);

        let victims = select_victims(&index, 3);
        assert_eq!(
            victims,
            vec![
                CacheKey::new("low-old"),
                CacheKey::new("low-new"),
                CacheKey::new("medium-old"),
            ]
        );
    }
}
