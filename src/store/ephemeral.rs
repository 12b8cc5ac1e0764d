//! Ephemeral Store - in-process memory tier
//!
//! Fastest tier, lost on restart. Bounded by entry count: writing a new key
//! into a full store first evicts the oldest-written fifth of the entries,
//! lowest priority band first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use super::{select_victims, IndexEntry, TierStats, TierStore};
use crate::config::{eviction_batch, StoreConfig};
use crate::entry::{CacheEntry, CacheKey};
use crate::policy::TierKind;

/// In-memory tier
pub struct EphemeralStore {
    /// Stored entries
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    /// Maximum entries
    capacity: usize,
    /// Share of entries evicted per pass
    eviction_fraction: f64,
    /// Current size in bytes
    current_bytes: AtomicU64,
    /// Hit count
    hits: AtomicU64,
    /// Miss count
    misses: AtomicU64,
    /// Eviction count
    evictions: AtomicU64,
}

impl EphemeralStore {
    /// Create a store holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self::with_eviction_fraction(capacity, StoreConfig::default().eviction_fraction)
    }

    /// Create from store configuration
    pub fn from_config(config: &StoreConfig) -> Self {
        Self::with_eviction_fraction(config.ephemeral_capacity, config.eviction_fraction)
    }

    fn with_eviction_fraction(capacity: usize, eviction_fraction: f64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            eviction_fraction,
            current_bytes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Check if the store holds a key
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Get capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stored keys
    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries.read().keys().cloned().collect()
    }

    /// Write time of the stored entry, without counting a hit
    pub fn written_at(&self, key: &CacheKey) -> Option<DateTime<Utc>> {
        self.entries.read().get(key).map(|e| e.written_at)
    }

    /// Store `entry` unless a newer write for the key is already held.
    /// The check and the insert happen under one write lock.
    pub fn set_if_newer(&self, key: &CacheKey, entry: CacheEntry) -> bool {
        let mut entries = self.entries.write();
        if entries
            .get(key)
            .is_some_and(|stored| stored.written_at > entry.written_at)
        {
            return false;
        }
        self.insert_locked(&mut entries, key, entry);
        true
    }

    /// Insert, evicting first if a new key would overfill the store;
    /// caller holds the write lock
    fn insert_locked(
        &self,
        entries: &mut HashMap<CacheKey, CacheEntry>,
        key: &CacheKey,
        entry: CacheEntry,
    ) {
        let size = entry.size_bytes;
        if !entries.contains_key(key) && entries.len() >= self.capacity {
            self.evict(entries);
        }

        match entries.insert(key.clone(), entry) {
            Some(old) => {
                if size > old.size_bytes {
                    self.current_bytes
                        .fetch_add(size - old.size_bytes, Ordering::Relaxed);
                } else {
                    self.current_bytes
                        .fetch_sub(old.size_bytes - size, Ordering::Relaxed);
                }
            }
            None => {
                self.current_bytes.fetch_add(size, Ordering::Relaxed);
            }
        }
    }

    /// Evict one batch; caller holds the write lock
    fn evict(&self, entries: &mut HashMap<CacheKey, CacheEntry>) {
        let batch = eviction_batch(self.capacity, self.eviction_fraction);
        let index: Vec<(CacheKey, IndexEntry)> = entries
            .iter()
            .map(|(k, e)| (k.clone(), IndexEntry::of(e, e.size_bytes)))
            .collect();
        let victims = select_victims(index.iter().map(|(k, m)| (k, m)), batch);

        for key in &victims {
            if let Some(removed) = entries.remove(key) {
                self.current_bytes
                    .fetch_sub(removed.size_bytes, Ordering::Relaxed);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        debug!(evicted = victims.len(), "Ephemeral store eviction pass");
    }
}

impl TierStore for EphemeralStore {
    fn tier(&self) -> TierKind {
        TierKind::Ephemeral
    }

    fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.read().get(key).cloned();
        match entry {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        entry
    }

    fn set(&self, key: &CacheKey, entry: CacheEntry) {
        let mut entries = self.entries.write();
        self.insert_locked(&mut entries, key, entry);
    }

    fn remove(&self, key: &CacheKey) -> bool {
        match self.entries.write().remove(key) {
            Some(removed) => {
                self.current_bytes
                    .fetch_sub(removed.size_bytes, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    fn clear(&self) {
        let mut entries = self.entries.write();
        entries.clear();
        self.current_bytes.store(0, Ordering::Relaxed);
    }

    fn stats(&self) -> TierStats {
        TierStats {
            tier: TierKind::Ephemeral,
            count: self.len(),
            approx_bytes: self.current_bytes.load(Ordering::Relaxed),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            dropped_writes: 0,
        }
    }
}

impl Default for EphemeralStore {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================
