//! Durable Key Store - small synchronous persistent tier
//!
//! Holds small records (one JSON document per key) that survive restarts.
//!
//! # Design
//!
//! - Pluggable synchronous [`KeyValueBackend`] (directory of files, or memory)
//! - In-memory index of sizes and ages, loaded lazily on first use
//! - Quota failures trigger one eviction pass and a single retry; a write
//!   that still fails is dropped and logged
//! - Unavailable storage degrades to misses and dropped writes

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::{select_victims, IndexEntry, TierStats, TierStore};
use crate::config::{eviction_batch, StoreConfig};
use crate::entry::{CacheEntry, CacheKey};
use crate::error::{Error, Result};
use crate::policy::TierKind;

/// Synchronous string key-value storage
pub trait KeyValueBackend: Send + Sync {
    /// Read a record
    fn read(&self, key: &str) -> Result<Option<String>>;

    /// Write a record, replacing any previous value
    fn write(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a record; deleting a missing record succeeds
    fn delete(&self, key: &str) -> Result<()>;

    /// List stored keys
    fn keys(&self) -> Result<Vec<String>>;

    /// Delete every record
    fn clear(&self) -> Result<()>;
}

// =============================================================================
// Memory backend
// =============================================================================

/// In-memory backend for tests and hosts without persistent storage
#[derive(Default)]
pub struct MemoryKeyValueBackend {
    records: RwLock<BTreeMap<String, String>>,
    quota_bytes: Option<u64>,
    unavailable: AtomicBool,
}

impl MemoryKeyValueBackend {
    /// Create an unbounded backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend refusing writes beyond `quota_bytes` of values
    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::default()
        }
    }

    /// Simulate storage going away (`false`) or coming back (`true`)
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::Relaxed);
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(Error::storage(TierKind::DurableKey, "backend unavailable"));
        }
        Ok(())
    }
}

impl KeyValueBackend for MemoryKeyValueBackend {
    fn read(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        Ok(self.records.read().get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        self.check_available()?;
        let mut records = self.records.write();
        if let Some(quota) = self.quota_bytes {
            let used: u64 = records
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(_, v)| v.len() as u64)
                .sum();
            if used + value.len() as u64 > quota {
                return Err(Error::quota(
                    TierKind::DurableKey,
                    format!("{} + {} bytes over quota of {}", used, value.len(), quota),
                ));
            }
        }
        records.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.records.write().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        self.check_available()?;
        Ok(self.records.read().keys().cloned().collect())
    }

    fn clear(&self) -> Result<()> {
        self.check_available()?;
        self.records.write().clear();
        Ok(())
    }
}

// =============================================================================
// File backend
// =============================================================================

const RECORD_PREFIX: &str = "k-";
const RECORD_SUFFIX: &str = ".json";

/// Directory of JSON files, one per key
///
/// File names are the percent-encoded key, so arbitrary keys are safe.
#[derive(Debug, Clone)]
pub struct FileKeyValueBackend {
    dir: PathBuf,
    quota_bytes: Option<u64>,
}

impl FileKeyValueBackend {
    /// Store records under `dir`; the directory is created on first write
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            quota_bytes: None,
        }
    }

    /// Limit the total size of record files
    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    /// Record directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!(
            "{}{}{}",
            RECORD_PREFIX,
            urlencoding::encode(key),
            RECORD_SUFFIX
        ))
    }

    fn key_for(file_name: &str) -> Option<String> {
        let encoded = file_name
            .strip_prefix(RECORD_PREFIX)?
            .strip_suffix(RECORD_SUFFIX)?;
        urlencoding::decode(encoded).ok().map(|k| k.into_owned())
    }

    fn record_files(&self) -> Result<Vec<(PathBuf, String)>> {
        let dir = match std::fs::read_dir(&self.dir) {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage_error(e)),
        };

        let mut files = Vec::new();
        for item in dir {
            let item = item.map_err(storage_error)?;
            let name = item.file_name();
            if let Some(key) = name.to_str().and_then(Self::key_for) {
                files.push((item.path(), key));
            }
        }
        Ok(files)
    }

    fn used_bytes_excluding(&self, skip: &Path) -> Result<u64> {
        let mut used = 0;
        for (path, _) in self.record_files()? {
            if path != skip {
                used += std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            }
        }
        Ok(used)
    }
}

fn storage_error(e: std::io::Error) -> Error {
    Error::storage(TierKind::DurableKey, e)
}

impl KeyValueBackend for FileKeyValueBackend {
    fn read(&self, key: &str) -> Result<Option<String>> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_error(e)),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(storage_error)?;
        let path = self.path_for(key);

        if let Some(quota) = self.quota_bytes {
            let used = self.used_bytes_excluding(&path)?;
            if used + value.len() as u64 > quota {
                return Err(Error::quota(
                    TierKind::DurableKey,
                    format!("{} + {} bytes over quota of {}", used, value.len(), quota),
                ));
            }
        }

        // Write then rename so a crash never leaves a torn record
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, value).map_err(storage_error)?;
        std::fs::rename(&tmp, &path).map_err(storage_error)
    }

    fn delete(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error(e)),
        }
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.record_files()?.into_iter().map(|(_, k)| k).collect())
    }

    fn clear(&self) -> Result<()> {
        for (path, _) in self.record_files()? {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(storage_error(e)),
            }
        }
        Ok(())
    }
}

// =============================================================================
// Store
// =============================================================================

/// Durable tier for small payloads
pub struct DurableKeyStore {
    /// Record storage
    backend: Arc<dyn KeyValueBackend>,
    /// Maximum entries
    capacity: usize,
    /// Share of entries evicted per pass
    eviction_fraction: f64,
    /// Size and age of stored records, opened on first use
    index: OnceCell<RwLock<HashMap<CacheKey, IndexEntry>>>,
    /// Hit count
    hits: AtomicU64,
    /// Miss count
    misses: AtomicU64,
    /// Eviction count
    evictions: AtomicU64,
    /// Writes lost to storage failures
    dropped_writes: AtomicU64,
}

impl DurableKeyStore {
    /// Create a store over a backend
    pub fn new(backend: Arc<dyn KeyValueBackend>, config: &StoreConfig) -> Self {
        Self {
            backend,
            capacity: config.durable_key_capacity.max(1),
            eviction_fraction: config.eviction_fraction,
            index: OnceCell::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            dropped_writes: AtomicU64::new(0),
        }
    }

    /// Create a memory-backed store
    pub fn in_memory(config: &StoreConfig) -> Self {
        Self::new(Arc::new(MemoryKeyValueBackend::new()), config)
    }

    /// Create a store persisting under `dir`
    pub fn open_dir(dir: impl Into<PathBuf>, config: &StoreConfig) -> Self {
        Self::new(Arc::new(FileKeyValueBackend::new(dir)), config)
    }

    /// Check if the store holds a key
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.index().read().contains_key(key)
    }

    /// Stored keys
    pub fn keys(&self) -> Vec<CacheKey> {
        self.index().read().keys().cloned().collect()
    }

    /// Write time of the stored record
    pub fn written_at(&self, key: &CacheKey) -> Option<DateTime<Utc>> {
        self.index().read().get(key).map(|m| m.written_at)
    }

    fn index(&self) -> &RwLock<HashMap<CacheKey, IndexEntry>> {
        self.index.get_or_init(|| RwLock::new(self.load_index()))
    }

    fn load_index(&self) -> HashMap<CacheKey, IndexEntry> {
        let keys = match self.backend.keys() {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Durable key store unavailable, starting empty");
                return HashMap::new();
            }
        };

        let mut index = HashMap::with_capacity(keys.len());
        for raw_key in keys {
            let raw = match self.backend.read(&raw_key) {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %raw_key, error = %e, "Skipping unreadable record");
                    continue;
                }
            };
            match serde_json::from_str::<CacheEntry>(&raw) {
                Ok(entry) => {
                    index.insert(CacheKey::from(raw_key), IndexEntry::of(&entry, raw.len() as u64));
                }
                Err(e) => {
                    warn!(key = %raw_key, error = %e, "Purging corrupt record");
                    let _ = self.backend.delete(&raw_key);
                }
            }
        }
        debug!(entries = index.len(), "Durable key store opened");
        index
    }

    fn write_record(&self, key: &CacheKey, entry: &CacheEntry, raw: &str) -> Result<()> {
        self.backend.write(key.as_str(), raw)?;
        self.index()
            .write()
            .insert(key.clone(), IndexEntry::of(entry, raw.len() as u64));
        Ok(())
    }

    fn evict(&self) {
        let batch = eviction_batch(self.capacity, self.eviction_fraction);
        let victims = select_victims(self.index().read().iter(), batch);

        for key in &victims {
            if let Err(e) = self.backend.delete(key.as_str()) {
                warn!(key = %key, error = %e, "Failed to evict record");
                continue;
            }
            self.index().write().remove(key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        debug!(evicted = victims.len(), "Durable key store eviction pass");
    }

    fn drop_write(&self, key: &CacheKey, error: &Error) {
        self.dropped_writes.fetch_add(1, Ordering::Relaxed);
        warn!(key = %key, error = %error, "Dropping durable write");
    }
}

impl TierStore for DurableKeyStore {
    fn tier(&self) -> TierKind {
        TierKind::DurableKey
    }

    fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        match self.backend.read(key.as_str()) {
            Ok(Some(raw)) => match serde_json::from_str::<CacheEntry>(&raw) {
                Ok(entry) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    Some(entry)
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Purging corrupt record");
                    self.remove(key);
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    None
                }
            },
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Durable key read failed");
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn set(&self, key: &CacheKey, entry: CacheEntry) {
        let raw = match serde_json::to_string(&entry) {
            Ok(raw) => raw,
            Err(e) => {
                self.drop_write(key, &e.into());
                return;
            }
        };

        let needs_room = {
            let index = self.index().read();
            !index.contains_key(key) && index.len() >= self.capacity
        };
        if needs_room {
            self.evict();
        }

        match self.write_record(key, &entry, &raw) {
            Ok(()) => {}
            Err(e) if e.is_quota() => {
                debug!(key = %key, "Quota exceeded, evicting and retrying once");
                self.evict();
                if let Err(e) = self.write_record(key, &entry, &raw) {
                    self.drop_write(key, &e);
                }
            }
            Err(e) => self.drop_write(key, &e),
        }
    }

    fn remove(&self, key: &CacheKey) -> bool {
        let indexed = self.index().write().remove(key).is_some();
        if let Err(e) = self.backend.delete(key.as_str()) {
            warn!(key = %key, error = %e, "Durable key delete failed");
        }
        indexed
    }

    fn clear(&self) {
        if let Err(e) = self.backend.clear() {
            warn!(error = %e, "Durable key clear failed");
        }
        self.index().write().clear();
    }

    fn stats(&self) -> TierStats {
        let index = self.index().read();
        TierStats {
            tier: TierKind::DurableKey,
            count: index.len(),
            approx_bytes: index.values().map(|m| m.size_bytes).sum(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            dropped_writes: self.dropped_writes.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Priority;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    fn make_entry(key: &str, priority: Priority, age_secs: i64) -> CacheEntry {
        let base = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        CacheEntry::new(
            CacheKey::new(key),
            json!({ "name": key, "items": [1, 2, 3] }),
            base - Duration::seconds(age_secs),
            Some(std::time::Duration::from_secs(60)),
            "1",
            priority,
        )
    }

    fn config_with_capacity(capacity: usize) -> StoreConfig {
        StoreConfig {
            durable_key_capacity: capacity,
            ..StoreConfig::default()
        }
    }

    #[test]
    fn test_memory_roundtrip() {
        let store = DurableKeyStore::in_memory(&StoreConfig::default());
        let key = CacheKey::with_param("services", "category=spa");
        let entry = make_entry(key.as_str(), Priority::High, 0);

        store.set(&key, entry.clone());
        assert_eq!(store.get(&key), Some(entry.clone()));
        assert!(store.contains(&key));
        assert_eq!(store.written_at(&key), Some(entry.written_at));
        assert_eq!(store.keys(), vec![key.clone()]);

        assert!(store.remove(&key));
        assert_eq!(store.get(&key), None);
        assert_eq!(store.stats().count, 0);
    }

    #[test]
    fn test_file_backend_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::default();
        let key = CacheKey::with_param("services", "category=spa&page=2/3");
        let entry = make_entry(key.as_str(), Priority::Medium, 0);

        {
            let store = DurableKeyStore::open_dir(dir.path(), &config);
            store.set(&key, entry.clone());
        }

        let reopened = DurableKeyStore::open_dir(dir.path(), &config);
        assert_eq!(reopened.stats().count, 1);
        assert_eq!(reopened.get(&key), Some(entry));
    }

    #[test]
    fn test_file_backend_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileKeyValueBackend::new(dir.path().join("not-yet"));
        assert!(backend.keys().unwrap().is_empty());
        assert_eq!(backend.read("team").unwrap(), None);
        backend.delete("team").unwrap();
    }

    #[test]
    fn test_file_backend_key_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileKeyValueBackend::new(dir.path());
        backend.write("../escape?x=1", "{}").unwrap();

        assert_eq!(backend.keys().unwrap(), vec!["../escape?x=1".to_string()]);
        assert!(std::fs::read_dir(dir.path()).unwrap().count() == 1);
        backend.clear().unwrap();
        assert!(backend.keys().unwrap().is_empty());
    }

    #[test]
    fn test_capacity_eviction() {
        let store = DurableKeyStore::in_memory(&config_with_capacity(5));
        for i in 0..5 {
            let name = format!("k{}", i);
            store.set(&CacheKey::new(&name), make_entry(&name, Priority::Medium, 100 - i));
        }
        store.set(&CacheKey::new("new"), make_entry("new", Priority::Medium, 0));

        assert!(!store.contains(&CacheKey::new("k0")));
        assert!(store.contains(&CacheKey::new("new")));
        assert_eq!(store.stats().count, 5);
        assert_eq!(store.stats().evictions, 1);
    }

    #[test]
    fn test_quota_evicts_then_retries() {
        let sample = serde_json::to_string(&make_entry("a", Priority::Low, 0)).unwrap();
        // Room for roughly three records
        let backend = Arc::new(MemoryKeyValueBackend::with_quota(sample.len() as u64 * 3 + 10));
        let store = DurableKeyStore::new(backend.clone(), &config_with_capacity(100));

        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            store.set(&CacheKey::new(*name), make_entry(name, Priority::Low, 10 - i as i64));
        }
        store.set(&CacheKey::new("d"), make_entry("d", Priority::Low, 0));

        assert!(store.contains(&CacheKey::new("d")));
        assert!(!store.contains(&CacheKey::new("a")));
        assert_eq!(store.stats().dropped_writes, 0);
    }

    #[test]
    fn test_quota_too_small_drops_write() {
        let backend = Arc::new(MemoryKeyValueBackend::with_quota(4));
        let store = DurableKeyStore::new(backend.clone(), &StoreConfig::default());
        let key = CacheKey::new("gallery");

        store.set(&key, make_entry("gallery", Priority::High, 0));
        assert_eq!(store.get(&key), None);
        assert_eq!(store.stats().dropped_writes, 1);
        assert!(backend.is_empty());
    }

    #[test]
    fn test_file_backend_quota() {
        let dir = tempfile::tempdir().unwrap();
        let sample = serde_json::to_string(&make_entry("a", Priority::Low, 0)).unwrap();
        let quota = sample.len() as u64 * 2 + 10;
        let backend = FileKeyValueBackend::new(dir.path()).with_quota(quota);

        backend.write("a", &sample).unwrap();
        backend.write("b", &sample).unwrap();
        // Rewriting a record only counts it once
        backend.write("a", &sample).unwrap();
        let err = backend.write("c", &sample).unwrap_err();
        assert!(err.is_quota());
        assert_eq!(backend.read("c").unwrap(), None);

        let store = DurableKeyStore::new(Arc::new(backend), &config_with_capacity(100));
        store.set(&CacheKey::new("c"), make_entry("c", Priority::Low, 0));

        assert!(store.contains(&CacheKey::new("c")));
        assert!(!store.contains(&CacheKey::new("a")));
        assert!(store.stats().evictions >= 1);
        assert_eq!(store.stats().dropped_writes, 0);
        let on_disk: u64 = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|f| f.unwrap().metadata().unwrap().len())
            .sum();
        assert!(on_disk <= quota);
    }

    #[test]
    fn test_unavailable_backend_degrades() {
        let backend = Arc::new(MemoryKeyValueBackend::new());
        backend.set_available(false);
        let store = DurableKeyStore::new(backend.clone(), &StoreConfig::default());
        let key = CacheKey::new("team");

        store.set(&key, make_entry("team", Priority::High, 0));
        assert_eq!(store.get(&key), None);
        assert!(!store.remove(&key));
        store.clear();

        let stats = store.stats();
        assert_eq!(stats.count, 0);
        assert_eq!(stats.dropped_writes, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_corrupt_record_is_purged() {
        let backend = Arc::new(MemoryKeyValueBackend::new());
        backend.write("team", "{not json").unwrap();
        let store = DurableKeyStore::new(backend.clone(), &StoreConfig::default());

        assert_eq!(store.get(&CacheKey::new("team")), None);
        assert!(backend.is_empty());
    }

    #[test]
    fn test_stats_count_record_bytes() {
        let store = DurableKeyStore::in_memory(&StoreConfig::default());
        let entry = make_entry("team", Priority::High, 0);
        let raw_len = serde_json::to_string(&entry).unwrap().len() as u64;

        store.set(&CacheKey::new("team"), entry);
        let stats = store.stats();
        assert_eq!(stats.tier, TierKind::DurableKey);
        assert_eq!(stats.approx_bytes, raw_len);
    }
}
