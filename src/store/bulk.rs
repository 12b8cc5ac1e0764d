//! Durable Bulk Store - large asynchronous persistent tier
//!
//! Holds payloads too large for the key store. Every operation is async; a
//! synchronous view of counts and sizes is kept in an in-memory index so
//! stats never have to touch storage.
//!
//! # Design
//!
//! - Pluggable async [`BulkBackend`] (local filesystem, memory)
//! - Bounded by entry count and by total bytes
//! - Backend failures are absorbed: reads miss, writes are dropped

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::{select_victims, IndexEntry, TierStats};
use crate::config::{eviction_batch, StoreConfig};
use crate::entry::{CacheEntry, CacheKey};
use crate::error::{Error, Result};
use crate::policy::TierKind;

/// Async blob storage backend
#[async_trait]
pub trait BulkBackend: Send + Sync {
    /// Get a blob
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store a blob, replacing any previous value
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Delete a blob; returns whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// List stored keys
    async fn keys(&self) -> Result<Vec<String>>;

    /// Delete every blob
    async fn clear(&self) -> Result<()>;

    /// Get backend statistics
    fn stats(&self) -> BulkBackendStats;
}

/// Bulk backend statistics
#[derive(Debug, Clone, Default)]
pub struct BulkBackendStats {
    /// Total objects stored
    pub object_count: u64,
    /// Total bytes stored
    pub total_bytes: u64,
    /// Read operations
    pub reads: u64,
    /// Write operations
    pub writes: u64,
    /// Delete operations
    pub deletes: u64,
}

#[derive(Default)]
struct OpCounters {
    object_count: AtomicU64,
    total_bytes: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl OpCounters {
    fn replaced(&self, old_size: Option<u64>, new_size: u64) {
        match old_size {
            Some(old) if new_size >= old => {
                self.total_bytes.fetch_add(new_size - old, Ordering::Relaxed);
            }
            Some(old) => {
                self.total_bytes.fetch_sub(old - new_size, Ordering::Relaxed);
            }
            None => {
                self.object_count.fetch_add(1, Ordering::Relaxed);
                self.total_bytes.fetch_add(new_size, Ordering::Relaxed);
            }
        }
    }

    fn removed(&self, size: u64) {
        self.object_count.fetch_sub(1, Ordering::Relaxed);
        self.total_bytes.fetch_sub(size, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.object_count.store(0, Ordering::Relaxed);
        self.total_bytes.store(0, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BulkBackendStats {
        BulkBackendStats {
            object_count: self.object_count.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// In-memory backend
// =============================================================================

/// In-memory bulk backend for testing
/// Uses DashMap for lock-free concurrent access
#[derive(Default)]
pub struct InMemoryBulkBackend {
    storage: DashMap<String, Bytes>,
    counters: OpCounters,
    quota_bytes: Option<u64>,
    unavailable: AtomicBool,
}

impl InMemoryBulkBackend {
    /// Create a new in-memory backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend refusing writes beyond `quota_bytes`
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

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(Error::storage(TierKind::DurableBulk, "backend unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl BulkBackend for InMemoryBulkBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.check_available()?;
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.storage.get(key).map(|data| data.clone()))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.check_available()?;
        let size = data.len() as u64;

        if let Some(quota) = self.quota_bytes {
            let existing = self.storage.get(key).map_or(0, |d| d.len() as u64);
            let used = self.counters.total_bytes.load(Ordering::Relaxed) - existing;
            if used + size > quota {
                return Err(Error::quota(
                    TierKind::DurableBulk,
                    format!("{} + {} bytes over quota of {}", used, size, quota),
                ));
            }
        }

        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        let old = self.storage.insert(key.to_string(), data);
        self.counters.replaced(old.map(|d| d.len() as u64), size);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        match self.storage.remove(key) {
            Some((_, data)) => {
                self.counters.removed(data.len() as u64);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.check_available()?;
        Ok(self.storage.iter().map(|e| e.key().clone()).collect())
    }

    async fn clear(&self) -> Result<()> {
        self.check_available()?;
        self.storage.clear();
        self.counters.reset();
        Ok(())
    }

    fn stats(&self) -> BulkBackendStats {
        self.counters.snapshot()
    }
}

// =============================================================================
// Filesystem backend
// =============================================================================

const BLOB_PREFIX: &str = "b-";
const BLOB_SUFFIX: &str = ".json";

/// Local filesystem bulk backend using tokio::fs
pub struct FsBulkBackend {
    dir: PathBuf,
    counters: OpCounters,
}

impl FsBulkBackend {
    /// Store blobs under `dir`; the directory is created on first write
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            counters: OpCounters::default(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!(
            "{}{}{}",
            BLOB_PREFIX,
            urlencoding::encode(key),
            BLOB_SUFFIX
        ))
    }

    async fn record_files(&self) -> Result<Vec<(PathBuf, String)>> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(fs_error(e)),
        };

        let mut files = Vec::new();
        while let Some(item) = dir.next_entry().await.map_err(fs_error)? {
            let name = item.file_name();
            let key = name
                .to_str()
                .and_then(|n| n.strip_prefix(BLOB_PREFIX))
                .and_then(|n| n.strip_suffix(BLOB_SUFFIX))
                .and_then(|n| urlencoding::decode(n).ok());
            if let Some(key) = key {
                files.push((item.path(), key.into_owned()));
            }
        }
        Ok(files)
    }
}

fn fs_error(e: std::io::Error) -> Error {
    Error::storage(TierKind::DurableBulk, e)
}

async fn file_size(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().map(|m| m.len())
}

#[async_trait]
impl BulkBackend for FsBulkBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        match tokio::fs::read(self.path_for(key)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(fs_error(e)),
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(fs_error)?;
        let path = self.path_for(key);
        let old_size = file_size(&path).await;
        let size = data.len() as u64;

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &data).await.map_err(fs_error)?;
        tokio::fs::rename(&tmp, &path).await.map_err(fs_error)?;

        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.counters.replaced(old_size, size);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        let path = self.path_for(key);
        let size = file_size(&path).await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                self.counters.removed(size.unwrap_or(0));
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(fs_error(e)),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self
            .record_files()
            .await?
            .into_iter()
            .map(|(_, key)| key)
            .collect())
    }

    async fn clear(&self) -> Result<()> {
        for (path, _) in self.record_files().await? {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(fs_error(e)),
            }
        }
        self.counters.reset();
        Ok(())
    }

    fn stats(&self) -> BulkBackendStats {
        self.counters.snapshot()
    }
}

// =============================================================================
// Store
// =============================================================================

/// Durable tier for large payloads
pub struct DurableBulkStore {
    /// Storage backend
    backend: Arc<dyn BulkBackend>,
    /// Maximum entries
    capacity: usize,
    /// Byte budget
    max_bytes: u64,
    /// Share of entries evicted per pass
    eviction_fraction: f64,
    /// Set once the index has been loaded from the backend
    opened: OnceCell<()>,
    /// Size and age of stored blobs
    index: RwLock<HashMap<CacheKey, IndexEntry>>,
    /// Hit count
    hits: AtomicU64,
    /// Miss count
    misses: AtomicU64,
    /// Eviction count
    evictions: AtomicU64,
    /// Writes lost to storage failures
    dropped_writes: AtomicU64,
}

impl DurableBulkStore {
    /// Create a store over a backend
    pub fn new(backend: Arc<dyn BulkBackend>, config: &StoreConfig) -> Self {
        Self {
            backend,
            capacity: config.bulk_capacity.max(1),
            max_bytes: config.bulk_max_bytes,
            eviction_fraction: config.eviction_fraction,
            opened: OnceCell::new(),
            index: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            dropped_writes: AtomicU64::new(0),
        }
    }

    /// Create with in-memory backend (for testing)
    pub fn in_memory(config: &StoreConfig) -> Self {
        Self::new(Arc::new(InMemoryBulkBackend::new()), config)
    }

    /// Create a store persisting under `dir`
    pub fn open_dir(dir: impl Into<PathBuf>, config: &StoreConfig) -> Self {
        Self::new(Arc::new(FsBulkBackend::new(dir)), config)
    }

    /// Load the index from the backend on first use
    pub async fn open(&self) {
        self.opened
            .get_or_init(|| async {
                let loaded = self.load_index().await;
                self.index.write().extend(loaded);
            })
            .await;
    }

    async fn load_index(&self) -> HashMap<CacheKey, IndexEntry> {
        let keys = match self.backend.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Bulk store unavailable, starting empty");
                return HashMap::new();
            }
        };

        let mut index = HashMap::with_capacity(keys.len());
        for raw_key in keys {
            match self.backend.get(&raw_key).await {
                Ok(Some(data)) => match serde_json::from_slice::<CacheEntry>(&data) {
                    Ok(entry) => {
                        index.insert(
                            CacheKey::from(raw_key),
                            IndexEntry::of(&entry, data.len() as u64),
                        );
                    }
                    Err(e) => {
                        warn!(key = %raw_key, error = %e, "Purging corrupt blob");
                        let _ = self.backend.delete(&raw_key).await;
                    }
                },
                Ok(None) => {}
                Err(e) => warn!(key = %raw_key, error = %e, "Skipping unreadable blob"),
            }
        }
        debug!(entries = index.len(), "Bulk store opened");
        index
    }

    /// Get an entry
    pub async fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.open().await;
        match self.backend.get(key.as_str()).await {
            Ok(Some(data)) => match serde_json::from_slice::<CacheEntry>(&data) {
                Ok(entry) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    Some(entry)
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Purging corrupt blob");
                    self.remove(key).await;
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    None
                }
            },
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Bulk read failed");
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store an entry, evicting until it fits
    pub async fn set(&self, key: &CacheKey, entry: CacheEntry) {
        self.open().await;
        let data = match serde_json::to_vec(&entry) {
            Ok(data) => Bytes::from(data),
            Err(e) => {
                self.drop_write(key, &e.into());
                return;
            }
        };
        let size = data.len() as u64;
        if size > self.max_bytes {
            self.drop_write(
                key,
                &Error::quota(TierKind::DurableBulk, format!("{} bytes exceeds budget", size)),
            );
            return;
        }

        while self.needs_room(key, size) {
            if self.evict().await == 0 {
                break;
            }
        }

        match self.put_blob(key, &entry, data.clone()).await {
            Ok(()) => {}
            Err(e) if e.is_quota() => {
                debug!(key = %key, "Quota exceeded, evicting and retrying once");
                self.evict().await;
                if let Err(e) = self.put_blob(key, &entry, data).await {
                    self.drop_write(key, &e);
                }
            }
            Err(e) => self.drop_write(key, &e),
        }
    }

    /// Remove an entry; returns whether it was present
    pub async fn remove(&self, key: &CacheKey) -> bool {
        self.open().await;
        let indexed = self.index.write().remove(key).is_some();
        match self.backend.delete(key.as_str()).await {
            Ok(existed) => indexed || existed,
            Err(e) => {
                warn!(key = %key, error = %e, "Bulk delete failed");
                indexed
            }
        }
    }

    /// Drop every entry
    pub async fn clear(&self) {
        self.open().await;
        if let Err(e) = self.backend.clear().await {
            warn!(error = %e, "Bulk clear failed");
        }
        self.index.write().clear();
    }

    /// Check if the store holds a key
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.index.read().contains_key(key)
    }

    /// Stored keys; call [`open`](Self::open) first for a complete list
    pub fn keys(&self) -> Vec<CacheKey> {
        self.index.read().keys().cloned().collect()
    }

    /// Write time of the stored blob
    pub fn written_at(&self, key: &CacheKey) -> Option<DateTime<Utc>> {
        self.index.read().get(key).map(|m| m.written_at)
    }

    /// Current statistics, served from the index
    pub fn stats(&self) -> TierStats {
        let index = self.index.read();
        TierStats {
            tier: TierKind::DurableBulk,
            count: index.len(),
            approx_bytes: index.values().map(|m| m.size_bytes).sum(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            dropped_writes: self.dropped_writes.load(Ordering::Relaxed),
        }
    }

    /// Get backend statistics
    pub fn backend_stats(&self) -> BulkBackendStats {
        self.backend.stats()
    }

    fn needs_room(&self, key: &CacheKey, size: u64) -> bool {
        let index = self.index.read();
        let existing = index.get(key).map(|m| m.size_bytes);
        let used: u64 = index.values().map(|m| m.size_bytes).sum::<u64>() - existing.unwrap_or(0);

        let over_count = existing.is_none() && index.len() >= self.capacity;
        over_count || used + size > self.max_bytes
    }

    async fn put_blob(&self, key: &CacheKey, entry: &CacheEntry, data: Bytes) -> Result<()> {
        let size = data.len() as u64;
        self.backend.put(key.as_str(), data).await?;
        self.index
            .write()
            .insert(key.clone(), IndexEntry::of(entry, size));
        Ok(())
    }

    /// Evict one batch; returns how many entries were removed
    async fn evict(&self) -> usize {
        let batch = eviction_batch(self.capacity, self.eviction_fraction);
        let victims = select_victims(self.index.read().iter(), batch);

        let mut evicted = 0;
        for key in &victims {
            if let Err(e) = self.backend.delete(key.as_str()).await {
                warn!(key = %key, error = %e, "Failed to evict blob");
                continue;
            }
            self.index.write().remove(key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            evicted += 1;
        }
        debug!(evicted, "Bulk store eviction pass");
        evicted
    }

    fn drop_write(&self, key: &CacheKey, error: &Error) {
        self.dropped_writes.fetch_add(1, Ordering::Relaxed);
        warn!(key = %key, error = %error, "Dropping bulk write");
    }
}

// =============================================================================
// Tests
// =============================================================================
