//! Cache Orchestrator - Stale-While-Revalidate over Three Tiers
//!
//! Single entry point for consumers. Looks a key up fastest tier first,
//! serves stale copies while refreshing them in the background, coalesces
//! concurrent fetches of one key, and writes results through the tiers the
//! policy selects.
//!
//! ```text
//!  read(key) ──► Ephemeral ──fresh──► Memory
//!                   │ miss/stale
//!                   ▼
//!               DurableKey ─► DurableBulk ──fresh──► backfill Ephemeral ─► Durable
//!                   │ miss            │ stale
//!                   ▼                 ▼
//!          in-flight fetch ◄──── background refresh (skipped offline)
//!                   │
//!                   ▼
//!        write through policy tiers ─► Updated event ─► Remote
//! ```
//!
//! Writes are monotonic per key: a value is stored only if its `written_at`
//! (stamped when the fetch was dispatched) is not older than what is held.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::entry::{estimate_size, CacheEntry, CacheKey, Priority, Validity};
use crate::error::{Error, Result};
use crate::events::{CacheEvent, Subscribers, Subscription};
use crate::metrics::{CacheMetrics, LatencyTracker};
use crate::network::{NetworkQuality, NetworkQualityMonitor, NetworkTier};
use crate::policy::{CachePolicy, TierKind};
use crate::store::{DurableBulkStore, DurableKeyStore, EphemeralStore, TierStats, TierStore};

/// Where a read was answered from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Ephemeral tier
    Memory,
    /// One of the durable tiers
    Durable,
    /// The origin, via the fetcher
    Remote,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Memory => write!(f, "memory"),
            Source::Durable => write!(f, "durable"),
            Source::Remote => write!(f, "remote"),
        }
    }
}

/// Per-request options for reads and writes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// TTL category; defaults to the key's category
    pub category: Option<String>,
    /// Priority band
    pub priority: Priority,
}

impl ReadOptions {
    /// Options with a priority and the key's own category
    pub fn new(priority: Priority) -> Self {
        Self {
            category: None,
            priority,
        }
    }

    /// Override the TTL category
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    fn category_for<'a>(&'a self, key: &'a CacheKey) -> &'a str {
        self.category.as_deref().unwrap_or_else(|| key.category())
    }
}

/// Result of a successful read
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead<T> {
    /// Decoded payload
    pub data: T,
    /// True when the TTL has elapsed and a refresh was scheduled
    pub is_stale: bool,
    /// Tier or origin that answered
    pub source: Source,
}

/// Render-friendly view of a read that never fails
#[derive(Debug, Clone, PartialEq)]
pub struct CachedView<T> {
    /// Payload, if anything is available
    pub data: Option<T>,
    /// True when `data` is past its TTL
    pub is_stale: bool,
    /// True while a background refresh for `data` is running
    pub is_loading: bool,
    /// Cold-miss fetch failure, if any
    pub error: Option<String>,
}

/// Orchestrator statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// One row per tier
    pub per_tier: Vec<TierStats>,
    /// Last time a fetched or written value was stored
    pub last_refresh: Option<DateTime<Utc>>,
}

impl CacheStats {
    /// Row for one tier
    pub fn tier(&self, tier: TierKind) -> Option<&TierStats> {
        self.per_tier.iter().find(|s| s.tier == tier)
    }
}

/// Fetch joined by every caller of one key; settles to the stored entry and
/// whether it was applied
pub(crate) type SharedFetch =
    Shared<BoxFuture<'static, std::result::Result<(CacheEntry, bool), String>>>;

struct Inner {
    config: CacheConfig,
    policy: CachePolicy,
    clock: Arc<dyn Clock>,
    monitor: Arc<NetworkQualityMonitor>,
    ephemeral: Arc<EphemeralStore>,
    durable_key: Arc<DurableKeyStore>,
    bulk: Arc<DurableBulkStore>,
    events: Subscribers<CacheEvent>,
    metrics: Arc<CacheMetrics>,
    /// One entry per key with a fetch outstanding
    inflight: Mutex<HashMap<CacheKey, SharedFetch>>,
    /// Serializes tier writes so the monotonic check and the write are atomic
    write_gate: tokio::sync::Mutex<()>,
    last_refresh: RwLock<Option<DateTime<Utc>>>,
    /// Monitor callback announcing reconnection
    _network: Subscription,
}

/// Tiered, network-adaptive cache
///
/// Cheap to clone; clones share the same tiers, subscribers and in-flight
/// fetches.
#[derive(Clone)]
pub struct CacheOrchestrator {
    inner: Arc<Inner>,
}

impl CacheOrchestrator {
    /// Start building an orchestrator
    pub fn builder(config: CacheConfig) -> CacheOrchestratorBuilder {
        CacheOrchestratorBuilder::new(config)
    }

    /// Create with in-memory durable tiers (for testing)
    pub fn in_memory(config: CacheConfig) -> Self {
        Self::builder(config).build()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read a key, fetching it from the origin on a cold miss
    ///
    /// A fresh cached value is returned as is. A stale one is returned with
    /// `is_stale = true` and refreshed in the background unless offline.
    /// Only a cold-miss fetch failure is reported as an error.
    #[instrument(skip(self, key, fetcher, opts), fields(key = %key))]
    pub async fn read<T, F, Fut>(
        &self,
        key: &CacheKey,
        fetcher: F,
        opts: ReadOptions,
    ) -> Result<CacheRead<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let now = self.inner.clock.now();

        if let Some((entry, source, validity)) = self.inner.lookup(key, now).await {
            match entry.decode::<T>() {
                Ok(data) => {
                    let is_stale = validity == Validity::Stale;
                    match source {
                        Source::Memory => self.inner.metrics.record_memory_hit(),
                        _ => self.inner.metrics.record_durable_hit(),
                    }
                    if is_stale {
                        self.inner.metrics.record_stale_served();
                        self.schedule_refresh(key, fetcher, opts);
                    }
                    return Ok(CacheRead {
                        data,
                        is_stale,
                        source,
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Cached payload does not decode, refetching");
                }
            }
        }

        self.inner.metrics.record_remote_read();
        let (entry, _) = self
            .fetch_shared(key, fetcher, opts)
            .await
            .map_err(|reason| Error::FetchFailed {
                key: key.to_string(),
                reason,
            })?;

        Ok(CacheRead {
            data: entry.decode()?,
            is_stale: false,
            source: Source::Remote,
        })
    }

    /// Read a key into a view that carries errors instead of returning them
    pub async fn read_cached<T, F, Fut>(
        &self,
        key: &CacheKey,
        fetcher: F,
        opts: ReadOptions,
    ) -> CachedView<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        match self.read(key, fetcher, opts).await {
            Ok(read) => CachedView {
                is_loading: read.is_stale && self.is_fetching(key),
                is_stale: read.is_stale,
                data: Some(read.data),
                error: None,
            },
            Err(e) => CachedView {
                data: None,
                is_stale: false,
                is_loading: false,
                error: Some(e.to_string()),
            },
        }
    }

    /// Best cached entry for a key, fresh or stale, without fetching
    pub async fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        let now = self.inner.clock.now();
        self.inner.lookup(key, now).await.map(|(entry, _, _)| entry)
    }

    /// Check if a fetch for the key is outstanding
    pub fn is_fetching(&self, key: &CacheKey) -> bool {
        self.inner.inflight.lock().contains_key(key)
    }

    fn schedule_refresh<T, F, Fut>(&self, key: &CacheKey, fetcher: F, opts: ReadOptions)
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        if !self.inner.monitor.current().is_online() {
            debug!(key = %key, "Offline, serving stale without refresh");
            self.inner.metrics.record_refresh_skipped();
            return;
        }

        let refresh = self.fetch_shared(key, fetcher, opts);
        let metrics = self.inner.metrics.clone();
        let key = key.clone();
        tokio::spawn(async move {
            match refresh.await {
                Ok(_) => metrics.record_refresh(true),
                Err(reason) => {
                    metrics.record_refresh(false);
                    warn!(key = %key, %reason, "Background refresh failed");
                }
            }
        });
    }

    /// Join the outstanding fetch for `key`, or dispatch a new one
    pub(crate) fn fetch_shared<T, F, Fut>(
        &self,
        key: &CacheKey,
        fetcher: F,
        opts: ReadOptions,
    ) -> SharedFetch
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let mut inflight = self.inner.inflight.lock();
        if let Some(pending) = inflight.get(key) {
            debug!(key = %key, "Joining in-flight fetch");
            self.inner.metrics.record_dedup_join();
            return pending.clone();
        }

        let written_at = self.inner.clock.now();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let fetch_key = key.clone();

        let fetch = async move {
            let tracker = LatencyTracker::start();
            let result = fetcher().await;

            let Some(inner) = weak.upgrade() else {
                return Err("cache dropped before the fetch settled".to_string());
            };
            inner.metrics.record_fetch(tracker.elapsed(), result.is_ok());

            let outcome = match result.map(|value| serde_json::to_value(&value)) {
                Ok(Ok(data)) => Ok(inner.store(&fetch_key, data, written_at, &opts).await),
                Ok(Err(e)) => Err(format!("payload is not serializable: {}", e)),
                Err(e) => Err(format!("{:#}", e)),
            };

            inner.inflight.lock().remove(&fetch_key);
            outcome
        }
        .boxed()
        .shared();

        inflight.insert(key.clone(), fetch.clone());
        fetch
    }

    /// Forget a fetch its dispatcher gave up on, unless someone else is
    /// still waiting for it. The fetch is cancelled once the last handle
    /// drops.
    pub(crate) fn release_fetch(&self, key: &CacheKey, fetch: &SharedFetch) {
        let mut inflight = self.inner.inflight.lock();
        let unshared = inflight.get(key).is_some_and(|pending| {
            // One handle in the map, one held by the caller
            pending.ptr_eq(fetch) && fetch.strong_count().is_some_and(|n| n <= 2)
        });
        if unshared {
            inflight.remove(key);
            debug!(key = %key, "Released abandoned fetch");
        }
    }

    /// Wait until every outstanding fetch, including background refreshes,
    /// has settled
    pub async fn wait_idle(&self) {
        loop {
            let pending: Vec<SharedFetch> = self.inner.inflight.lock().values().cloned().collect();
            if pending.is_empty() {
                return;
            }
            futures::future::join_all(pending).await;
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store a value under `key` as if it had just been fetched
    #[instrument(skip(self, key, data, opts), fields(key = %key))]
    pub async fn write<T: Serialize + ?Sized>(&self, key: &CacheKey, data: &T, opts: ReadOptions) -> Result<()> {
        let data = serde_json::to_value(data)?;
        let written_at = self.inner.clock.now();
        self.inner.store(key, data, written_at, &opts).await;
        Ok(())
    }

    /// Remove a key from every tier
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn invalidate(&self, key: &CacheKey) {
        self.inner.remove_everywhere(key).await;
        self.inner.metrics.record_invalidation();
        self.inner
            .events
            .emit(&CacheEvent::Invalidated { key: key.clone() });
    }

    /// Remove several keys from every tier
    pub async fn invalidate_many<'a, I>(&self, keys: I)
    where
        I: IntoIterator<Item = &'a CacheKey>,
    {
        for key in keys {
            self.invalidate(key).await;
        }
    }

    /// Clear every tier
    #[instrument(skip(self))]
    pub async fn invalidate_all(&self) {
        {
            let _gate = self.inner.write_gate.lock().await;
            self.inner.ephemeral.clear();
            self.inner.durable_key.clear();
            self.inner.bulk.clear().await;
        }
        info!("All cache tiers cleared");
        self.inner.events.emit(&CacheEvent::GlobalRefresh);
    }

    /// Remove durable records written under another schema version;
    /// returns how many were purged
    #[instrument(skip(self))]
    pub async fn purge_incompatible(&self) -> usize {
        let schema = self.inner.config.schema_version.as_str();
        let mut purged = 0;

        for key in self.inner.durable_key.keys() {
            if let Some(entry) = self.inner.durable_key.get(&key) {
                if entry.schema_version != schema {
                    self.inner.durable_key.remove(&key);
                    self.inner.metrics.record_incompatible_purge();
                    purged += 1;
                }
            }
        }

        self.inner.bulk.open().await;
        for key in self.inner.bulk.keys() {
            if let Some(entry) = self.inner.bulk.get(&key).await {
                if entry.schema_version != schema {
                    self.inner.bulk.remove(&key).await;
                    self.inner.metrics.record_incompatible_purge();
                    purged += 1;
                }
            }
        }

        if purged > 0 {
            info!(purged, schema_version = schema, "Purged incompatible records");
        }
        purged
    }

    // =========================================================================
    // Observation
    // =========================================================================

    /// Register for change notifications
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(callback)
    }

    /// Current per-tier statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            per_tier: vec![
                self.inner.ephemeral.stats(),
                self.inner.durable_key.stats(),
                self.inner.bulk.stats(),
            ],
            last_refresh: *self.inner.last_refresh.read(),
        }
    }

    /// Metrics collector
    pub fn metrics(&self) -> &CacheMetrics {
        &self.inner.metrics
    }

    /// Metrics and tier gauges in the Prometheus text format
    pub fn encode_prometheus(&self) -> Result<String> {
        self.inner.metrics.encode_prometheus(&self.stats().per_tier)
    }

    /// Network monitor driving TTLs and refresh decisions
    pub fn monitor(&self) -> &Arc<NetworkQualityMonitor> {
        &self.inner.monitor
    }

    /// Placement policy
    pub fn policy(&self) -> &CachePolicy {
        &self.inner.policy
    }

    /// Get configuration
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }
}

impl Inner {
    /// Find the best cached entry: the first fresh one, else the first
    /// stale one. Incompatible entries are purged on the way.
    async fn lookup(
        &self,
        key: &CacheKey,
        now: DateTime<Utc>,
    ) -> Option<(CacheEntry, Source, Validity)> {
        let mut stale = None;

        if let Some(entry) = self.ephemeral.get(key) {
            match self.classify(&entry, now) {
                Validity::Fresh => return Some((entry, Source::Memory, Validity::Fresh)),
                Validity::Stale => stale = Some((entry, Source::Memory, Validity::Stale)),
                Validity::Incompatible => {
                    self.ephemeral.remove(key);
                }
            }
        }

        let durable = match self.durable_key.get(key) {
            Some(entry) => Some(entry),
            None => self.bulk.get(key).await,
        };
        if let Some(entry) = durable {
            match self.classify(&entry, now) {
                Validity::Fresh => {
                    self.ephemeral.set_if_newer(key, entry.clone());
                    return Some((entry, Source::Durable, Validity::Fresh));
                }
                Validity::Stale => {
                    if stale.is_none() {
                        stale = Some((entry, Source::Durable, Validity::Stale));
                    }
                }
                Validity::Incompatible => {
                    self.durable_key.remove(key);
                    self.bulk.remove(key).await;
                }
            }
        }

        stale
    }

    fn classify(&self, entry: &CacheEntry, now: DateTime<Utc>) -> Validity {
        let validity = entry.validity(now, &self.config.schema_version);
        if validity == Validity::Incompatible {
            let mismatch = Error::SchemaMismatch {
                key: entry.key.to_string(),
                found: entry.schema_version.clone(),
                expected: self.config.schema_version.clone(),
            };
            debug!(error = %mismatch, "Purging incompatible entry");
            self.metrics.record_incompatible_purge();
        }
        validity
    }

    /// Resolve placement, write through the selected tiers and broadcast.
    /// Returns the entry and whether it was applied.
    async fn store(
        &self,
        key: &CacheKey,
        data: serde_json::Value,
        written_at: DateTime<Utc>,
        opts: &ReadOptions,
    ) -> (CacheEntry, bool) {
        // Stored TTLs are always bounded: an offline write is stamped with
        // the fast-link window so it ages once the link returns
        let network = match self.monitor.tier() {
            NetworkTier::Offline => NetworkTier::Fast,
            tier => tier,
        };
        let decision = self.policy.resolve(
            opts.category_for(key),
            opts.priority,
            network,
            estimate_size(&data),
        );
        let entry = CacheEntry::new(
            key.clone(),
            data,
            written_at,
            decision.ttl,
            self.config.schema_version.clone(),
            opts.priority,
        );

        {
            let _gate = self.write_gate.lock().await;
            if let Some(stored) = self.newest_written_at(key).await {
                if stored > written_at {
                    debug!(key = %key, %stored, %written_at, "Discarding superseded write");
                    self.metrics.record_write_superseded();
                    return (entry, false);
                }
            }

            for tier in &decision.tiers {
                match tier {
                    TierKind::Ephemeral => self.ephemeral.set(key, entry.clone()),
                    TierKind::DurableKey => {
                        self.durable_key.set(key, entry.clone());
                        if self.bulk.contains(key) {
                            self.bulk.remove(key).await;
                        }
                    }
                    TierKind::DurableBulk => {
                        self.bulk.set(key, entry.clone()).await;
                        if self.durable_key.contains(key) {
                            self.durable_key.remove(key);
                        }
                    }
                }
            }
        }

        *self.last_refresh.write() = Some(self.clock.now());
        self.metrics.record_write();
        debug!(key = %key, tiers = ?decision.tiers, ttl = ?decision.ttl, "Stored entry");
        self.events.emit(&CacheEvent::Updated { key: key.clone() });
        (entry, true)
    }

    async fn newest_written_at(&self, key: &CacheKey) -> Option<DateTime<Utc>> {
        self.bulk.open().await;
        [
            self.ephemeral.written_at(key),
            self.durable_key.written_at(key),
            self.bulk.written_at(key),
        ]
        .into_iter()
        .flatten()
        .max()
    }

    async fn remove_everywhere(&self, key: &CacheKey) {
        let _gate = self.write_gate.lock().await;
        self.ephemeral.remove(key);
        self.durable_key.remove(key);
        self.bulk.remove(key).await;
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`CacheOrchestrator`]
///
/// Anything not supplied defaults to an in-memory store, the system clock,
/// or a monitor built from the network configuration.
pub struct CacheOrchestratorBuilder {
    config: CacheConfig,
    clock: Option<Arc<dyn Clock>>,
    monitor: Option<Arc<NetworkQualityMonitor>>,
    ephemeral: Option<Arc<EphemeralStore>>,
    durable_key: Option<Arc<DurableKeyStore>>,
    bulk: Option<Arc<DurableBulkStore>>,
    metrics: Option<Arc<CacheMetrics>>,
}

impl CacheOrchestratorBuilder {
    fn new(config: CacheConfig) -> Self {
        Self {
            config,
            clock: None,
            monitor: None,
            ephemeral: None,
            durable_key: None,
            bulk: None,
            metrics: None,
        }
    }

    /// Time source for TTL checks and write stamps
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Network monitor
    pub fn monitor(mut self, monitor: Arc<NetworkQualityMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Ephemeral tier
    pub fn ephemeral(mut self, store: Arc<EphemeralStore>) -> Self {
        self.ephemeral = Some(store);
        self
    }

    /// Durable key tier
    pub fn durable_key(mut self, store: Arc<DurableKeyStore>) -> Self {
        self.durable_key = Some(store);
        self
    }

    /// Durable bulk tier
    pub fn bulk(mut self, store: Arc<DurableBulkStore>) -> Self {
        self.bulk = Some(store);
        self
    }

    /// Shared metrics collector
    pub fn metrics(mut self, metrics: Arc<CacheMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the orchestrator
    pub fn build(self) -> CacheOrchestrator {
        let config = self.config;
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let monitor = self.monitor.unwrap_or_else(|| {
            NetworkQualityMonitor::with_clock(config.network.clone(), clock.clone())
        });
        let ephemeral = self
            .ephemeral
            .unwrap_or_else(|| Arc::new(EphemeralStore::from_config(&config.stores)));
        let durable_key = self
            .durable_key
            .unwrap_or_else(|| Arc::new(DurableKeyStore::in_memory(&config.stores)));
        let bulk = self
            .bulk
            .unwrap_or_else(|| Arc::new(DurableBulkStore::in_memory(&config.stores)));

        let metrics = self.metrics.unwrap_or_default();

        CacheOrchestrator {
            inner: Arc::new_cyclic(|weak: &Weak<Inner>| {
                let was_offline = AtomicBool::new(!monitor.current().is_online());
                let weak = weak.clone();
                let network = monitor.subscribe(move |quality: &NetworkQuality| {
                    if !quality.is_online() {
                        was_offline.store(true, Ordering::Relaxed);
                    } else if was_offline.swap(false, Ordering::Relaxed) {
                        if let Some(inner) = weak.upgrade() {
                            info!(tier = %quality.tier, "Back online, stale entries refresh on next read");
                            inner.events.emit(&CacheEvent::Reconnected);
                        }
                    }
                });

                Inner {
                    policy: CachePolicy::new(config.policy.clone()),
                    config,
                    clock,
                    monitor,
                    ephemeral,
                    durable_key,
                    bulk,
                    events: Subscribers::new(),
                    metrics,
                    inflight: Mutex::new(HashMap::new()),
                    write_gate: tokio::sync::Mutex::new(()),
                    last_refresh: RwLock::new(None),
                    _network: network,
                }
            }),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::network::ConnectivitySignal;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Harness {
        cache: CacheOrchestrator,
        clock: Arc<ManualClock>,
    }

    fn make_cache() -> Harness {
        let mut config = CacheConfig::default();
        config.network.debounce = Duration::ZERO;
        config
            .policy
            .category_ttls
            .insert("statistics".into(), Duration::from_secs(3600));
        let clock = Arc::new(ManualClock::starting_now());
        let cache = CacheOrchestrator::builder(config)
            .clock(clock.clone())
            .build();
        Harness { cache, clock }
    }

    fn ok_fetch(value: serde_json::Value) -> impl FnOnce() -> BoxFuture<'static, anyhow::Result<serde_json::Value>> {
        move || async move { Ok(value) }.boxed()
    }

    fn failing_fetch() -> impl FnOnce() -> BoxFuture<'static, anyhow::Result<serde_json::Value>> {
        || async { Err(anyhow::anyhow!("origin unreachable")) }.boxed()
    }

    #[tokio::test]
    async fn test_cold_read_fetches_and_caches() {
        let h = make_cache();
        let key = CacheKey::new("team");

        let first = h
            .cache
            .read(&key, ok_fetch(json!(["ada"])), ReadOptions::default())
            .await
            .unwrap();
        assert_eq!(first.source, Source::Remote);
        assert!(!first.is_stale);

        let second = h
            .cache
            .read(&key, failing_fetch(), ReadOptions::default())
            .await
            .unwrap();
        assert_eq!(second.source, Source::Memory);
        assert_eq!(second.data, json!(["ada"]));
        assert!(h.cache.stats().last_refresh.is_some());
    }

    #[tokio::test]
    async fn test_cold_miss_failure_is_reported() {
        let h = make_cache();
        let result = h
            .cache
            .read::<serde_json::Value, _, _>(&CacheKey::new("team"), failing_fetch(), ReadOptions::default())
            .await;
        assert_matches!(result, Err(Error::FetchFailed { reason, .. }) if reason.contains("unreachable"));
    }

    #[tokio::test]
    async fn test_durable_hit_backfills_memory() {
        let h = make_cache();
        let key = CacheKey::new("services");
        h.cache
            .write(&key, &json!({"spa": true}), ReadOptions::new(Priority::High))
            .await
            .unwrap();
        h.cache.inner.ephemeral.clear();

        let read = h
            .cache
            .read(&key, failing_fetch(), ReadOptions::default())
            .await
            .unwrap();
        assert_eq!(read.source, Source::Durable);
        assert!(h.cache.inner.ephemeral.contains(&key));
    }

    #[tokio::test]
    async fn test_stale_read_refreshes_in_background() {
        let h = make_cache();
        let key = CacheKey::new("statistics");
        h.cache
            .write(&key, &json!({"visitors": 1}), ReadOptions::new(Priority::Critical))
            .await
            .unwrap();

        h.clock.advance(chrono::Duration::minutes(61));
        let read = h
            .cache
            .read(&key, ok_fetch(json!({"visitors": 2})), ReadOptions::new(Priority::Critical))
            .await
            .unwrap();
        assert!(read.is_stale);
        assert_eq!(read.data, json!({"visitors": 1}));

        h.cache.wait_idle().await;
        let fresh: CacheRead<serde_json::Value> = h
            .cache
            .read(&key, failing_fetch(), ReadOptions::new(Priority::Critical))
            .await
            .unwrap();
        assert!(!fresh.is_stale);
        assert_eq!(fresh.data, json!({"visitors": 2}));
        assert_eq!(h.cache.metrics().snapshot().stale_served, 1);
    }

    #[tokio::test]
    async fn test_offline_skips_refresh() {
        let h = make_cache();
        let key = CacheKey::new("statistics");
        h.cache
            .write(&key, &json!(1), ReadOptions::new(Priority::Critical))
            .await
            .unwrap();
        h.cache.monitor().report(ConnectivitySignal::offline());
        h.clock.advance(chrono::Duration::hours(5));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let read: CacheRead<serde_json::Value> = h
            .cache
            .read(
                &key,
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(2))
                },
                ReadOptions::new(Priority::Critical),
            )
            .await
            .unwrap();

        assert!(read.is_stale);
        assert!(!h.cache.is_fetching(&key));
        h.cache.wait_idle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.cache.metrics().snapshot().refreshes_skipped_offline, 1);
    }

    #[tokio::test]
    async fn test_offline_write_ages_after_reconnect() {
        let h = make_cache();
        let key = CacheKey::new("statistics");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = h.cache.subscribe(move |e| sink.lock().push(e.clone()));

        h.cache.monitor().report(ConnectivitySignal::offline());
        h.cache
            .write(&key, &json!(1), ReadOptions::new(Priority::Critical))
            .await
            .unwrap();
        let stored = h.cache.peek(&key).await.unwrap();
        assert_eq!(stored.ttl, Some(Duration::from_secs(3600)));

        h.clock.advance(chrono::Duration::hours(2));
        h.cache.monitor().report(ConnectivitySignal::online());
        assert!(seen.lock().contains(&CacheEvent::Reconnected));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let read: CacheRead<serde_json::Value> = h
            .cache
            .read(
                &key,
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(2))
                },
                ReadOptions::new(Priority::Critical),
            )
            .await
            .unwrap();
        assert!(read.is_stale);
        assert_eq!(read.data, json!(1));

        h.cache.wait_idle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let fresh: CacheRead<serde_json::Value> = h
            .cache
            .read(&key, failing_fetch(), ReadOptions::new(Priority::Critical))
            .await
            .unwrap();
        assert!(!fresh.is_stale);
        assert_eq!(fresh.data, json!(2));
    }

    #[tokio::test]
    async fn test_reconnected_announced_once_per_outage() {
        let h = make_cache();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = h.cache.subscribe(move |e| sink.lock().push(e.clone()));

        h.cache.monitor().report(ConnectivitySignal::with_downlink(50.0));
        h.cache.monitor().report(ConnectivitySignal::with_downlink(0.5));
        assert!(seen.lock().is_empty());

        h.cache.monitor().report(ConnectivitySignal::offline());
        h.cache.monitor().report(ConnectivitySignal::with_downlink(0.5));
        h.cache.monitor().report(ConnectivitySignal::with_downlink(50.0));
        assert_eq!(*seen.lock(), vec![CacheEvent::Reconnected]);
    }

    #[tokio::test]
    async fn test_superseded_write_is_discarded() {
        let h = make_cache();
        let key = CacheKey::new("team");
        let t0 = h.clock.now();

        h.cache.write(&key, &json!("new"), ReadOptions::default()).await.unwrap();
        let (_, applied) = h
            .cache
            .inner
            .store(
                &key,
                json!("old"),
                t0 - chrono::Duration::seconds(5),
                &ReadOptions::default(),
            )
            .await;

        assert!(!applied);
        let read = h
            .cache
            .read(&key, failing_fetch(), ReadOptions::default())
            .await
            .unwrap();
        assert_eq!(read.data, json!("new"));
        assert_eq!(h.cache.metrics().snapshot().writes_superseded, 1);
    }

    #[tokio::test]
    async fn test_events_and_invalidation() {
        let h = make_cache();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = h.cache.subscribe(move |e| sink.lock().push(e.clone()));

        let a = CacheKey::new("team");
        let b = CacheKey::new("services");
        h.cache.write(&a, &json!(1), ReadOptions::default()).await.unwrap();
        h.cache.write(&b, &json!(2), ReadOptions::default()).await.unwrap();
        h.cache.invalidate(&a).await;
        h.cache.invalidate_all().await;

        let seen = seen.lock();
        assert_eq!(
            *seen,
            vec![
                CacheEvent::Updated { key: a.clone() },
                CacheEvent::Updated { key: b.clone() },
                CacheEvent::Invalidated { key: a.clone() },
                CacheEvent::GlobalRefresh,
            ]
        );
        let stats = h.cache.stats();
        assert!(stats.per_tier.iter().all(|t| t.count == 0));
    }

    #[tokio::test]
    async fn test_large_payload_goes_to_bulk() {
        let h = make_cache();
        let key = CacheKey::new("gallery");
        let threshold = h.cache.policy().config().small_payload_threshold as usize;
        let big = json!({ "images": "x".repeat(threshold + 1) });

        h.cache.write(&key, &big, ReadOptions::default()).await.unwrap();
        let stats = h.cache.stats();
        assert_eq!(stats.tier(TierKind::DurableBulk).map(|t| t.count), Some(1));
        assert_eq!(stats.tier(TierKind::DurableKey).map(|t| t.count), Some(0));

        // Shrinking the payload moves it back to the key store
        h.clock.advance(chrono::Duration::seconds(1));
        h.cache.write(&key, &json!({"images": []}), ReadOptions::default()).await.unwrap();
        let stats = h.cache.stats();
        assert_eq!(stats.tier(TierKind::DurableBulk).map(|t| t.count), Some(0));
        assert_eq!(stats.tier(TierKind::DurableKey).map(|t| t.count), Some(1));
    }

    #[tokio::test]
    async fn test_schema_bump_treats_entries_as_absent() {
        let durable = Arc::new(DurableKeyStore::in_memory(&Default::default()));
        let key = CacheKey::new("team");

        let old = CacheOrchestrator::builder(CacheConfig::default())
            .durable_key(durable.clone())
            .build();
        old.write(&key, &json!("v1 payload"), ReadOptions::default()).await.unwrap();

        let config = CacheConfig {
            schema_version: "2".into(),
            ..CacheConfig::default()
        };
        let new = CacheOrchestrator::builder(config)
            .durable_key(durable.clone())
            .build();
        let read = new
            .read(&key, ok_fetch(json!("v2 payload")), ReadOptions::default())
            .await
            .unwrap();

        assert_eq!(read.source, Source::Remote);
        assert_eq!(read.data, json!("v2 payload"));
    }

    #[tokio::test]
    async fn test_purge_incompatible() {
        let durable = Arc::new(DurableKeyStore::in_memory(&Default::default()));
        let old = CacheOrchestrator::builder(CacheConfig::default())
            .durable_key(durable.clone())
            .build();
        for name in ["team", "services"] {
            old.write(&CacheKey::new(name), &json!(name), ReadOptions::default())
                .await
                .unwrap();
        }

        let config = CacheConfig {
            schema_version: "2".into(),
            ..CacheConfig::default()
        };
        let new = CacheOrchestrator::builder(config)
            .durable_key(durable.clone())
            .build();
        assert_eq!(new.purge_incompatible().await, 2);
        assert_eq!(durable.stats().count, 0);
    }

    #[tokio::test]
    async fn test_read_cached_view() {
        let h = make_cache();
        let view: CachedView<serde_json::Value> = h
            .cache
            .read_cached(&CacheKey::new("team"), failing_fetch(), ReadOptions::default())
            .await;
        assert_eq!(view.data, None);
        assert!(!view.is_loading);
        assert!(view.error.is_some());

        let view = h
            .cache
            .read_cached(&CacheKey::new("team"), ok_fetch(json!(1)), ReadOptions::default())
            .await;
        assert_eq!(view.data, Some(json!(1)));
        assert_eq!(view.error, None);
    }

    #[tokio::test]
    async fn test_prometheus_rendering() {
        let h = make_cache();
        h.cache
            .write(&CacheKey::new("team"), &json!(1), ReadOptions::default())
            .await
            .unwrap();
        let text = h.cache.encode_prometheus().unwrap();
        assert!(text.contains("driftcache_tier_entries{tier=\"durable-key\"} 1"));
    }
}
