//! Progressive Loader - priority waves paced by link quality
//!
//! Preloads content in three ordered waves (critical, important, optional).
//! Each wave is cut into batches whose size and spacing follow the current
//! network tier; items in a batch settle independently under a per-item
//! timeout. Successful results are written through the attached
//! [`CacheOrchestrator`] and every finished wave is reported on a channel.
//!
//! ```text
//!  LoadPlan ─► queue [critical, important, optional]
//!                 │
//!                 ▼ per wave
//!        ┌──── batch (size by tier) ───┐
//!        │ item ─ timeout ─► write     │  join_all
//!        │ item ─ timeout ─► write     │
//!        └─────────────┬───────────────┘
//!                      │ batch delay, next batch
//!                      ▼
//!                 WaveReport ─► mpsc ─► wave delay ─► next wave
//! ```
//!
//! `abandon()` clears the queue; batches already dispatched still settle,
//! and the next queued plan runs normally. `teardown()` also discards
//! whatever those batches produce and retires the loader for good.
//!
//! Items are fetched through the orchestrator's in-flight map, so a read of
//! a key that is being preloaded waits for the same fetch instead of issuing
//! its own.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::LoaderConfig;
use crate::entry::{CacheKey, Priority};
use crate::error::Error;
use crate::metrics::LatencyTracker;
use crate::network::NetworkTier;
use crate::orchestrator::{CacheOrchestrator, ReadOptions};

/// Fetcher producing the raw payload for one key
pub type FetchFn =
    Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<serde_json::Value>> + Send + Sync>;

/// One key to preload
#[derive(Clone)]
pub struct LoadItem {
    pub key: CacheKey,
    /// Category used for TTL lookup; defaults to the key's category
    pub category: Option<String>,
    pub fetch: FetchFn,
}

impl LoadItem {
    /// Create an item from an async fetcher
    pub fn new<F, Fut>(key: CacheKey, fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        Self {
            key,
            category: None,
            fetch: Arc::new(move || fetch().boxed()),
        }
    }

    /// Create an item from an already boxed fetcher
    pub fn from_fn(key: CacheKey, fetch: FetchFn) -> Self {
        Self {
            key,
            category: None,
            fetch,
        }
    }

    /// Override the TTL category
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

impl std::fmt::Debug for LoadItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadItem")
            .field("key", &self.key)
            .field("category", &self.category)
            .finish_non_exhaustive()
    }
}

/// Keys to preload, partitioned by importance
#[derive(Debug, Clone, Default)]
pub struct LoadPlan {
    pub critical: Vec<LoadItem>,
    pub important: Vec<LoadItem>,
    pub optional: Vec<LoadItem>,
}

impl LoadPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn critical(mut self, item: LoadItem) -> Self {
        self.critical.push(item);
        self
    }

    pub fn important(mut self, item: LoadItem) -> Self {
        self.important.push(item);
        self
    }

    pub fn optional(mut self, item: LoadItem) -> Self {
        self.optional.push(item);
        self
    }

    /// Total number of items across waves
    pub fn len(&self) -> usize {
        self.critical.len() + self.important.len() + self.optional.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn into_waves(self) -> [(Wave, Vec<LoadItem>); 3] {
        [
            (Wave::Critical, self.critical),
            (Wave::Important, self.important),
            (Wave::Optional, self.optional),
        ]
    }
}

/// Preload wave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Wave {
    Critical,
    Important,
    Optional,
}

impl Wave {
    /// Waves in dispatch order
    pub const ALL: [Wave; 3] = [Wave::Critical, Wave::Important, Wave::Optional];

    /// Priority given to entries loaded by this wave
    pub fn priority(&self) -> Priority {
        match self {
            Wave::Critical => Priority::Critical,
            Wave::Important => Priority::High,
            Wave::Optional => Priority::Low,
        }
    }
}

impl std::fmt::Display for Wave {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Wave::Critical => write!(f, "critical"),
            Wave::Important => write!(f, "important"),
            Wave::Optional => write!(f, "optional"),
        }
    }
}

/// How a single item settled
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum ItemOutcome {
    /// Fetched and stored
    Loaded,
    /// Fetched, but a newer write for the key was already held
    Superseded,
    /// Fetcher returned an error
    Failed(String),
    /// Fetcher did not settle within the item timeout
    TimedOut,
    /// Not dispatched (offline or abandoned)
    Skipped,
}

impl ItemOutcome {
    /// Whether the fetch itself succeeded
    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Loaded | ItemOutcome::Superseded)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemReport {
    pub key: CacheKey,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
}

/// Result of one finished wave
#[derive(Debug, Clone, Serialize)]
pub struct WaveReport {
    pub wave: Wave,
    pub items: Vec<ItemReport>,
    /// Network tier when the wave finished
    pub network: NetworkTier,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_elapsed")]
    pub elapsed: Duration,
}

impl WaveReport {
    pub fn loaded(&self) -> usize {
        self.items.iter().filter(|i| i.outcome.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, ItemOutcome::Failed(_) | ItemOutcome::TimedOut))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.outcome == ItemOutcome::Skipped)
            .count()
    }

    /// Outcome recorded for a key
    pub fn outcome(&self, key: &CacheKey) -> Option<&ItemOutcome> {
        self.items
            .iter()
            .find(|i| &i.key == key)
            .map(|i| &i.outcome)
    }
}

fn serialize_elapsed<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Everything a run reported
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadSummary {
    pub waves: Vec<WaveReport>,
    /// Run stopped before the queue drained
    pub abandoned: bool,
}

impl LoadSummary {
    pub fn wave(&self, wave: Wave) -> Option<&WaveReport> {
        self.waves.iter().find(|w| w.wave == wave)
    }

    pub fn loaded(&self) -> usize {
        self.waves.iter().map(WaveReport::loaded).sum()
    }

    pub fn failed(&self) -> usize {
        self.waves.iter().map(WaveReport::failed).sum()
    }
}

struct LoaderState {
    cache: CacheOrchestrator,
    config: LoaderConfig,
    /// Waves not yet started
    queue: Mutex<VecDeque<(Wave, Vec<LoadItem>)>>,
    /// Cancelled by `abandon`; replaced when a plan is queued afterwards.
    /// Locked after `queue` when both are needed.
    abandon: Mutex<CancellationToken>,
    /// Set by `teardown`; results are discarded once set
    torn_down: AtomicBool,
}

/// Priority-wave preloader bound to one orchestrator
#[derive(Clone)]
pub struct ProgressiveLoader {
    state: Arc<LoaderState>,
}

impl ProgressiveLoader {
    /// Create a loader using the orchestrator's loader configuration
    pub fn new(cache: CacheOrchestrator) -> Self {
        let config = cache.config().loader.clone();
        Self::with_config(cache, config)
    }

    pub fn with_config(cache: CacheOrchestrator, config: LoaderConfig) -> Self {
        Self {
            state: Arc::new(LoaderState {
                cache,
                config,
                queue: Mutex::new(VecDeque::new()),
                abandon: Mutex::new(CancellationToken::new()),
                torn_down: AtomicBool::new(false),
            }),
        }
    }

    /// Queue a plan and run it in the background, reporting each wave on
    /// the returned channel. The channel closes when the run ends.
    pub fn start(&self, plan: LoadPlan) -> mpsc::Receiver<WaveReport> {
        let (tx, rx) = mpsc::channel(Wave::ALL.len());
        self.enqueue(plan);
        let loader = self.clone();
        tokio::spawn(async move {
            loader.drive(Some(tx)).await;
        });
        rx
    }

    /// Queue a plan and run it to completion
    pub async fn run(&self, plan: LoadPlan) -> LoadSummary {
        self.enqueue(plan);
        self.drive(None).await
    }

    /// Drop every wave that has not started yet; a plan queued afterwards
    /// runs normally
    pub fn abandon(&self) {
        let dropped = {
            let mut queue = self.state.queue.lock();
            let dropped = queue.len();
            queue.clear();
            self.state.abandon.lock().cancel();
            dropped
        };
        info!(dropped_waves = dropped, "Progressive load abandoned");
    }

    /// Abandon, discard results of batches still in flight, and ignore any
    /// later plan
    pub fn teardown(&self) {
        self.state.torn_down.store(true, Ordering::SeqCst);
        self.abandon();
    }

    pub fn is_abandoned(&self) -> bool {
        self.state.abandon.lock().is_cancelled()
    }

    pub fn is_torn_down(&self) -> bool {
        self.state.torn_down.load(Ordering::SeqCst)
    }

    /// Waves still queued
    pub fn pending_waves(&self) -> Vec<Wave> {
        self.state.queue.lock().iter().map(|(w, _)| *w).collect()
    }

    fn enqueue(&self, plan: LoadPlan) {
        let mut queue = self.state.queue.lock();
        if self.is_torn_down() {
            debug!(items = plan.len(), "Loader torn down, ignoring plan");
            return;
        }
        {
            let mut abandon = self.state.abandon.lock();
            if abandon.is_cancelled() {
                *abandon = CancellationToken::new();
            }
        }
        for (wave, items) in plan.into_waves() {
            if !items.is_empty() {
                queue.push_back((wave, items));
            }
        }
    }

    #[instrument(skip(self, tx))]
    async fn drive(&self, tx: Option<mpsc::Sender<WaveReport>>) -> LoadSummary {
        let mut summary = LoadSummary::default();
        // Token of the plan being driven; a later plan gets a fresh one
        let abandon = self.state.abandon.lock().clone();

        loop {
            let next = {
                let mut queue = self.state.queue.lock();
                if abandon.is_cancelled() {
                    None
                } else {
                    queue.pop_front()
                }
            };
            let Some((wave, items)) = next else {
                break;
            };

            if !summary.waves.is_empty() {
                let delay = self.pacing().wave_delay;
                if !pause(delay, &abandon).await {
                    break;
                }
            }

            let report = self.run_wave(wave, items, &abandon).await;
            if self.is_torn_down() {
                debug!(%wave, "Loader torn down, dropping wave report");
                break;
            }

            info!(
                %wave,
                loaded = report.loaded(),
                failed = report.failed(),
                skipped = report.skipped(),
                network = %report.network,
                "Wave complete"
            );

            if let Some(tx) = &tx {
                if tx.send(report.clone()).await.is_err() {
                    debug!("Wave report receiver dropped");
                }
            }
            summary.waves.push(report);
        }

        summary.abandoned = abandon.is_cancelled();
        summary
    }

    async fn run_wave(
        &self,
        wave: Wave,
        items: Vec<LoadItem>,
        abandon: &CancellationToken,
    ) -> WaveReport {
        let tracker = LatencyTracker::start();
        let mut remaining: VecDeque<LoadItem> = items.into();
        let mut reports = Vec::with_capacity(remaining.len());
        let mut first_batch = true;

        while !remaining.is_empty() {
            if !first_batch {
                // A cancelled pause falls through to the abandon check below
                let _ = pause(self.pacing().batch_delay, abandon).await;
            }
            first_batch = false;

            let tier = self.state.cache.monitor().tier();
            if tier == NetworkTier::Offline || abandon.is_cancelled() {
                debug!(%wave, %tier, remaining = remaining.len(), "Skipping undispatched items");
                reports.extend(remaining.drain(..).map(|item| ItemReport {
                    key: item.key,
                    outcome: ItemOutcome::Skipped,
                }));
                break;
            }

            let take = self
                .state
                .config
                .pacing(tier)
                .batch_size
                .max(1)
                .min(remaining.len());
            let batch: Vec<LoadItem> = remaining.drain(..take).collect();
            debug!(%wave, %tier, size = batch.len(), "Dispatching batch");

            let settled = join_all(batch.into_iter().map(|item| self.load_item(item, wave))).await;
            reports.extend(settled);
        }

        WaveReport {
            wave,
            items: reports,
            network: self.state.cache.monitor().tier(),
            elapsed: tracker.elapsed(),
        }
    }

    /// Fetch one item through the cache, joining a read of the same key if
    /// one is already in flight
    async fn load_item(&self, item: LoadItem, wave: Wave) -> ItemReport {
        let cache = &self.state.cache;
        let timeout = self.state.config.item_timeout;
        let mut opts = ReadOptions::new(wave.priority());
        opts.category = item.category.clone();

        let fetch = item.fetch.clone();
        let state = Arc::downgrade(&self.state);
        let pending = cache.fetch_shared(
            &item.key,
            move || async move {
                let value = fetch().await?;
                if state
                    .upgrade()
                    .is_some_and(|s| s.torn_down.load(Ordering::SeqCst))
                {
                    anyhow::bail!("loader torn down before the fetch settled");
                }
                anyhow::Ok(value)
            },
            opts,
        );

        let outcome = match tokio::time::timeout(timeout, pending.clone()).await {
            Ok(Ok((_, true))) => ItemOutcome::Loaded,
            Ok(Ok((_, false))) => ItemOutcome::Superseded,
            Ok(Err(_)) if self.is_torn_down() => {
                debug!(key = %item.key, "Loader torn down, dropping result");
                ItemOutcome::Skipped
            }
            Ok(Err(reason)) => {
                let err = Error::FetchFailed {
                    key: item.key.to_string(),
                    reason: reason.clone(),
                };
                warn!("{}", err);
                ItemOutcome::Failed(reason)
            }
            Err(_) => {
                cache.release_fetch(&item.key, &pending);
                let err = Error::FetchTimeout {
                    key: item.key.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                };
                warn!("{}", err);
                ItemOutcome::TimedOut
            }
        };

        ItemReport {
            key: item.key,
            outcome,
        }
    }

    fn pacing(&self) -> crate::config::Pacing {
        self.state.config.pacing(self.state.cache.monitor().tier())
    }
}

/// Sleep unless abandoned first; returns false when cut short
async fn pause(delay: Duration, abandon: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !abandon.is_cancelled();
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = abandon.cancelled() => false,
    }
}

// =============================================================================
// Tests
// =============================================================================
