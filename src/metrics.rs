//! Cache Metrics Collection
//!
//! Counters for read outcomes, fetches and background refreshes, with a
//! Prometheus text rendering for scraping or dumping at exit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::store::TierStats;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Read outcomes
    memory_hits: AtomicU64,
    durable_hits: AtomicU64,
    remote_reads: AtomicU64,
    stale_served: AtomicU64,
    dedup_joins: AtomicU64,

    // Origin fetches
    fetches: AtomicU64,
    fetch_failures: AtomicU64,
    fetch_latency_us: AtomicU64,

    // Background refresh
    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
    refreshes_skipped_offline: AtomicU64,

    // Writes and removal
    writes: AtomicU64,
    writes_superseded: AtomicU64,
    incompatible_purged: AtomicU64,
    invalidations: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_memory_hit(&self) {
        self.memory_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_durable_hit(&self) {
        self.durable_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remote_read(&self) {
        self.remote_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_served(&self) {
        self.stale_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dedup_join(&self) {
        self.dedup_joins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch(&self, latency: Duration, success: bool) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.fetch_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.update_latency_ema(&self.fetch_latency_us, latency);
    }

    pub fn record_refresh(&self, success: bool) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.refresh_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_refresh_skipped(&self) {
        self.refreshes_skipped_offline
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_superseded(&self) {
        self.writes_superseded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_incompatible_purge(&self) {
        self.incompatible_purged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    fn update_latency_ema(&self, target: &AtomicU64, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1; // EMA smoothing factor

        loop {
            let current = target.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if target
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Smoothed origin fetch latency
    pub fn fetch_latency(&self) -> Duration {
        Duration::from_micros(self.fetch_latency_us.load(Ordering::Relaxed))
    }

    /// Share of reads answered without contacting the origin
    pub fn hit_ratio(&self) -> f64 {
        let hits = (self.memory_hits.load(Ordering::Relaxed)
            + self.durable_hits.load(Ordering::Relaxed)) as f64;
        let total = hits + self.remote_reads.load(Ordering::Relaxed) as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            durable_hits: self.durable_hits.load(Ordering::Relaxed),
            remote_reads: self.remote_reads.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            dedup_joins: self.dedup_joins.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            fetch_latency: self.fetch_latency(),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
            refreshes_skipped_offline: self.refreshes_skipped_offline.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            writes_superseded: self.writes_superseded.load(Ordering::Relaxed),
            incompatible_purged: self.incompatible_purged.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
        }
    }

    /// Render counters and per-tier gauges in the Prometheus text format
    pub fn encode_prometheus(&self, tiers: &[TierStats]) -> Result<String> {
        let snapshot = self.snapshot();
        let registry = Registry::new_custom(Some("driftcache".to_string()), None)
            .map_err(prometheus_error)?;

        let reads = IntCounterVec::new(
            Opts::new("reads_total", "Reads by the source that answered them"),
            &["source"],
        )
        .map_err(prometheus_error)?;
        reads
            .with_label_values(&["memory"])
            .inc_by(snapshot.memory_hits);
        reads
            .with_label_values(&["durable"])
            .inc_by(snapshot.durable_hits);
        reads
            .with_label_values(&["remote"])
            .inc_by(snapshot.remote_reads);
        registry
            .register(Box::new(reads))
            .map_err(prometheus_error)?;

        let events = IntCounterVec::new(
            Opts::new("events_total", "Cache lifecycle events"),
            &["event"],
        )
        .map_err(prometheus_error)?;
        for (label, value) in [
            ("stale_served", snapshot.stale_served),
            ("dedup_join", snapshot.dedup_joins),
            ("fetch", snapshot.fetches),
            ("fetch_failure", snapshot.fetch_failures),
            ("refresh", snapshot.refreshes),
            ("refresh_failure", snapshot.refresh_failures),
            ("refresh_skipped_offline", snapshot.refreshes_skipped_offline),
            ("write", snapshot.writes),
            ("write_superseded", snapshot.writes_superseded),
            ("incompatible_purged", snapshot.incompatible_purged),
            ("invalidation", snapshot.invalidations),
        ] {
            events.with_label_values(&[label]).inc_by(value);
        }
        registry
            .register(Box::new(events))
            .map_err(prometheus_error)?;

        let entries = IntGaugeVec::new(
            Opts::new("tier_entries", "Entries held per tier"),
            &["tier"],
        )
        .map_err(prometheus_error)?;
        let bytes = IntGaugeVec::new(
            Opts::new("tier_bytes", "Approximate bytes held per tier"),
            &["tier"],
        )
        .map_err(prometheus_error)?;
        for stats in tiers {
            let tier = stats.tier.to_string();
            entries
                .with_label_values(&[tier.as_str()])
                .set(stats.count as i64);
            bytes
                .with_label_values(&[tier.as_str()])
                .set(stats.approx_bytes as i64);
        }
        registry
            .register(Box::new(entries))
            .map_err(prometheus_error)?;
        registry
            .register(Box::new(bytes))
            .map_err(prometheus_error)?;

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .map_err(prometheus_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }

    /// Reset all metrics
    pub fn reset(&self) {
        for counter in [
            &self.memory_hits,
            &self.durable_hits,
            &self.remote_reads,
            &self.stale_served,
            &self.dedup_joins,
            &self.fetches,
            &self.fetch_failures,
            &self.fetch_latency_us,
            &self.refreshes,
            &self.refresh_failures,
            &self.refreshes_skipped_offline,
            &self.writes,
            &self.writes_superseded,
            &self.incompatible_purged,
            &self.invalidations,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

fn prometheus_error(e: impl std::fmt::Display) -> Error {
    Error::Internal(format!("metrics encoding failed: {}", e))
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    // Reads
    pub memory_hits: u64,
    pub durable_hits: u64,
    pub remote_reads: u64,
    pub stale_served: u64,
    pub dedup_joins: u64,

    // Fetches
    pub fetches: u64,
    pub fetch_failures: u64,
    pub fetch_latency: Duration,

    // Refresh
    pub refreshes: u64,
    pub refresh_failures: u64,
    pub refreshes_skipped_offline: u64,

    // Writes
    pub writes: u64,
    pub writes_superseded: u64,
    pub incompatible_purged: u64,
    pub invalidations: u64,

    // Overall
    pub hit_ratio: f64,
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::TierKind;

    #[test]
    fn test_hit_ratio() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.hit_ratio(), 0.0);

        metrics.record_memory_hit();
        metrics.record_memory_hit();
        metrics.record_durable_hit();
        metrics.record_remote_read();

        assert!((metrics.hit_ratio() - 0.75).abs() < 0.001);
    }

    #[test]
    fn test_fetch_latency_ema() {
        let metrics = CacheMetrics::new();

        metrics.record_fetch(Duration::from_micros(100), true);
        assert_eq!(metrics.fetch_latency(), Duration::from_micros(100));

        metrics.record_fetch(Duration::from_micros(200), false);
        let latency = metrics.fetch_latency().as_micros();
        assert!(latency > 100 && latency < 200);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.fetches, 2);
        assert_eq!(snapshot.fetch_failures, 1);
    }

    #[test]
    fn test_refresh_tracking() {
        let metrics = CacheMetrics::new();
        metrics.record_refresh(true);
        metrics.record_refresh(false);
        metrics.record_refresh_skipped();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.refreshes, 2);
        assert_eq!(snapshot.refresh_failures, 1);
        assert_eq!(snapshot.refreshes_skipped_offline, 1);
    }

    #[test]
    fn test_reset() {
        let metrics = CacheMetrics::new();
        metrics.record_memory_hit();
        metrics.record_write();
        metrics.record_invalidation();

        metrics.reset();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.memory_hits, 0);
        assert_eq!(snapshot.writes, 0);
        assert_eq!(snapshot.invalidations, 0);
    }

    #[test]
    fn test_prometheus_text() {
        let metrics = CacheMetrics::new();
        metrics.record_memory_hit();
        metrics.record_stale_served();

        let tiers = vec![TierStats {
            tier: TierKind::Ephemeral,
            count: 3,
            approx_bytes: 1200,
            capacity: 10,
            hits: 1,
            misses: 0,
            evictions: 0,
            dropped_writes: 0,
        }];
        let text = metrics.encode_prometheus(&tiers).unwrap();

        assert!(text.contains("driftcache_reads_total{source=\"memory\"} 1"));
        assert!(text.contains("driftcache_events_total{event=\"stale_served\"} 1"));
        assert!(text.contains("driftcache_tier_entries{tier=\"ephemeral\"} 3"));
        assert!(text.contains("driftcache_tier_bytes{tier=\"ephemeral\"} 1200"));
    }

    #[test]
    fn test_latency_tracker() {
        let tracker = LatencyTracker::start();
        std::thread::sleep(Duration::from_millis(10));
        assert!(tracker.elapsed() >= Duration::from_millis(10));
    }
}
