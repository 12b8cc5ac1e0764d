//! driftcache - Network-Adaptive Multi-Tier Offline Cache
//!
//! Keeps remotely fetched content available across flaky and slow links.
//! Reads are answered from the fastest tier holding a copy, stale copies are
//! served immediately while a background refresh runs, and content is
//! preloaded in priority waves paced by the measured link quality.
//!
//! # Architecture
//!
//! ```text
//!              NetworkQualityMonitor ──tier──┐
//!                                            ▼
//!  consumer ─► CacheOrchestrator ◄──── CachePolicy (TTL, placement)
//!                  │        ▲
//!                  │        └──── ProgressiveLoader (critical → important → optional)
//!                  ▼
//!   EphemeralStore ─► DurableKeyStore ─► DurableBulkStore
//! ```
//!
//! # Modules
//!
//! - [`clock`] - Wall-clock abstraction for TTL arithmetic
//! - [`config`] - Deployment constants loaded from YAML
//! - [`entry`] - Cache keys, priorities and stored entries
//! - [`error`] - Error types
//! - [`events`] - Change notifications
//! - [`http`] - reqwest-backed remote fetcher
//! - [`loader`] - Progressive, wave-based preloading
//! - [`metrics`] - Counters and Prometheus text exposition
//! - [`network`] - Link-quality classification
//! - [`orchestrator`] - Stale-while-revalidate read/write path
//! - [`policy`] - TTL and tier placement decisions
//! - [`store`] - The three storage tiers

pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod events;
pub mod http;
pub mod loader;
pub mod metrics;
pub mod network;
pub mod orchestrator;
pub mod policy;
pub mod store;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, LoaderConfig, NetworkConfig, PolicyConfig, StoreConfig};
pub use entry::{CacheEntry, CacheKey, Priority, Validity};
pub use error::{Error, Result};
pub use events::{CacheEvent, Subscription};
pub use http::{HttpConfig, HttpFetcher};
pub use loader::{
    FetchFn, ItemOutcome, LoadItem, LoadPlan, LoadSummary, ProgressiveLoader, Wave, WaveReport,
};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use network::{ConnectivitySignal, NetworkQuality, NetworkQualityMonitor, NetworkTier};
pub use orchestrator::{
    CacheOrchestrator, CacheOrchestratorBuilder, CacheRead, CacheStats, CachedView, ReadOptions,
    Source,
};
pub use policy::{CachePolicy, PolicyDecision, TierKind};
pub use store::{
    DurableBulkStore, DurableKeyStore, EphemeralStore, TierStats, TierStore,
};
