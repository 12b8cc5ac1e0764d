//! Cache Configuration
//!
//! Static, per-deployment configuration supplied at orchestrator construction.
//! Loadable from YAML; every duration is written in milliseconds.
//!
//! ```yaml
//! schema_version: "2024-06"
//! policy:
//!   default_ttl_ms: 3600000
//!   category_ttls_ms:
//!     locations: 21600000
//!     promotions: 300000
//! stores:
//!   ephemeral_capacity: 256
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::entry::Priority;
use crate::error::{Error, Result};
use crate::network::NetworkTier;

const MINUTE: u64 = 60 * 1000;
const HOUR: u64 = 60 * MINUTE;

/// Top-level cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Schema version stamped on every entry; bumping it invalidates all
    /// previously persisted entries
    pub schema_version: String,
    /// TTL and tier-placement policy
    pub policy: PolicyConfig,
    /// Tier capacities
    pub stores: StoreConfig,
    /// Network classification
    pub network: NetworkConfig,
    /// Progressive loader pacing
    pub loader: LoaderConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            schema_version: "1".to_string(),
            policy: PolicyConfig::default(),
            stores: StoreConfig::default(),
            network: NetworkConfig::default(),
            loader: LoaderConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Parse a YAML document; missing sections fall back to defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: CacheConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&yaml)
    }

    /// Reject configurations the cache cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.schema_version.trim().is_empty() {
            return Err(Error::Config("schema_version must not be empty".into()));
        }
        if self.stores.ephemeral_capacity == 0
            || self.stores.durable_key_capacity == 0
            || self.stores.bulk_capacity == 0
        {
            return Err(Error::Config("tier capacities must be non-zero".into()));
        }
        if !(self.stores.eviction_fraction > 0.0 && self.stores.eviction_fraction <= 1.0) {
            return Err(Error::Config(format!(
                "eviction_fraction must be in (0, 1], got {}",
                self.stores.eviction_fraction
            )));
        }
        for priority in Priority::ALL {
            let m = self.policy.priority_multipliers.for_priority(priority);
            if !(m > 0.0 && m.is_finite()) {
                return Err(Error::Config(format!(
                    "priority multiplier for {} must be positive, got {}",
                    priority, m
                )));
            }
        }
        for tier in [NetworkTier::Fast, NetworkTier::Slow, NetworkTier::VerySlow] {
            if let Some(m) = self.policy.network_multipliers.for_tier(tier) {
                if !(m > 0.0 && m.is_finite()) {
                    return Err(Error::Config(format!(
                        "network multiplier for {} must be positive, got {}",
                        tier, m
                    )));
                }
            }
        }
        if self.network.very_slow_below_mbps > self.network.slow_below_mbps {
            return Err(Error::Config(format!(
                "very_slow_below_mbps ({}) exceeds slow_below_mbps ({})",
                self.network.very_slow_below_mbps, self.network.slow_below_mbps
            )));
        }
        for tier in [NetworkTier::Fast, NetworkTier::Slow, NetworkTier::VerySlow] {
            if self.loader.pacing(tier).batch_size == 0 {
                return Err(Error::Config(format!("batch_size for {} must be non-zero", tier)));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Policy
// =============================================================================

/// TTL tables and tier placement threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// TTL for categories missing from the table
    #[serde(rename = "default_ttl_ms", with = "duration_ms")]
    pub default_ttl: Duration,
    /// Base TTL per content category
    #[serde(rename = "category_ttls_ms", with = "duration_ms_map")]
    pub category_ttls: BTreeMap<String, Duration>,
    /// TTL multiplier per priority
    pub priority_multipliers: PriorityMultipliers,
    /// TTL multiplier per network tier (offline never expires)
    pub network_multipliers: NetworkMultipliers,
    /// Payloads up to this size go to the durable key store, larger ones to
    /// the bulk store
    pub small_payload_threshold: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let category_ttls = [
            ("locations", 6 * HOUR),
            ("team", 4 * HOUR),
            ("testimonials", 3 * HOUR),
            ("services", 2 * HOUR),
            ("statistics", HOUR),
            ("gallery", HOUR),
            ("promotions", 5 * MINUTE),
            ("availability", 2 * MINUTE),
        ]
        .into_iter()
        .map(|(name, ms)| (name.to_string(), Duration::from_millis(ms)))
        .collect();

        Self {
            default_ttl: Duration::from_millis(30 * MINUTE),
            category_ttls,
            priority_multipliers: PriorityMultipliers::default(),
            network_multipliers: NetworkMultipliers::default(),
            small_payload_threshold: 64 * 1024,
        }
    }
}

/// TTL multiplier per priority
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityMultipliers {
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl Default for PriorityMultipliers {
    fn default() -> Self {
        Self {
            critical: 1.0,
            high: 1.0,
            medium: 0.5,
            low: 0.25,
        }
    }
}

impl PriorityMultipliers {
    /// Multiplier for a priority
    pub fn for_priority(&self, priority: Priority) -> f64 {
        match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
        }
    }
}

/// TTL multiplier per network tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkMultipliers {
    pub fast: f64,
    pub slow: f64,
    pub very_slow: f64,
}

impl Default for NetworkMultipliers {
    fn default() -> Self {
        Self {
            fast: 1.0,
            slow: 4.0,
            very_slow: 24.0,
        }
    }
}

impl NetworkMultipliers {
    /// Multiplier for a network tier; `None` means unbounded (offline)
    pub fn for_tier(&self, tier: NetworkTier) -> Option<f64> {
        match tier {
            NetworkTier::Fast => Some(self.fast),
            NetworkTier::Slow => Some(self.slow),
            NetworkTier::VerySlow => Some(self.very_slow),
            NetworkTier::Offline => None,
        }
    }
}

// =============================================================================
// Stores
// =============================================================================

/// Tier capacity limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum entries held in memory
    pub ephemeral_capacity: usize,
    /// Maximum entries in the durable key store
    pub durable_key_capacity: usize,
    /// Maximum entries in the bulk store
    pub bulk_capacity: usize,
    /// Byte budget of the bulk store
    pub bulk_max_bytes: u64,
    /// Share of a full tier evicted in one pass
    pub eviction_fraction: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            ephemeral_capacity: 512,
            durable_key_capacity: 256,
            bulk_capacity: 4096,
            bulk_max_bytes: 256 * 1024 * 1024,
            eviction_fraction: 0.2,
        }
    }
}

/// Number of entries one eviction pass removes from a tier of `capacity`
pub fn eviction_batch(capacity: usize, fraction: f64) -> usize {
    ((capacity as f64 * fraction).ceil() as usize).max(1)
}

// =============================================================================
// Network
// =============================================================================

/// Network classification thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Downlink below this is `very-slow`
    pub very_slow_below_mbps: f64,
    /// Downlink below this is `slow`
    pub slow_below_mbps: f64,
    /// Minimum spacing between two tier-change notifications
    #[serde(rename = "debounce_ms", with = "duration_ms")]
    pub debounce: Duration,
    /// Classify an online host without bandwidth hints as `fast` (optimistic)
    /// rather than `slow` (conservative)
    pub assume_fast_without_hints: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            very_slow_below_mbps: 0.5,
            slow_below_mbps: 1.5,
            debounce: Duration::from_millis(1000),
            assume_fast_without_hints: true,
        }
    }
}

// =============================================================================
// Loader
// =============================================================================

/// Batch sizing and pacing for one network tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pacing {
    /// Items dispatched together
    pub batch_size: usize,
    /// Pause between batches of the same wave
    #[serde(rename = "batch_delay_ms", with = "duration_ms")]
    pub batch_delay: Duration,
    /// Pause between waves
    #[serde(rename = "wave_delay_ms", with = "duration_ms")]
    pub wave_delay: Duration,
}

/// Progressive loader configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Per-item fetch timeout
    #[serde(rename = "item_timeout_ms", with = "duration_ms")]
    pub item_timeout: Duration,
    pub fast: Pacing,
    pub slow: Pacing,
    pub very_slow: Pacing,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            item_timeout: Duration::from_secs(15),
            fast: Pacing {
                batch_size: 6,
                batch_delay: Duration::ZERO,
                wave_delay: Duration::from_millis(50),
            },
            slow: Pacing {
                batch_size: 3,
                batch_delay: Duration::from_millis(250),
                wave_delay: Duration::from_millis(500),
            },
            very_slow: Pacing {
                batch_size: 1,
                batch_delay: Duration::from_millis(1000),
                wave_delay: Duration::from_millis(2000),
            },
        }
    }
}

impl LoaderConfig {
    /// Pacing for a tier; offline uses the very-slow row
    pub fn pacing(&self, tier: NetworkTier) -> Pacing {
        match tier {
            NetworkTier::Fast => self.fast,
            NetworkTier::Slow => self.slow,
            NetworkTier::VerySlow | NetworkTier::Offline => self.very_slow,
        }
    }
}

// =============================================================================
// Serde helpers
// =============================================================================

/// `Duration` as integer milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// `Option<Duration>` as integer milliseconds or null
pub(crate) mod optional_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// `BTreeMap<String, Duration>` with millisecond values
pub(crate) mod duration_ms_map {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<String, Duration>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        map.iter()
            .map(|(k, v)| (k.as_str(), v.as_millis() as u64))
            .collect::<BTreeMap<_, _>>()
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<BTreeMap<String, Duration>, D::Error> {
        Ok(BTreeMap::<String, u64>::deserialize(d)?
            .into_iter()
            .map(|(k, v)| (k, Duration::from_millis(v)))
            .collect())
    }
}

// =============================================================================
// Tests
// =============================================================================
