//! Cache Entry Types
//!
//! The unit of storage shared by every tier, plus the key and priority types
//! it is addressed and ranked by.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Cache key - content category plus optional parameterization
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Separator between category and parameter
    pub const PARAM_SEPARATOR: char = '?';

    /// Create a key for a whole category
    pub fn new(category: impl Into<String>) -> Self {
        Self(category.into())
    }

    /// Create a key for a parameterized view of a category
    /// (e.g. `services?category=spa`)
    pub fn with_param(category: &str, param: &str) -> Self {
        if param.is_empty() {
            return Self::new(category);
        }
        Self(format!("{}{}{}", category, Self::PARAM_SEPARATOR, param))
    }

    /// Category part of the key
    pub fn category(&self) -> &str {
        self.0
            .split_once(Self::PARAM_SEPARATOR)
            .map(|(category, _)| category)
            .unwrap_or(&self.0)
    }

    /// Parameter part of the key, if any
    pub fn param(&self) -> Option<&str> {
        self.0
            .split_once(Self::PARAM_SEPARATOR)
            .map(|(_, param)| param)
    }

    /// Full key string
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Priority of a cached item
///
/// Drives TTL scaling, eviction order and preload sequencing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Needed for first paint
    Critical,
    /// Needed soon after first paint
    High,
    /// Standard content
    #[default]
    Medium,
    /// Nice to have
    Low,
}

impl Priority {
    /// All priorities, most important first
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    /// Eviction band (higher = evicted earlier)
    #[inline]
    pub fn eviction_band(&self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Validity of an entry at a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    /// Within its TTL and written by the running schema
    Fresh,
    /// TTL elapsed; still usable as a fallback while a refresh runs
    Stale,
    /// Written by another schema version; logically absent
    Incompatible,
}

/// Cache entry containing the payload and its lifecycle metadata
///
/// This is also the persisted record layout of the durable tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Key this entry is stored under
    pub key: CacheKey,
    /// Cached payload
    pub data: serde_json::Value,
    /// When the value was requested from the origin
    pub written_at: DateTime<Utc>,
    /// Validity window from `written_at` (`None` = never auto-expire)
    #[serde(rename = "ttl_ms", with = "crate::config::optional_duration_ms")]
    pub ttl: Option<Duration>,
    /// Schema version the entry was written under
    pub schema_version: String,
    /// Priority band
    pub priority: Priority,
    /// Serialized payload size estimate in bytes
    pub size_bytes: u64,
}

impl CacheEntry {
    /// Create a new entry; the size estimate is computed from the payload
    pub fn new(
        key: CacheKey,
        data: serde_json::Value,
        written_at: DateTime<Utc>,
        ttl: Option<Duration>,
        schema_version: impl Into<String>,
        priority: Priority,
    ) -> Self {
        let size_bytes = estimate_size(&data);
        Self {
            key,
            data,
            written_at,
            ttl,
            schema_version: schema_version.into(),
            priority,
            size_bytes,
        }
    }

    /// Classify the entry at `now` against the running schema version
    pub fn validity(&self, now: DateTime<Utc>, schema_version: &str) -> Validity {
        if self.schema_version != schema_version {
            return Validity::Incompatible;
        }
        if self.is_expired(now) {
            Validity::Stale
        } else {
            Validity::Fresh
        }
    }

    /// Check if the TTL has elapsed at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at() {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }

    /// Instant the entry turns stale
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(self.ttl?).ok()?;
        self.written_at.checked_add_signed(ttl)
    }

    /// Sort key for eviction: lowest priority band first, then oldest first
    #[inline]
    pub fn eviction_key(&self) -> (std::cmp::Reverse<u8>, DateTime<Utc>) {
        (std::cmp::Reverse(self.priority.eviction_band()), self.written_at)
    }

    /// Decode the payload into a typed value
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// Serialized size of a JSON payload
pub fn estimate_size(data: &serde_json::Value) -> u64 {
    data.to_string().len() as u64
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn make_entry(ttl: Option<Duration>) -> CacheEntry {
        CacheEntry::new(
            CacheKey::new("statistics"),
            json!({"visitors": 1200}),
            Utc::now(),
            ttl,
            "v1",
            Priority::Medium,
        )
    }

    #[test]
    fn test_cache_key_parts() {
        let key = CacheKey::with_param("services", "category=spa");
        assert_eq!(key.as_str(), "services?category=spa");
        assert_eq!(key.category(), "services");
        assert_eq!(key.param(), Some("category=spa"));

        let plain = CacheKey::new("locations");
        assert_eq!(plain.category(), "locations");
        assert_eq!(plain.param(), None);

        assert_eq!(CacheKey::with_param("locations", ""), plain);
    }

    #[test]
    fn test_entry_validity_windows() {
        let entry = make_entry(Some(Duration::from_secs(60)));
        let t0 = entry.written_at;

        assert_eq!(entry.validity(t0, "v1"), Validity::Fresh);
        assert_eq!(
            entry.validity(t0 + ChronoDuration::seconds(59), "v1"),
            Validity::Fresh
        );
        assert_eq!(
            entry.validity(t0 + ChronoDuration::seconds(60), "v1"),
            Validity::Stale
        );
        assert_eq!(entry.validity(t0, "v2"), Validity::Incompatible);
    }

    #[test]
    fn test_entry_without_ttl_never_expires() {
        let entry = make_entry(None);
        let far = entry.written_at + ChronoDuration::days(3650);
        assert!(!entry.is_expired(far));
        assert_eq!(entry.expires_at(), None);
    }

    #[test]
    fn test_entry_size_estimate() {
        let entry = make_entry(None);
        assert_eq!(entry.size_bytes, r#"{"visitors":1200}"#.len() as u64);
    }

    #[test]
    fn test_entry_persisted_layout() {
        let entry = make_entry(Some(Duration::from_millis(1500)));
        let json = serde_json::to_value(&entry).unwrap();

        assert_eq!(json["key"], "statistics");
        assert_eq!(json["ttl_ms"], 1500);
        assert_eq!(json["schema_version"], "v1");
        assert_eq!(json["priority"], "medium");

        let back: CacheEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_eviction_key_orders_low_priority_first() {
        let now = Utc::now();
        let mut low = make_entry(None);
        low.priority = Priority::Low;
        low.written_at = now;
        let mut critical = make_entry(None);
        critical.priority = Priority::Critical;
        critical.written_at = now - ChronoDuration::hours(1);

        assert!(low.eviction_key() < critical.eviction_key());
    }

    #[test]
    fn test_decode_typed_payload() {
        #[derive(Deserialize)]
        struct Stats {
            visitors: u32,
        }
        let stats: Stats = make_entry(None).decode().unwrap();
        assert_eq!(stats.visitors, 1200);
    }
}
