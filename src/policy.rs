//! Cache TTL and Placement Policy
//!
//! Pure mapping from (category, priority, network quality, payload size) to a
//! time-to-live and the set of tiers an entry is written to.
//!
//! ```text
//! ttl = base(category) × priority multiplier × network multiplier
//!
//!            critical  high  medium  low         fast  slow  very-slow  offline
//! priority     ×1       ×1    ×0.5   ×0.25  net   ×1    ×4     ×24        ∞
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::PolicyConfig;
use crate::entry::Priority;
use crate::network::NetworkTier;

/// Storage tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TierKind {
    /// In-process memory (hot)
    Ephemeral,
    /// Small synchronous durable store
    DurableKey,
    /// Large asynchronous durable store
    DurableBulk,
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TierKind::Ephemeral => write!(f, "ephemeral"),
            TierKind::DurableKey => write!(f, "durable-key"),
            TierKind::DurableBulk => write!(f, "durable-bulk"),
        }
    }
}

/// Outcome of a policy resolution
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDecision {
    /// Effective TTL (`None` = never auto-expire)
    pub ttl: Option<Duration>,
    /// Tiers to write through, fastest first
    pub tiers: Vec<TierKind>,
}

impl PolicyDecision {
    /// Check if the decision includes a tier
    pub fn includes(&self, tier: TierKind) -> bool {
        self.tiers.contains(&tier)
    }
}

/// TTL and placement policy
#[derive(Debug, Clone)]
pub struct CachePolicy {
    config: PolicyConfig,
}

impl CachePolicy {
    /// Create a policy from its configuration
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    /// Resolve TTL and tiers for an entry
    pub fn resolve(
        &self,
        category: &str,
        priority: Priority,
        network: NetworkTier,
        size_estimate: u64,
    ) -> PolicyDecision {
        PolicyDecision {
            ttl: self.effective_ttl(category, priority, network),
            tiers: self.tiers_for_size(size_estimate),
        }
    }

    /// Base TTL for a category
    pub fn base_ttl(&self, category: &str) -> Duration {
        self.config
            .category_ttls
            .get(category)
            .copied()
            .unwrap_or(self.config.default_ttl)
    }

    /// TTL after priority and network scaling
    pub fn effective_ttl(
        &self,
        category: &str,
        priority: Priority,
        network: NetworkTier,
    ) -> Option<Duration> {
        let network_factor = self.config.network_multipliers.for_tier(network)?;
        let priority_factor = self.config.priority_multipliers.for_priority(priority);
        let secs = self.base_ttl(category).as_secs_f64() * priority_factor * network_factor;

        // Overflowing windows are as good as unbounded
        Duration::try_from_secs_f64(secs).ok()
    }

    /// Tier placement by payload size; memory is always included
    pub fn tiers_for_size(&self, size_estimate: u64) -> Vec<TierKind> {
        if size_estimate <= self.config.small_payload_threshold {
            vec![TierKind::Ephemeral, TierKind::DurableKey]
        } else {
            vec![TierKind::Ephemeral, TierKind::DurableBulk]
        }
    }

    /// Get configuration
    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::new(PolicyConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MINUTE: Duration = Duration::from_secs(60);

    fn policy_with_hourly(category: &str) -> CachePolicy {
        let mut config = PolicyConfig::default();
        config
            .category_ttls
            .insert(category.to_string(), 60 * MINUTE);
        CachePolicy::new(config)
    }

    #[test]
    fn test_medium_priority_on_slow_network() {
        let policy = policy_with_hourly("statistics");
        let ttl = policy.effective_ttl("statistics", Priority::Medium, NetworkTier::Slow);
        assert_eq!(ttl, Some(120 * MINUTE));
    }

    #[test]
    fn test_priority_multipliers() {
        let policy = policy_with_hourly("statistics");
        let ttl = |p| policy.effective_ttl("statistics", p, NetworkTier::Fast);

        assert_eq!(ttl(Priority::Critical), Some(60 * MINUTE));
        assert_eq!(ttl(Priority::High), Some(60 * MINUTE));
        assert_eq!(ttl(Priority::Medium), Some(30 * MINUTE));
        assert_eq!(ttl(Priority::Low), Some(15 * MINUTE));
    }

    #[test]
    fn test_network_multipliers() {
        let policy = policy_with_hourly("statistics");
        let ttl = |n| policy.effective_ttl("statistics", Priority::Critical, n);

        assert_eq!(ttl(NetworkTier::Fast), Some(60 * MINUTE));
        assert_eq!(ttl(NetworkTier::Slow), Some(240 * MINUTE));
        assert_eq!(ttl(NetworkTier::VerySlow), Some(24 * 60 * MINUTE));
        assert_eq!(ttl(NetworkTier::Offline), None);
    }

    #[test]
    fn test_unknown_category_uses_default() {
        let policy = CachePolicy::default();
        assert_eq!(policy.base_ttl("no-such-category"), 30 * MINUTE);
        assert!(policy.base_ttl("locations") > policy.base_ttl("promotions"));
    }

    #[test]
    fn test_tier_selection_by_size() {
        let policy = CachePolicy::default();
        let threshold = policy.config().small_payload_threshold;

        let small = policy.resolve("team", Priority::High, NetworkTier::Fast, 512);
        assert_eq!(small.tiers, vec![TierKind::Ephemeral, TierKind::DurableKey]);

        let edge = policy.tiers_for_size(threshold);
        assert_eq!(edge, vec![TierKind::Ephemeral, TierKind::DurableKey]);

        let large = policy.resolve("gallery", Priority::Low, NetworkTier::Fast, threshold + 1);
        assert_eq!(large.tiers, vec![TierKind::Ephemeral, TierKind::DurableBulk]);
        assert!(large.includes(TierKind::Ephemeral));
        assert!(!large.includes(TierKind::DurableKey));
    }

    #[test]
    fn test_tier_display() {
        assert_eq!(TierKind::Ephemeral.to_string(), "ephemeral");
        assert_eq!(TierKind::DurableKey.to_string(), "durable-key");
        assert_eq!(TierKind::DurableBulk.to_string(), "durable-bulk");
    }

    fn any_priority() -> impl Strategy<Value = Priority> {
        prop_oneof![
            Just(Priority::Critical),
            Just(Priority::High),
            Just(Priority::Medium),
            Just(Priority::Low),
        ]
    }

    proptest! {
        #[test]
        fn prop_slower_network_never_shortens_ttl(
            base_minutes in 1u64..10_000,
            priority in any_priority(),
        ) {
            let mut config = PolicyConfig::default();
            config.category_ttls.insert("c".into(), Duration::from_secs(base_minutes * 60));
            let policy = CachePolicy::new(config);

            let fast = policy.effective_ttl("c", priority, NetworkTier::Fast).unwrap();
            let slow = policy.effective_ttl("c", priority, NetworkTier::Slow).unwrap();
            let very_slow = policy.effective_ttl("c", priority, NetworkTier::VerySlow).unwrap();

            prop_assert!(fast <= slow);
            prop_assert!(slow <= very_slow);
            prop_assert!(policy.effective_ttl("c", priority, NetworkTier::Offline).is_none());
        }

        #[test]
        fn prop_lower_priority_never_lengthens_ttl(base_minutes in 1u64..10_000) {
            let mut config = PolicyConfig::default();
            config.category_ttls.insert("c".into(), Duration::from_secs(base_minutes * 60));
            let policy = CachePolicy::new(config);

            let ttls: Vec<Duration> = Priority::ALL
                .iter()
                .map(|p| policy.effective_ttl("c", *p, NetworkTier::Fast).unwrap())
                .collect();
            prop_assert!(ttls.windows(2).all(|w| w[0] >= w[1]));
        }
    }
}
