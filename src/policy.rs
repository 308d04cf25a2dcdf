//! Quota Policy Table
//!
//! Pure lookup from subscription tier to storage limits. Stateless;
//! constructed once from configuration and treated as immutable for the
//! process lifetime.

use crate::types::{QuotaPolicy, SubscriptionTier};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;
const TIB: u64 = 1024 * GIB;

/// Per-tier overrides as they appear in the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierOverride {
    pub storage_limit_bytes: Option<u64>,
    pub max_file_size_bytes: Option<u64>,
}

/// Maps a subscription tier to its quota policy.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    policies: HashMap<SubscriptionTier, QuotaPolicy>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        let mut policies = HashMap::new();
        policies.insert(
            SubscriptionTier::Free,
            QuotaPolicy {
                storage_limit_bytes: GIB,
                max_file_size_bytes: 10 * MIB,
            },
        );
        policies.insert(
            SubscriptionTier::Pro,
            QuotaPolicy {
                storage_limit_bytes: 100 * GIB,
                max_file_size_bytes: GIB,
            },
        );
        policies.insert(
            SubscriptionTier::Business,
            QuotaPolicy {
                storage_limit_bytes: TIB,
                max_file_size_bytes: 5 * GIB,
            },
        );
        Self { policies }
    }
}

impl PolicyTable {
    /// Build the table from config overrides layered onto the defaults.
    pub fn from_overrides(overrides: &HashMap<SubscriptionTier, TierOverride>) -> Self {
        let mut table = Self::default();
        for (tier, over) in overrides {
            let entry = table
                .policies
                .entry(*tier)
                .or_insert(QuotaPolicy {
                    storage_limit_bytes: 0,
                    max_file_size_bytes: 0,
                });
            if let Some(limit) = over.storage_limit_bytes {
                entry.storage_limit_bytes = limit;
            }
            if let Some(max) = over.max_file_size_bytes {
                entry.max_file_size_bytes = max;
            }
        }
        table
    }

    /// Resolve the policy for a tier.
    pub fn policy_for(&self, tier: SubscriptionTier) -> QuotaPolicy {
        // Every tier variant is seeded in Default, so the lookup cannot miss.
        *self
            .policies
            .get(&tier)
            .unwrap_or(&QuotaPolicy {
                storage_limit_bytes: 0,
                max_file_size_bytes: 0,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_free_tier_limits() {
        let table = PolicyTable::default();
        let policy = table.policy_for(SubscriptionTier::Free);
        assert_eq!(policy.max_file_size_bytes, 10_485_760);
        assert_eq!(policy.storage_limit_bytes, 1_073_741_824);
    }

    #[test]
    fn test_tiers_are_ordered_by_generosity() {
        let table = PolicyTable::default();
        let free = table.policy_for(SubscriptionTier::Free);
        let pro = table.policy_for(SubscriptionTier::Pro);
        let business = table.policy_for(SubscriptionTier::Business);
        assert!(free.storage_limit_bytes < pro.storage_limit_bytes);
        assert!(pro.storage_limit_bytes < business.storage_limit_bytes);
        assert!(free.max_file_size_bytes < pro.max_file_size_bytes);
    }

    #[test]
    fn test_overrides_replace_only_named_fields() {
        let mut overrides = HashMap::new();
        overrides.insert(
            SubscriptionTier::Free,
            TierOverride {
                storage_limit_bytes: Some(2_000_000),
                max_file_size_bytes: None,
            },
        );
        let table = PolicyTable::from_overrides(&overrides);
        let policy = table.policy_for(SubscriptionTier::Free);
        assert_eq!(policy.storage_limit_bytes, 2_000_000);
        assert_eq!(policy.max_file_size_bytes, 10_485_760);
    }
}
