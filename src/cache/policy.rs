//! Freshness and Revalidation Policy
//!
//! Decides, for an entry read from the durable tier, whether the value may
//! be served as-is and whether the key must go on the background refresh
//! queue.

use std::time::Duration;

use super::entry::CacheEntry;
use crate::domain::events::RefreshReason;

/// Outcome of [`RevalidationPolicy::assess`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assessment {
    /// Return the value
    Serve {
        /// Past its TTL
        stale: bool,
        refresh: Option<RefreshReason>,
    },
    /// Treat as a miss
    Reject { refresh: Option<RefreshReason> },
}

impl Assessment {
    /// Refresh to queue, if any
    pub fn refresh(&self) -> Option<RefreshReason> {
        match self {
            Assessment::Serve { refresh, .. } | Assessment::Reject { refresh } => *refresh,
        }
    }
}

/// Revalidation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevalidationPolicy {
    /// Service-wide stale-while-revalidate default for reads
    pub stale_while_revalidate: bool,
    /// Extra age past the TTL before a stale value triggers a refresh
    pub stale_grace: Duration,
}

impl Default for RevalidationPolicy {
    fn default() -> Self {
        Self {
            stale_while_revalidate: true,
            stale_grace: Duration::from_secs(60),
        }
    }
}

impl RevalidationPolicy {
    /// Create a policy
    pub fn new(stale_while_revalidate: bool, stale_grace: Duration) -> Self {
        Self {
            stale_while_revalidate,
            stale_grace,
        }
    }

    /// Whether a read should apply stale-while-revalidate to this entry.
    ///
    /// The entry must have opted in and the read must not have opted out.
    pub fn swr_effective(&self, entry: &CacheEntry, requested: Option<bool>) -> bool {
        entry.stale_while_revalidate && requested.unwrap_or(self.stale_while_revalidate)
    }

    /// `now - created_at > ttl + stale_grace`
    pub fn is_stale(&self, entry: &CacheEntry, now: u64) -> bool {
        let limit = entry
            .ttl_ms
            .saturating_add(self.stale_grace.as_millis() as u64);
        entry.age(now) > limit
    }

    /// Decide what a read does with an entry found in the durable tier.
    ///
    /// Within its TTL the entry is served. Past its TTL it is served only
    /// when stale-while-revalidate applies; otherwise the read is a miss.
    pub fn assess(&self, entry: &CacheEntry, now: u64, requested: Option<bool>) -> Assessment {
        if !entry.is_expired(now) {
            return Assessment::Serve {
                stale: false,
                refresh: None,
            };
        }

        let refresh = self.refresh_reason(entry, now, requested);
        if self.swr_effective(entry, requested) {
            Assessment::Serve {
                stale: true,
                refresh,
            }
        } else {
            Assessment::Reject { refresh }
        }
    }

    /// Reason to queue a background refresh for a durable hit, if any
    pub fn refresh_reason(
        &self,
        entry: &CacheEntry,
        now: u64,
        requested: Option<bool>,
    ) -> Option<RefreshReason> {
        if self.swr_effective(entry, requested) && self.is_stale(entry, now) {
            return Some(RefreshReason::StaleWhileRevalidate);
        }
        if entry.background_refresh && entry.is_expired(now) {
            return Some(RefreshReason::Requested);
        }
        None
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(swr: bool, background: bool) -> CacheEntry {
        let mut entry = CacheEntry::new("k", json!(1), Duration::from_millis(1_000), 0);
        entry.stale_while_revalidate = swr;
        entry.background_refresh = background;
        entry
    }

    #[test]
    fn test_stale_threshold_includes_grace() {
        let policy = RevalidationPolicy::new(true, Duration::from_millis(500));
        let e = entry(true, false);
        assert!(!policy.is_stale(&e, 1_500));
        assert!(policy.is_stale(&e, 1_501));
    }

    #[test]
    fn test_swr_requires_entry_opt_in() {
        let policy = RevalidationPolicy::new(true, Duration::ZERO);
        assert!(!policy.swr_effective(&entry(false, false), Some(true)));
        assert!(policy.swr_effective(&entry(true, false), None));
    }

    #[test]
    fn test_read_can_opt_out() {
        let policy = RevalidationPolicy::new(true, Duration::ZERO);
        assert!(!policy.swr_effective(&entry(true, false), Some(false)));
        assert_eq!(policy.refresh_reason(&entry(true, false), 5_000, Some(false)), None);
    }

    #[test]
    fn test_global_default_applies() {
        let policy = RevalidationPolicy::new(false, Duration::ZERO);
        assert!(!policy.swr_effective(&entry(true, false), None));
        assert!(policy.swr_effective(&entry(true, false), Some(true)));
    }

    #[test]
    fn test_refresh_reasons() {
        let policy = RevalidationPolicy::new(true, Duration::from_millis(100));

        assert_eq!(
            policy.refresh_reason(&entry(true, false), 1_200, None),
            Some(RefreshReason::StaleWhileRevalidate)
        );
        assert_eq!(
            policy.refresh_reason(&entry(false, true), 1_001, None),
            Some(RefreshReason::Requested)
        );
        assert_eq!(policy.refresh_reason(&entry(true, true), 900, None), None);
        assert_eq!(policy.refresh_reason(&entry(false, false), 9_000, None), None);
    }

    #[test]
    fn test_assess_fresh_entry() {
        let policy = RevalidationPolicy::default();
        assert_eq!(
            policy.assess(&entry(false, false), 1_000, None),
            Assessment::Serve {
                stale: false,
                refresh: None
            }
        );
    }

    #[test]
    fn test_assess_expired_without_swr_is_a_miss() {
        let policy = RevalidationPolicy::new(true, Duration::ZERO);
        assert_eq!(
            policy.assess(&entry(false, false), 1_001, None),
            Assessment::Reject { refresh: None }
        );
        assert_eq!(
            policy.assess(&entry(false, true), 1_001, None).refresh(),
            Some(RefreshReason::Requested)
        );
    }

    #[test]
    fn test_assess_stale_within_grace_is_served_without_refresh() {
        let policy = RevalidationPolicy::new(true, Duration::from_millis(500));
        assert_eq!(
            policy.assess(&entry(true, false), 1_200, None),
            Assessment::Serve {
                stale: true,
                refresh: None
            }
        );
        assert_eq!(
            policy.assess(&entry(true, false), 1_600, None),
            Assessment::Serve {
                stale: true,
                refresh: Some(RefreshReason::StaleWhileRevalidate)
            }
        );
    }
}
