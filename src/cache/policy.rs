//! Memory Tier Eviction Policy
//!
//! Chooses which resident entries to drop when an insert would exceed the
//! memory tier's byte budget.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::key::CacheKey;

/// Eviction policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Least recently used first
    #[default]
    Lru,
    /// Least frequently used first, ties broken by recency
    Lfu,
}

/// Snapshot of one resident entry, taken under the memory tier lock
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub key: CacheKey,
    pub last_access: DateTime<Utc>,
    pub access_count: u64,
    /// Logical access order; breaks timestamp ties
    pub tick: u64,
    pub size: u64,
}

impl EvictionPolicy {
    fn compare(&self, a: &EvictionCandidate, b: &EvictionCandidate) -> Ordering {
        let by_recency = a.last_access.cmp(&b.last_access).then(a.tick.cmp(&b.tick));
        match self {
            EvictionPolicy::Lru => by_recency,
            EvictionPolicy::Lfu => a.access_count.cmp(&b.access_count).then(by_recency),
        }
    }

    /// Order candidates most-evictable first and take the shortest prefix
    /// whose sizes add up to `required` bytes (or all of them).
    pub fn select_victims(
        &self,
        mut candidates: Vec<EvictionCandidate>,
        required: u64,
    ) -> Vec<EvictionCandidate> {
        candidates.sort_by(|a, b| self.compare(a, b));

        let mut freed = 0u64;
        let mut victims = Vec::new();
        for candidate in candidates {
            if freed >= required {
                break;
            }
            freed += candidate.size;
            victims.push(candidate);
        }
        victims
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn candidate(name: &str, age_secs: i64, count: u64, tick: u64, size: u64) -> EvictionCandidate {
        EvictionCandidate {
            key: CacheKey::from_parts("ns", name),
            last_access: Utc::now() - Duration::seconds(age_secs),
            access_count: count,
            tick,
            size,
        }
    }

    fn names(victims: &[EvictionCandidate]) -> Vec<&str> {
        victims.iter().map(|c| c.key.as_str()).collect()
    }

    #[test]
    fn test_lru_takes_oldest_until_enough_freed() {
        let candidates = vec![
            candidate("fresh", 1, 1, 3, 100),
            candidate("old", 300, 9, 1, 100),
            candidate("middle", 60, 1, 2, 100),
        ];
        let victims = EvictionPolicy::Lru.select_victims(candidates, 150);
        assert_eq!(names(&victims), vec!["old", "middle"]);
    }

    #[test]
    fn test_lru_tie_broken_by_tick() {
        let now = Utc::now();
        let mut a = candidate("a", 0, 0, 7, 10);
        let mut b = candidate("b", 0, 0, 2, 10);
        a.last_access = now;
        b.last_access = now;
        let victims = EvictionPolicy::Lru.select_victims(vec![a, b], 10);
        assert_eq!(names(&victims), vec!["b"]);
    }

    #[test]
    fn test_lfu_prefers_rarely_used() {
        let candidates = vec![
            candidate("hot-but-old", 300, 50, 1, 10),
            candidate("cold-but-new", 1, 0, 2, 10),
        ];
        let victims = EvictionPolicy::Lfu.select_victims(candidates, 10);
        assert_eq!(names(&victims), vec!["cold-but-new"]);
    }

    #[test]
    fn test_zero_requirement_evicts_nothing() {
        let victims = EvictionPolicy::Lru.select_victims(vec![candidate("a", 1, 1, 1, 1)], 0);
        assert!(victims.is_empty());
    }

    #[test]
    fn test_requirement_beyond_total_evicts_everything() {
        let candidates = vec![candidate("a", 1, 1, 1, 5), candidate("b", 2, 1, 2, 5)];
        let victims = EvictionPolicy::Lru.select_victims(candidates, 1_000);
        assert_eq!(victims.len(), 2);
    }
}
