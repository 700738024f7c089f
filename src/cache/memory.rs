//! Memory Tier - in-process hot cache
//!
//! A single mutex guards the resident map, the running byte usage and the
//! logical access tick. Every mutation (insert, evict, access bump) happens
//! under it and none of them perform I/O.
//!
//! Eviction only drops the in-memory copy; durable tiers are never touched
//! from here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use super::entry::{CacheEntry, TagSet};
use super::key::CacheKey;
use super::policy::{EvictionCandidate, EvictionPolicy};
use super::tier::{Tier, TierName, TierUsage};
use crate::error::Result;

struct Resident {
    entry: CacheEntry,
    tick: u64,
}

#[derive(Default)]
struct MemoryState {
    entries: HashMap<CacheKey, Resident>,
    usage: u64,
    tick: u64,
}

impl MemoryState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn take(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let resident = self.entries.remove(key)?;
        self.usage -= resident.entry.size();
        Some(resident.entry)
    }

    fn retain(&mut self, mut keep: impl FnMut(&CacheEntry) -> bool) -> u64 {
        let doomed: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, r)| !keep(&r.entry))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            self.take(key);
        }
        doomed.len() as u64
    }
}

/// Memory tier
pub struct MemoryTier {
    state: Mutex<MemoryState>,
    /// Byte budget
    capacity: u64,
    policy: EvictionPolicy,
    evictions: AtomicU64,
}

impl MemoryTier {
    pub fn new(capacity: u64, policy: EvictionPolicy) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            capacity,
            policy,
            evictions: AtomicU64::new(0),
        }
    }

    /// Get an unexpired entry, bumping its access fields
    pub fn get(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<CacheEntry> {
        let mut state = self.state.lock();
        let tick = state.next_tick();

        let expired = match state.entries.get_mut(key) {
            None => return None,
            Some(resident) if resident.entry.is_expired(now) => true,
            Some(resident) => {
                resident.entry.metadata.record_access(now);
                resident.tick = tick;
                return Some(resident.entry.clone());
            }
        };

        if expired {
            state.take(key);
        }
        None
    }

    /// Insert an entry, evicting as needed.
    ///
    /// Returns false if the entry alone exceeds the tier's capacity; any
    /// previous copy under the same key is dropped in that case.
    pub fn put(&self, entry: CacheEntry) -> bool {
        let size = entry.size();
        let mut evicted = Vec::new();

        let accepted = {
            let mut state = self.state.lock();
            state.take(&entry.key);

            if size > self.capacity {
                false
            } else {
                if state.usage + size > self.capacity {
                    let required = state.usage + size - self.capacity;
                    let candidates = state
                        .entries
                        .iter()
                        .map(|(key, r)| EvictionCandidate {
                            key: key.clone(),
                            last_access: r.entry.metadata.last_access,
                            access_count: r.entry.metadata.access_count,
                            tick: r.tick,
                            size: r.entry.size(),
                        })
                        .collect();
                    for victim in self.policy.select_victims(candidates, required) {
                        state.take(&victim.key);
                        evicted.push(victim.key);
                    }
                }

                let tick = state.next_tick();
                state.usage += size;
                state.entries.insert(entry.key.clone(), Resident { entry, tick });
                true
            }
        };

        if !evicted.is_empty() {
            self.evictions
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            for key in &evicted {
                debug!(key = %key, "evicted from memory tier");
            }
        }
        accepted
    }

    /// Remove an entry from the tier
    pub fn remove(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.state.lock().take(key)
    }

    /// Check if the tier holds a key (expired or not)
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Check for an unexpired copy without touching access fields
    pub fn contains_live(&self, key: &CacheKey, now: DateTime<Utc>) -> bool {
        self.state
            .lock()
            .entries
            .get(key)
            .is_some_and(|r| !r.entry.is_expired(now))
    }

    /// Bytes currently held
    pub fn current_usage(&self) -> u64 {
        self.state.lock().usage
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Entries dropped under memory pressure since creation
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Drop everything, or only entries carrying any of `tags`
    pub fn clear_tagged(&self, tags: Option<&TagSet>) -> u64 {
        let mut state = self.state.lock();
        match tags {
            None => {
                let count = state.entries.len() as u64;
                state.entries.clear();
                state.usage = 0;
                count
            }
            Some(tags) => state.retain(|e| !e.metadata.has_any_tag(tags)),
        }
    }

    /// Drop entries expired at `now`
    pub fn remove_expired(&self, now: DateTime<Utc>) -> u64 {
        self.state.lock().retain(|e| !e.is_expired(now))
    }
}

#[async_trait]
impl Tier for MemoryTier {
    fn name(&self) -> TierName {
        TierName::Memory
    }

    async fn read(&self, key: &CacheKey, now: DateTime<Utc>) -> Result<Option<CacheEntry>> {
        Ok(self.get(key, now))
    }

    async fn contains(&self, key: &CacheKey, now: DateTime<Utc>) -> Result<bool> {
        Ok(self.contains_live(key, now))
    }

    async fn write(&self, entry: &CacheEntry) -> Result<()> {
        if !self.put(entry.clone()) {
            debug!(key = %entry.key, size = entry.size(), "entry larger than memory tier, not cached");
        }
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool> {
        Ok(MemoryTier::remove(self, key).is_some())
    }

    async fn clear(&self, tags: Option<&TagSet>) -> Result<u64> {
        Ok(self.clear_tagged(tags))
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        Ok(self.remove_expired(now))
    }

    async fn usage(&self) -> Result<TierUsage> {
        let state = self.state.lock();
        Ok(TierUsage {
            entries_count: state.entries.len() as u64,
            bytes_used: state.usage,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
