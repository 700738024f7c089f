//! Cache Manager
//!
//! Coordinates the four tiers: lookups probe fastest-first and promote hits
//! into the faster tiers that missed, writes are routed by encoded size and
//! value shape.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use super::clock::{Clock, SystemClock};
use super::compressed::CompressedTier;
use super::compression::CompressionManager;
use super::disk::DiskTier;
use super::entry::{CacheEntry, EntryMetadata, TagSet};
use super::key::{CacheKey, KeyCodec, Params};
use super::memory::MemoryTier;
use super::stats::{SnapshotGauges, StatsCollector, StatsSnapshot};
use super::structured::StructuredStoreTier;
use super::tier::{Tier, TierName};
use super::value::CacheValue;
use crate::config::CacheConfig;
use crate::error::{Error, Result};

/// Outcome of one expiry pass over every tier
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    /// Entries removed, per tier that swept successfully
    pub removed: BTreeMap<TierName, u64>,
    /// Error text, per tier whose sweep failed
    pub failures: BTreeMap<TierName, String>,
    /// Whether every tier compacted successfully after the sweep
    pub compacted: bool,
}

impl CleanupReport {
    pub fn total_removed(&self) -> u64 {
        self.removed.values().sum()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.compacted
    }
}

/// Tiered cache manager
pub struct CacheManager {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    memory: Arc<MemoryTier>,
    /// Probe order, fastest first; indexed by [`TierName::index`]
    tiers: Vec<Arc<dyn Tier>>,
    stats: StatsCollector,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CacheManager {
    /// Create a manager on the wall clock
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a manager with an explicit time source, opening the standard
    /// tiers under `config.cache_root_dir`
    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(config.memory_dir())?;

        let memory = Arc::new(MemoryTier::new(config.max_memory_bytes, config.eviction_policy));
        let disk = Arc::new(DiskTier::open(config.disk_dir())?);
        let compressed = Arc::new(CompressedTier::open(
            config.compressed_dir(),
            CompressionManager::with_settings(config.compression_enabled, config.compression_level),
        )?);
        let structured = Arc::new(StructuredStoreTier::open(config.structured_dir())?);

        Self::with_tiers(config, clock, memory, disk, compressed, structured)
    }

    /// Create a manager over caller-supplied tiers.
    ///
    /// Each durable tier must report the name of the slot it is passed in.
    /// Routing and thresholds still come from `config`; the memory tier keeps
    /// its own capacity.
    pub fn with_tiers(
        config: CacheConfig,
        clock: Arc<dyn Clock>,
        memory: Arc<MemoryTier>,
        disk: Arc<dyn Tier>,
        compressed: Arc<dyn Tier>,
        structured: Arc<dyn Tier>,
    ) -> Result<Self> {
        config.validate()?;

        let tiers: Vec<Arc<dyn Tier>> = vec![memory.clone() as Arc<dyn Tier>, disk, compressed, structured];
        for (tier, expected) in tiers.iter().zip(TierName::ALL) {
            if tier.name() != expected {
                return Err(Error::Config(format!(
                    "{} tier passed where the {} tier belongs",
                    tier.name(),
                    expected
                )));
            }
        }

        info!(
            root = %config.cache_root_dir.display(),
            max_memory_bytes = config.max_memory_bytes,
            compression = config.compression_enabled,
            "Cache manager initialized"
        );

        Ok(Self {
            config,
            clock,
            memory,
            tiers,
            stats: StatsCollector::new(),
        })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Look up a value, probing tiers fastest-first
    #[instrument(skip(self, params))]
    pub async fn get(&self, namespace: &str, params: &Params) -> Option<CacheValue> {
        let key = KeyCodec::build(namespace, params);
        self.lookup(&key).await
    }

    /// Look up a value, falling back to `default` on a miss
    pub async fn get_or(&self, namespace: &str, params: &Params, default: CacheValue) -> CacheValue {
        self.get(namespace, params).await.unwrap_or(default)
    }

    /// Check for a live entry without promotion, access tracking or stats
    pub async fn contains(&self, namespace: &str, params: &Params) -> bool {
        let key = KeyCodec::build(namespace, params);
        let now = self.clock.now();
        for tier in &self.tiers {
            match tier.contains(&key, now).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => warn!(tier = %tier.name(), key = %key, "Probe failed: {}", e),
            }
        }
        false
    }

    async fn lookup(&self, key: &CacheKey) -> Option<CacheValue> {
        let now = self.clock.now();
        let mut missed: Vec<&Arc<dyn Tier>> = Vec::new();

        for tier in &self.tiers {
            let name = tier.name();
            match tier.read(key, now).await {
                Ok(Some(entry)) => match CacheValue::decode(&entry.payload) {
                    Ok(value) => {
                        self.stats.record_hit(name);
                        debug!(tier = %name, key = %key, "Cache hit");
                        self.promote(&entry, &missed).await;
                        return Some(value);
                    }
                    Err(e) => {
                        warn!(tier = %name, key = %key, "Undecodable payload, dropping: {}", e);
                        if let Err(e) = tier.remove(key).await {
                            warn!(tier = %name, key = %key, "Failed to drop undecodable entry: {}", e);
                        }
                    }
                },
                Ok(None) => {}
                Err(e) => warn!(tier = %name, key = %key, "Read failed, trying next tier: {}", e),
            }
            self.stats.record_tier_miss(name);
            missed.push(tier);
        }

        self.stats.record_miss();
        debug!(key = %key, "Cache miss");
        None
    }

    /// Copy a hit into every faster tier that missed
    async fn promote(&self, entry: &CacheEntry, missed: &[&Arc<dyn Tier>]) {
        for tier in missed {
            match tier.write(entry).await {
                Ok(()) => {
                    self.stats.record_promotion();
                    debug!(tier = %tier.name(), key = %entry.key, "Promoted");
                }
                Err(e) => warn!(tier = %tier.name(), key = %entry.key, "Promotion failed: {}", e),
            }
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store a value.
    ///
    /// `ttl` defaults to the configured TTL. Fails only when the value cannot
    /// be encoded or every selected tier rejects the write.
    #[instrument(skip(self, params, value, tags))]
    pub async fn put(
        &self,
        namespace: &str,
        params: &Params,
        value: CacheValue,
        ttl: Option<Duration>,
        tags: Option<TagSet>,
    ) -> Result<()> {
        let key = KeyCodec::build(namespace, params);
        let payload = value.encode()?;
        let size = payload.len() as u64;
        let ttl = ttl.unwrap_or_else(|| self.config.default_ttl());
        let metadata = EntryMetadata::new(namespace, self.clock.now(), ttl, tags.unwrap_or_default(), size);
        let entry = CacheEntry::new(key, payload, metadata);

        let targets = self.route(size, value.is_structured());
        let mut failures = Vec::new();

        for tier in &self.tiers {
            let name = tier.name();
            if targets.contains(&name) {
                if let Err(e) = tier.write(&entry).await {
                    warn!(tier = %name, key = %entry.key, "Write failed: {}", e);
                    self.stats.record_write_failure();
                    failures.push(format!("{}: {}", name, e));
                }
            } else if let Err(e) = tier.remove(&entry.key).await {
                // A stale copy in a faster tier would shadow the new value
                warn!(tier = %name, key = %entry.key, "Failed to drop previous copy: {}", e);
            }
        }

        if failures.len() == targets.len() {
            error!(key = %entry.key, "Write failed on every selected tier");
            return Err(Error::AllTiersFailed {
                key: entry.key.to_string(),
                failures,
            });
        }

        self.stats.record_put();
        debug!(key = %entry.key, size, tiers = ?targets, "Stored");
        Ok(())
    }

    /// Tiers a value of `size` encoded bytes is written to
    pub fn route(&self, size: u64, structured: bool) -> Vec<TierName> {
        let mut targets = if size < self.config.memory_threshold_bytes {
            // Memory copy plus a durable one
            vec![TierName::Memory, TierName::Disk]
        } else if size < self.config.disk_threshold_bytes {
            vec![TierName::Disk]
        } else {
            vec![TierName::Compressed]
        };
        if structured {
            targets.push(TierName::Structured);
        }
        targets
    }

    /// Return the cached value, or compute, store and return it.
    ///
    /// A failed store is logged and the computed value is still returned.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        namespace: &str,
        params: &Params,
        ttl: Option<Duration>,
        tags: Option<TagSet>,
        compute: F,
    ) -> std::result::Result<CacheValue, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<CacheValue, E>>,
    {
        if let Some(value) = self.get(namespace, params).await {
            return Ok(value);
        }

        let value = compute().await?;
        if let Err(e) = self.put(namespace, params, value.clone(), ttl, tags).await {
            warn!(namespace, "Computed value not cached: {}", e);
        }
        Ok(value)
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Remove one key from every tier; true if any tier held it
    pub async fn invalidate(&self, namespace: &str, params: &Params) -> bool {
        let key = KeyCodec::build(namespace, params);
        let mut removed = false;
        for tier in &self.tiers {
            match tier.remove(&key).await {
                Ok(r) => removed |= r,
                Err(e) => warn!(tier = %tier.name(), key = %key, "Invalidate failed: {}", e),
            }
        }
        removed
    }

    /// Clear one tier or all of them, optionally only entries carrying any of
    /// `tags`. Returns the number of entries removed.
    #[instrument(skip(self))]
    pub async fn clear(&self, tier: Option<TierName>, tags: Option<&TagSet>) -> Result<u64> {
        let selected: Vec<&Arc<dyn Tier>> = self
            .tiers
            .iter()
            .filter(|t| tier.map_or(true, |only| t.name() == only))
            .collect();

        let mut removed = 0;
        let mut failures = Vec::new();
        for t in &selected {
            match t.clear(tags).await {
                Ok(n) => removed += n,
                Err(e) => {
                    warn!(tier = %t.name(), "Clear failed: {}", e);
                    failures.push(format!("{}: {}", t.name(), e));
                }
            }
        }

        if !selected.is_empty() && failures.len() == selected.len() {
            return Err(Error::AllTiersFailed {
                key: "clear".to_string(),
                failures,
            });
        }
        info!(removed, "Cache cleared");
        Ok(removed)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Sweep expired entries from every tier, then compact the structured
    /// store. A failing tier does not stop the others.
    #[instrument(skip(self))]
    pub async fn cleanup_expired(&self) -> CleanupReport {
        let now = self.clock.now();
        let mut report = CleanupReport::default();

        for tier in &self.tiers {
            match tier.sweep_expired(now).await {
                Ok(n) => {
                    report.removed.insert(tier.name(), n);
                }
                Err(e) => {
                    error!(tier = %tier.name(), "Expiry sweep failed: {}", e);
                    report.failures.insert(tier.name(), e.to_string());
                }
            }
        }

        report.compacted = true;
        for tier in &self.tiers {
            if let Err(e) = tier.compact().await {
                error!(tier = %tier.name(), "Compaction failed: {}", e);
                report.compacted = false;
            }
        }

        info!(removed = report.total_removed(), "Expired entries cleaned up");
        report
    }

    /// Counters plus on-demand tier sizes
    pub async fn stats(&self) -> StatsSnapshot {
        let mut sizes = Vec::with_capacity(self.tiers.len());
        for tier in &self.tiers {
            match tier.usage().await {
                Ok(usage) => sizes.push((tier.name(), usage)),
                Err(e) => warn!(tier = %tier.name(), "Usage unavailable: {}", e),
            }
        }
        self.stats.snapshot(
            &sizes,
            SnapshotGauges {
                evictions: self.memory.evictions(),
                memory_capacity_bytes: self.memory.capacity(),
                max_disk_bytes: self.config.max_disk_bytes,
            },
        )
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Key a namespace/params pair maps to
    pub fn key_for(&self, namespace: &str, params: &Params) -> CacheKey {
        KeyCodec::build(namespace, params)
    }

    pub fn tier(&self, name: TierName) -> &Arc<dyn Tier> {
        &self.tiers[name.index()]
    }

    pub fn memory(&self) -> &MemoryTier {
        &self.memory
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn collector(&self) -> &StatsCollector {
        &self.stats
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::cache::value::Table;
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> CacheConfig {
        let mut config = CacheConfig::with_root(dir.path());
        config.max_memory_bytes = 64 * 1024;
        config.memory_threshold_bytes = 1024;
        config.disk_threshold_bytes = 16 * 1024;
        config
    }

    fn setup(dir: &TempDir) -> (CacheManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let manager = CacheManager::with_clock(test_config(dir), clock.clone()).unwrap();
        (manager, clock)
    }

    fn blob(len: usize) -> CacheValue {
        CacheValue::Blob(Bytes::from(vec![b'z'; len]))
    }

    fn params(symbol: &str) -> Params {
        Params::new().with("symbol", symbol)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = setup(&dir);

        manager.put("ns", &params("A"), blob(10), None, None).await.unwrap();
        assert_eq!(manager.get("ns", &params("A")).await, Some(blob(10)));
        assert_eq!(manager.get("ns", &params("B")).await, None);

        let stats = manager.stats().await;
        assert_eq!(stats.hits_total, 1);
        assert_eq!(stats.misses_total, 1);
        assert_eq!(stats.puts, 1);
    }

    #[tokio::test]
    async fn test_size_routing() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = setup(&dir);

        assert_eq!(manager.route(10, false), vec![TierName::Memory, TierName::Disk]);
        assert_eq!(manager.route(2048, false), vec![TierName::Disk]);
        assert_eq!(manager.route(1 << 20, true), vec![TierName::Compressed, TierName::Structured]);

        manager.put("ns", &params("big"), blob(32 * 1024), None, None).await.unwrap();
        let stats = manager.stats().await;
        assert_eq!(stats.tier(TierName::Compressed).unwrap().entries_count, 1);
        assert_eq!(stats.tier(TierName::Disk).unwrap().entries_count, 0);
        assert_eq!(stats.tier(TierName::Memory).unwrap().entries_count, 0);
    }

    #[tokio::test]
    async fn test_structured_values_also_go_to_store() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = setup(&dir);

        let mut table = Table::new(vec!["close".into()]);
        table.push_row(vec![json!(1.5)]);
        manager.put("ns", &params("A"), table.into(), None, None).await.unwrap();

        let stats = manager.stats().await;
        assert_eq!(stats.tier(TierName::Structured).unwrap().entries_count, 1);
        assert_eq!(stats.tier(TierName::Memory).unwrap().entries_count, 1);
    }

    #[tokio::test]
    async fn test_expiry_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let (manager, clock) = setup(&dir);

        manager
            .put("ns", &params("A"), blob(10), Some(Duration::minutes(5)), None)
            .await
            .unwrap();
        clock.advance(Duration::minutes(5));
        assert_eq!(manager.get("ns", &params("A")).await, None);
        assert!(!manager.contains("ns", &params("A")).await);
    }

    #[tokio::test]
    async fn test_huge_ttl_is_capped_not_fatal() {
        let dir = TempDir::new().unwrap();
        let (manager, clock) = setup(&dir);

        let mut table = Table::new(vec!["close".into()]);
        table.push_row(vec![json!(3.0)]);
        manager
            .put("ns", &params("A"), table.into(), Some(Duration::days(365 * 1_000_000)), None)
            .await
            .unwrap();

        clock.advance(Duration::days(365 * 50));
        manager.memory().clear_tagged(None);
        assert!(manager.get("ns", &params("A")).await.is_some());
    }

    #[tokio::test]
    async fn test_oversized_default_ttl_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.default_ttl_hours = 10_000_000_000;
        assert_matches!(CacheManager::new(config), Err(Error::Config(_)));
    }

    #[tokio::test]
    async fn test_promotion_from_disk() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = setup(&dir);

        manager.put("ns", &params("A"), blob(10), None, None).await.unwrap();
        manager.memory().clear_tagged(None);

        assert_eq!(manager.get("ns", &params("A")).await, Some(blob(10)));
        assert!(manager.memory().contains(&manager.key_for("ns", &params("A"))));

        let stats = manager.stats().await;
        assert_eq!(stats.tier(TierName::Disk).unwrap().hits, 1);
        assert_eq!(stats.tier(TierName::Memory).unwrap().misses, 1);
        assert_eq!(stats.promotions, 1);
    }

    #[tokio::test]
    async fn test_overwrite_drops_stale_faster_copy() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = setup(&dir);

        manager.put("ns", &params("A"), blob(10), None, None).await.unwrap();
        manager.put("ns", &params("A"), blob(4096), None, None).await.unwrap();

        assert_eq!(manager.get("ns", &params("A")).await, Some(blob(4096)));
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_dropped() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = setup(&dir);
        let key = manager.key_for("ns", &params("A"));

        let now = manager.clock().now();
        let bad = CacheEntry::new(
            key.clone(),
            Bytes::from_static(b"\x09garbage"),
            EntryMetadata::new("ns", now, Duration::hours(1), TagSet::new(), 8),
        );
        manager.tier(TierName::Disk).write(&bad).await.unwrap();

        assert_eq!(manager.get("ns", &params("A")).await, None);
        assert!(!manager.tier(TierName::Disk).contains(&key, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalidate_and_tag_clear() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = setup(&dir);
        let tags: TagSet = ["prices".to_string()].into_iter().collect();

        manager.put("ns", &params("A"), blob(10), None, Some(tags.clone())).await.unwrap();
        manager.put("ns", &params("B"), blob(10), None, None).await.unwrap();
        manager.put("ns", &params("C"), blob(10), None, None).await.unwrap();

        assert!(manager.invalidate("ns", &params("C")).await);
        assert!(!manager.invalidate("ns", &params("C")).await);

        // One memory copy plus one disk copy
        assert_eq!(manager.clear(None, Some(&tags)).await.unwrap(), 2);
        assert_eq!(manager.get("ns", &params("A")).await, None);
        assert!(manager.get("ns", &params("B")).await.is_some());

        manager.clear(Some(TierName::Memory), None).await.unwrap();
        assert!(manager.memory().is_empty());
        assert!(manager.contains("ns", &params("B")).await);
    }

    #[tokio::test]
    async fn test_get_or_compute_runs_once() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = setup(&dir);
        let counter = std::sync::atomic::AtomicUsize::new(0);
        let calls = &counter;

        for _ in 0..3 {
            let value = manager
                .get_or_compute("ns", &params("A"), None, None, move || async move {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok::<_, Error>(blob(5))
                })
                .await
                .unwrap();
            assert_eq!(value, blob(5));
        }
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_compute_propagates_errors() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = setup(&dir);

        let result = manager
            .get_or_compute("ns", &params("A"), None, None, || async {
                Err::<CacheValue, _>(Error::Internal("upstream down".into()))
            })
            .await;
        assert_matches!(result, Err(Error::Internal(_)));
        assert!(!manager.contains("ns", &params("A")).await);
    }

    #[tokio::test]
    async fn test_cleanup_report() {
        let dir = TempDir::new().unwrap();
        let (manager, clock) = setup(&dir);

        manager
            .put("ns", &params("A"), blob(10), Some(Duration::minutes(1)), None)
            .await
            .unwrap();
        clock.advance(Duration::minutes(2));

        let report = manager.cleanup_expired().await;
        assert!(report.is_clean());
        assert_eq!(report.removed[&TierName::Memory], 1);
        assert_eq!(report.removed[&TierName::Disk], 1);
        assert_eq!(report.total_removed(), 2);
    }

    // ===== Failing tiers =====

    /// Delegates to a real tier unless told to fail an operation
    struct FlakyTier {
        inner: Arc<dyn Tier>,
        fail_reads: bool,
        fail_writes: bool,
        fail_sweeps: bool,
    }

    impl FlakyTier {
        fn wrap(inner: Arc<dyn Tier>) -> Self {
            Self {
                inner,
                fail_reads: false,
                fail_writes: false,
                fail_sweeps: false,
            }
        }

        fn broken(&self, op: &str) -> Error {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("{} {} refused", self.inner.name(), op),
            ))
        }
    }

    #[async_trait::async_trait]
    impl Tier for FlakyTier {
        fn name(&self) -> TierName {
            self.inner.name()
        }

        async fn read(&self, key: &CacheKey, now: chrono::DateTime<chrono::Utc>) -> Result<Option<CacheEntry>> {
            if self.fail_reads {
                return Err(self.broken("read"));
            }
            self.inner.read(key, now).await
        }

        async fn contains(&self, key: &CacheKey, now: chrono::DateTime<chrono::Utc>) -> Result<bool> {
            if self.fail_reads {
                return Err(self.broken("read"));
            }
            self.inner.contains(key, now).await
        }

        async fn write(&self, entry: &CacheEntry) -> Result<()> {
            if self.fail_writes {
                return Err(self.broken("write"));
            }
            self.inner.write(entry).await
        }

        async fn remove(&self, key: &CacheKey) -> Result<bool> {
            self.inner.remove(key).await
        }

        async fn clear(&self, tags: Option<&TagSet>) -> Result<u64> {
            self.inner.clear(tags).await
        }

        async fn sweep_expired(&self, now: chrono::DateTime<chrono::Utc>) -> Result<u64> {
            if self.fail_sweeps {
                return Err(self.broken("sweep"));
            }
            self.inner.sweep_expired(now).await
        }

        async fn usage(&self) -> Result<crate::cache::tier::TierUsage> {
            self.inner.usage().await
        }
    }

    /// Standard tiers under `dir`, with `configure` applied to the one named `flaky`
    fn setup_flaky(
        dir: &TempDir,
        flaky: TierName,
        configure: impl FnOnce(&mut FlakyTier),
    ) -> (CacheManager, Arc<ManualClock>) {
        let config = test_config(dir);
        let clock = Arc::new(ManualClock::new());
        let memory = Arc::new(MemoryTier::new(config.max_memory_bytes, config.eviction_policy));
        let mut durable: Vec<Arc<dyn Tier>> = vec![
            Arc::new(DiskTier::open(config.disk_dir()).unwrap()) as Arc<dyn Tier>,
            Arc::new(CompressedTier::open(config.compressed_dir(), CompressionManager::new()).unwrap())
                as Arc<dyn Tier>,
            Arc::new(StructuredStoreTier::open(config.structured_dir()).unwrap()) as Arc<dyn Tier>,
        ];
        for slot in durable.iter_mut() {
            if slot.name() == flaky {
                let mut tier = FlakyTier::wrap(Arc::clone(slot));
                configure(&mut tier);
                *slot = Arc::new(tier);
                break;
            }
        }
        let structured = durable.pop().unwrap();
        let compressed = durable.pop().unwrap();
        let disk = durable.pop().unwrap();

        let manager =
            CacheManager::with_tiers(config, clock.clone(), memory, disk, compressed, structured).unwrap();
        (manager, clock)
    }

    #[tokio::test]
    async fn test_with_tiers_rejects_misplaced_tier() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let memory = Arc::new(MemoryTier::new(config.max_memory_bytes, config.eviction_policy));
        let disk = Arc::new(DiskTier::open(config.disk_dir()).unwrap());
        let structured = Arc::new(StructuredStoreTier::open(config.structured_dir()).unwrap());

        let result = CacheManager::with_tiers(
            config,
            Arc::new(ManualClock::new()),
            memory,
            structured.clone(),
            disk,
            structured,
        );
        assert_matches!(result, Err(Error::Config(_)));
    }

    #[tokio::test]
    async fn test_put_survives_one_failing_target() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = setup_flaky(&dir, TierName::Disk, |t| t.fail_writes = true);

        manager.put("ns", &params("A"), blob(10), None, None).await.unwrap();
        assert_eq!(manager.get("ns", &params("A")).await, Some(blob(10)));

        let stats = manager.stats().await;
        assert_eq!(stats.write_failures, 1);
        assert_eq!(stats.puts, 1);
        assert_eq!(stats.tier(TierName::Disk).unwrap().entries_count, 0);
    }

    #[tokio::test]
    async fn test_put_fails_when_every_target_fails() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = setup_flaky(&dir, TierName::Compressed, |t| t.fail_writes = true);

        // Large blobs go to the compressed tier only
        let result = manager.put("ns", &params("big"), blob(32 * 1024), None, None).await;
        assert_matches!(result, Err(Error::AllTiersFailed { ref failures, .. }) if failures.len() == 1);

        let stats = manager.stats().await;
        assert_eq!(stats.write_failures, 1);
        assert_eq!(stats.puts, 0);
        assert_eq!(manager.get("ns", &params("big")).await, None);
    }

    #[tokio::test]
    async fn test_read_error_falls_through_to_slower_tier() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = setup_flaky(&dir, TierName::Disk, |t| t.fail_reads = true);

        let mut table = Table::new(vec!["close".into()]);
        table.push_row(vec![json!(2.5)]);
        let value = CacheValue::from(table);
        manager.put("ns", &params("A"), value.clone(), None, None).await.unwrap();
        manager.memory().clear_tagged(None);

        assert_eq!(manager.get("ns", &params("A")).await, Some(value));
        assert!(manager.contains("ns", &params("A")).await);

        let stats = manager.stats().await;
        assert_eq!(stats.tier(TierName::Disk).unwrap().misses, 1);
        assert_eq!(stats.tier(TierName::Structured).unwrap().hits, 1);
        assert!(manager.memory().contains(&manager.key_for("ns", &params("A"))));
    }

    #[tokio::test]
    async fn test_failing_sweep_does_not_stop_other_tiers() {
        let dir = TempDir::new().unwrap();
        let (manager, clock) = setup_flaky(&dir, TierName::Disk, |t| t.fail_sweeps = true);

        let mut table = Table::new(vec!["close".into()]);
        table.push_row(vec![json!(1.0)]);
        manager
            .put("ns", &params("A"), table.into(), Some(Duration::minutes(1)), None)
            .await
            .unwrap();
        clock.advance(Duration::minutes(2));

        let report = manager.cleanup_expired().await;
        assert!(!report.is_clean());
        assert!(report.failures[&TierName::Disk].contains("sweep refused"));
        assert!(!report.removed.contains_key(&TierName::Disk));
        assert_eq!(report.removed[&TierName::Memory], 1);
        assert_eq!(report.removed[&TierName::Structured], 1);
        assert!(report.compacted);
    }

    #[tokio::test]
    async fn test_get_or_default() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = setup(&dir);
        assert_eq!(manager.get_or("ns", &params("A"), blob(1)).await, blob(1));
    }
}
