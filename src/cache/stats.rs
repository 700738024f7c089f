//! Cache Statistics
//!
//! Lock-free counters updated on the request path, plus a serializable
//! snapshot that also carries on-demand tier sizes.

use std::sync::atomic::{AtomicU64, Ordering};

use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use serde::Serialize;

use super::tier::{TierName, TierUsage};
use crate::error::{Error, Result};

const TIER_COUNT: usize = TierName::ALL.len();

/// Cache statistics collector
#[derive(Debug, Default)]
pub struct StatsCollector {
    tier_hits: [AtomicU64; TIER_COUNT],
    tier_misses: [AtomicU64; TIER_COUNT],
    misses: AtomicU64,
    promotions: AtomicU64,
    puts: AtomicU64,
    write_failures: AtomicU64,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A request was served by `tier`
    pub fn record_hit(&self, tier: TierName) {
        self.tier_hits[tier.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// `tier` was probed and did not hold the key
    pub fn record_tier_miss(&self, tier: TierName) {
        self.tier_misses[tier.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// No tier held the key
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self, tier: TierName) -> u64 {
        self.tier_hits[tier.index()].load(Ordering::Relaxed)
    }

    pub fn hits_total(&self) -> u64 {
        self.tier_hits.iter().map(|h| h.load(Ordering::Relaxed)).sum()
    }

    pub fn misses_total(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Hits over requests; 0 when nothing has been requested
    pub fn hit_rate(&self) -> f64 {
        hit_rate(self.hits_total(), self.misses_total())
    }

    /// Capture counters together with tier sizes gathered by the caller
    pub fn snapshot(&self, sizes: &[(TierName, TierUsage)], gauges: SnapshotGauges) -> StatsSnapshot {
        let hits_total = self.hits_total();
        let misses_total = self.misses_total();

        let tiers = TierName::ALL
            .iter()
            .map(|&tier| {
                let usage = sizes
                    .iter()
                    .find(|(name, _)| *name == tier)
                    .map(|(_, usage)| *usage)
                    .unwrap_or_default();
                TierStats {
                    tier,
                    hits: self.hits(tier),
                    misses: self.tier_misses[tier.index()].load(Ordering::Relaxed),
                    entries_count: usage.entries_count,
                    bytes_used: usage.bytes_used,
                }
            })
            .collect();

        StatsSnapshot {
            hits_total,
            misses_total,
            total_requests: hits_total + misses_total,
            hit_rate: hit_rate(hits_total, misses_total),
            promotions: self.promotions.load(Ordering::Relaxed),
            evictions: gauges.evictions,
            puts: self.puts.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            memory_capacity_bytes: gauges.memory_capacity_bytes,
            max_disk_bytes: gauges.max_disk_bytes,
            tiers,
        }
    }
}

fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Values owned outside the collector that a snapshot reports
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotGauges {
    pub evictions: u64,
    pub memory_capacity_bytes: u64,
    pub max_disk_bytes: u64,
}

/// Per-tier figures
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierStats {
    pub tier: TierName,
    pub hits: u64,
    pub misses: u64,
    pub entries_count: u64,
    pub bytes_used: u64,
}

/// Point-in-time statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub hits_total: u64,
    pub misses_total: u64,
    pub total_requests: u64,
    pub hit_rate: f64,
    pub promotions: u64,
    pub evictions: u64,
    pub puts: u64,
    pub write_failures: u64,
    pub memory_capacity_bytes: u64,
    /// Advisory only; see the reaper's over-budget warning
    pub max_disk_bytes: u64,
    pub tiers: Vec<TierStats>,
}

impl StatsSnapshot {
    pub fn tier(&self, tier: TierName) -> Option<&TierStats> {
        self.tiers.iter().find(|t| t.tier == tier)
    }

    /// Combined bytes of the disk and compressed tiers
    pub fn disk_bytes_used(&self) -> u64 {
        self.tiers
            .iter()
            .filter(|t| matches!(t.tier, TierName::Disk | TierName::Compressed))
            .map(|t| t.bytes_used)
            .sum()
    }

    /// Render in Prometheus text exposition format
    pub fn render_prometheus(&self) -> Result<String> {
        let registry = Registry::new();

        let hits = IntCounterVec::new(
            Opts::new("tiercache_hits_total", "Requests served, by tier"),
            &["tier"],
        )
        .map_err(metrics_err)?;
        let tier_misses = IntCounterVec::new(
            Opts::new("tiercache_tier_misses_total", "Probes that missed, by tier"),
            &["tier"],
        )
        .map_err(metrics_err)?;
        let entries = IntGaugeVec::new(
            Opts::new("tiercache_entries", "Entries held, by tier"),
            &["tier"],
        )
        .map_err(metrics_err)?;
        let bytes = IntGaugeVec::new(
            Opts::new("tiercache_bytes_used", "Bytes held, by tier"),
            &["tier"],
        )
        .map_err(metrics_err)?;
        registry.register(Box::new(hits.clone())).map_err(metrics_err)?;
        registry.register(Box::new(tier_misses.clone())).map_err(metrics_err)?;
        registry.register(Box::new(entries.clone())).map_err(metrics_err)?;
        registry.register(Box::new(bytes.clone())).map_err(metrics_err)?;

        for t in &self.tiers {
            let label = [t.tier.as_str()];
            hits.with_label_values(&label).inc_by(t.hits);
            tier_misses.with_label_values(&label).inc_by(t.misses);
            entries.with_label_values(&label).set(clamp_i64(t.entries_count));
            bytes.with_label_values(&label).set(clamp_i64(t.bytes_used));
        }

        let counters = [
            ("tiercache_misses_total", "Requests no tier could serve", self.misses_total),
            ("tiercache_promotions_total", "Copies written into faster tiers", self.promotions),
            ("tiercache_evictions_total", "Memory tier evictions", self.evictions),
            ("tiercache_puts_total", "Values stored", self.puts),
            ("tiercache_write_failures_total", "Failed tier writes", self.write_failures),
        ];
        for (name, help, value) in counters {
            let counter = IntCounter::new(name, help).map_err(metrics_err)?;
            counter.inc_by(value);
            registry.register(Box::new(counter)).map_err(metrics_err)?;
        }

        let capacities = [
            ("tiercache_memory_capacity_bytes", "Memory tier byte budget", self.memory_capacity_bytes),
            ("tiercache_disk_budget_bytes", "Advisory disk budget", self.max_disk_bytes),
        ];
        for (name, help, value) in capacities {
            let gauge = IntGauge::new(name, help).map_err(metrics_err)?;
            gauge.set(clamp_i64(value));
            registry.register(Box::new(gauge)).map_err(metrics_err)?;
        }

        let rate = Gauge::new("tiercache_hit_rate", "Hits over requests").map_err(metrics_err)?;
        rate.set(self.hit_rate);
        registry.register(Box::new(rate)).map_err(metrics_err)?;

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .map_err(metrics_err)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics encoding: {}", e)))
    }
}

fn clamp_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn metrics_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}

// =============================================================================
// Tests
// =============================================================================
