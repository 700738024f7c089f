//! Cache Configuration
//!
//! Every field is optional; a missing YAML key falls back to the default
//! listed on [`CacheConfig::default`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::entry::MAX_TTL_HOURS;
use crate::cache::EvictionPolicy;
use crate::error::{Error, Result};

/// 1 MiB
pub const MIB: u64 = 1024 * 1024;

/// 1 GiB
pub const GIB: u64 = 1024 * MIB;

/// Longest accepted reaper period (one year)
pub const MAX_REAPER_INTERVAL_HOURS: u64 = 366 * 24;

/// Tiered cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root directory holding the `disk/`, `compressed/` and `structured/` subdirectories
    pub cache_root_dir: PathBuf,
    /// Hard cap for the memory tier
    pub max_memory_bytes: u64,
    /// Advisory cap for the durable file tiers (reported, not enforced)
    pub max_disk_bytes: u64,
    /// TTL applied when a put does not carry one
    pub default_ttl_hours: u64,
    /// Compress payloads written to the compressed tier
    pub compression_enabled: bool,
    /// LZ4 high-compression level
    pub compression_level: i32,
    /// Period between expiry sweeps
    pub reaper_interval_hours: u64,
    /// Payloads smaller than this are also held in memory
    pub memory_threshold_bytes: u64,
    /// Payloads smaller than this go to the disk tier, larger ones to the compressed tier
    pub disk_threshold_bytes: u64,
    /// Victim selection for the memory tier
    pub eviction_policy: EvictionPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_root_dir: PathBuf::from("./cache"),
            max_memory_bytes: 100 * MIB,
            max_disk_bytes: GIB,
            default_ttl_hours: 24,
            compression_enabled: true,
            compression_level: 4,
            reaper_interval_hours: 6,
            memory_threshold_bytes: MIB,
            disk_threshold_bytes: 10 * MIB,
            eviction_policy: EvictionPolicy::Lru,
        }
    }
}

impl CacheConfig {
    /// Config rooted at `dir` with every other field defaulted
    pub fn with_root(dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_root_dir: dir.into(),
            ..Default::default()
        }
    }

    /// Load from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// Parse from YAML text
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the cache cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.max_memory_bytes == 0 {
            return Err(Error::Config("max_memory_bytes must be > 0".into()));
        }
        if self.default_ttl_hours == 0 {
            return Err(Error::Config("default_ttl_hours must be > 0".into()));
        }
        if self.default_ttl_hours > MAX_TTL_HOURS {
            return Err(Error::Config(format!(
                "default_ttl_hours ({}) exceeds the maximum of {}",
                self.default_ttl_hours, MAX_TTL_HOURS
            )));
        }
        if self.reaper_interval_hours == 0 {
            return Err(Error::Config("reaper_interval_hours must be > 0".into()));
        }
        if self.reaper_interval_hours > MAX_REAPER_INTERVAL_HOURS {
            return Err(Error::Config(format!(
                "reaper_interval_hours ({}) exceeds the maximum of {}",
                self.reaper_interval_hours, MAX_REAPER_INTERVAL_HOURS
            )));
        }
        if self.memory_threshold_bytes > self.disk_threshold_bytes {
            return Err(Error::Config(format!(
                "memory_threshold_bytes ({}) exceeds disk_threshold_bytes ({})",
                self.memory_threshold_bytes, self.disk_threshold_bytes
            )));
        }
        Ok(())
    }

    /// Default TTL as a chrono duration, capped at [`MAX_TTL_HOURS`]
    pub fn default_ttl(&self) -> chrono::Duration {
        let hours = i64::try_from(self.default_ttl_hours.min(MAX_TTL_HOURS)).unwrap_or(i64::MAX);
        chrono::Duration::hours(hours)
    }

    /// Reaper period, capped at [`MAX_REAPER_INTERVAL_HOURS`]
    pub fn reaper_interval(&self) -> Duration {
        let hours = self.reaper_interval_hours.min(MAX_REAPER_INTERVAL_HOURS);
        Duration::from_secs(hours.saturating_mul(3600))
    }

    pub fn disk_dir(&self) -> PathBuf {
        self.cache_root_dir.join("disk")
    }

    pub fn compressed_dir(&self) -> PathBuf {
        self.cache_root_dir.join("compressed")
    }

    pub fn structured_dir(&self) -> PathBuf {
        self.cache_root_dir.join("structured")
    }

    /// Placeholder kept for layout compatibility; the memory tier never touches it
    pub fn memory_dir(&self) -> PathBuf {
        self.cache_root_dir.join("memory")
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.max_memory_bytes, 100 * MIB);
        assert_eq!(config.max_disk_bytes, GIB);
        assert_eq!(config.default_ttl_hours, 24);
        assert!(config.compression_enabled);
        assert_eq!(config.reaper_interval_hours, 6);
        assert_eq!(config.memory_threshold_bytes, MIB);
        assert_eq!(config.disk_threshold_bytes, 10 * MIB);
        assert_eq!(config.eviction_policy, EvictionPolicy::Lru);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "cache_root_dir: /tmp/tc\nmax_memory_bytes: 2048\neviction_policy: lfu\n";
        let config = CacheConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.cache_root_dir, PathBuf::from("/tmp/tc"));
        assert_eq!(config.max_memory_bytes, 2048);
        assert_eq!(config.eviction_policy, EvictionPolicy::Lfu);
        assert_eq!(config.default_ttl_hours, 24);
    }

    #[test]
    fn test_validation_rejects_inverted_thresholds() {
        let config = CacheConfig {
            memory_threshold_bytes: 20 * MIB,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_validation_rejects_zero_ttl() {
        let yaml = "default_ttl_hours: 0\n";
        assert_matches!(CacheConfig::from_yaml_str(yaml), Err(Error::Config(_)));
    }

    #[test]
    fn test_validation_rejects_oversized_durations() {
        let yaml = "default_ttl_hours: 10000000000\n";
        assert_matches!(CacheConfig::from_yaml_str(yaml), Err(Error::Config(_)));

        let yaml = "default_ttl_hours: 18446744073709551615\n";
        assert_matches!(CacheConfig::from_yaml_str(yaml), Err(Error::Config(_)));

        let config = CacheConfig {
            reaper_interval_hours: u64::MAX,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));

        let config = CacheConfig {
            default_ttl_hours: MAX_TTL_HOURS,
            reaper_interval_hours: MAX_REAPER_INTERVAL_HOURS,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duration_helpers_never_wrap() {
        let config = CacheConfig {
            default_ttl_hours: u64::MAX,
            reaper_interval_hours: u64::MAX,
            ..Default::default()
        };
        assert_eq!(config.default_ttl(), chrono::Duration::hours(MAX_TTL_HOURS as i64));
        assert_eq!(
            config.reaper_interval(),
            Duration::from_secs(MAX_REAPER_INTERVAL_HOURS * 3600)
        );
    }

    #[test]
    fn test_tier_directories() {
        let config = CacheConfig::with_root("/var/cache/tc");
        assert_eq!(config.disk_dir(), PathBuf::from("/var/cache/tc/disk"));
        assert_eq!(config.compressed_dir(), PathBuf::from("/var/cache/tc/compressed"));
        assert_eq!(config.structured_dir(), PathBuf::from("/var/cache/tc/structured"));
        assert_eq!(config.reaper_interval(), Duration::from_secs(6 * 3600));
    }
}
