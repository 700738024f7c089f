//! Storage tier abstraction

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entry::{CacheEntry, TagSet};
use super::key::CacheKey;
use crate::error::{Error, Result};

/// Tier identity, ordered fastest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierName {
    /// In-process map
    Memory,
    /// One payload file + one metadata file per key
    Disk,
    /// Like disk, with LZ4-compressed payloads
    Compressed,
    /// Embedded SQLite store
    Structured,
}

impl TierName {
    /// Probe order for lookups
    pub const ALL: [TierName; 4] = [
        TierName::Memory,
        TierName::Disk,
        TierName::Compressed,
        TierName::Structured,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TierName::Memory => "memory",
            TierName::Disk => "disk",
            TierName::Compressed => "compressed",
            TierName::Structured => "structured",
        }
    }

    /// Position in [`TierName::ALL`]
    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for TierName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TierName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(TierName::Memory),
            "disk" => Ok(TierName::Disk),
            "compressed" => Ok(TierName::Compressed),
            // "sqlite" is accepted for parity with older tooling
            "structured" | "sqlite" => Ok(TierName::Structured),
            other => Err(Error::Config(format!("unknown tier: {}", other))),
        }
    }
}

/// On-demand size figures for one tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierUsage {
    pub entries_count: u64,
    pub bytes_used: u64,
}

/// A storage backend the manager probes and writes through
#[async_trait]
pub trait Tier: Send + Sync {
    fn name(&self) -> TierName;

    /// Fetch an unexpired entry, recording the access.
    ///
    /// Expired records are deleted and reported as absent.
    async fn read(&self, key: &CacheKey, now: DateTime<Utc>) -> Result<Option<CacheEntry>>;

    /// Check for an unexpired entry without recording an access
    async fn contains(&self, key: &CacheKey, now: DateTime<Utc>) -> Result<bool>;

    /// Store (or replace) an entry
    async fn write(&self, entry: &CacheEntry) -> Result<()>;

    /// Delete a key; returns whether anything was removed
    async fn remove(&self, key: &CacheKey) -> Result<bool>;

    /// Remove everything, or only entries carrying any of `tags`
    async fn clear(&self, tags: Option<&TagSet>) -> Result<u64>;

    /// Remove entries expired at `now`
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    async fn usage(&self) -> Result<TierUsage>;

    /// Reclaim space left by removals; a no-op unless the backend needs it
    async fn compact(&self) -> Result<()> {
        Ok(())
    }
}
