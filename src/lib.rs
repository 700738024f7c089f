//! tiercache - Four-Tier Artifact Cache
//!
//! Stores computed artifacts (tables, dictionaries, lists, raw bytes) keyed
//! by a namespace plus a parameter map, across an in-process memory tier,
//! a file tier, an LZ4-compressed file tier and an embedded SQLite store.
//!
//! # Architecture
//!
//! ```text
//! caller ──get/put──▶ CacheManager ──▶ Memory → Disk → Compressed → Structured
//!                          ▲
//!                   ExpiryReaper (periodic sweep + compaction)
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Tiers, key derivation, manager, reaper and statistics
//! - [`config`] - YAML-backed configuration
//! - [`error`] - Error types

pub mod cache;
pub mod config;
pub mod error;

// Re-export commonly used types
pub use cache::{
    CacheKey, CacheManager, CacheValue, CleanupReport, ExpiryReaper, KeyCodec, Params,
    ReaperHandle, StatsSnapshot, StructuredValue, Table, TagSet, TierName,
};
pub use config::CacheConfig;
pub use error::{Error, Result};

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
