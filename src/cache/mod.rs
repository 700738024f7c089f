//! Four-Tier Cache
//!
//! Caches computed artifacts keyed by a namespace plus a parameter map.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                          CacheManager                              │
//! ├──────────────┬──────────────┬────────────────┬─────────────────────┤
//! │ MemoryTier   │ DiskTier     │ CompressedTier │ StructuredStoreTier │
//! │ in-process   │ file pairs   │ LZ4 file pairs │ SQLite table        │
//! │ LRU, bounded │ < 10 MiB     │ >= 10 MiB      │ structured values   │
//! └──────────────┴──────────────┴────────────────┴─────────────────────┘
//!          ▲ promotion on hit                 ExpiryReaper sweeps all ┘
//! ```
//!
//! Lookups probe left to right and stop at the first live hit, copying the
//! entry into every tier to its left. Writes are routed by encoded size;
//! tables, dictionaries and lists are also written to the structured store.
//!
//! # Example
//!
//! ```no_run
//! use tiercache::cache::{CacheManager, CacheValue, Params};
//! use tiercache::config::CacheConfig;
//!
//! # async fn demo() -> tiercache::error::Result<()> {
//! let manager = CacheManager::new(CacheConfig::with_root("./cache"))?;
//! let params = Params::new().with("symbol", "AAA").with("start", "2024-01-01");
//!
//! manager
//!     .put("price_data", &params, CacheValue::from(b"close=10.5".to_vec()), None, None)
//!     .await?;
//! assert!(manager.get("price_data", &params).await.is_some());
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod compressed;
pub mod compression;
pub mod disk;
pub mod entry;
pub mod key;
pub mod manager;
pub mod memory;
pub mod policy;
pub mod reaper;
pub mod stats;
pub mod structured;
pub mod tier;
pub mod value;

pub use clock::{Clock, ManualClock, SystemClock};
pub use compressed::CompressedTier;
pub use compression::{CompressionAlgorithm, CompressionManager, Compressor, Lz4Compressor};
pub use disk::{DiskTier, FileStore};
pub use entry::{CacheEntry, EntryMetadata, TagSet};
pub use key::{CacheKey, KeyCodec, Params};
pub use manager::{CacheManager, CleanupReport};
pub use memory::MemoryTier;
pub use policy::{EvictionCandidate, EvictionPolicy};
pub use reaper::{ExpiryReaper, ReaperHandle};
pub use stats::{StatsCollector, StatsSnapshot, TierStats};
pub use structured::StructuredStoreTier;
pub use tier::{Tier, TierName, TierUsage};
pub use value::{CacheValue, StructuredValue, Table};
