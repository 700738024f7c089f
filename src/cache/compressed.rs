//! Compressed Tier - disk layout with LZ4-framed payloads
//!
//! Metadata keeps the uncompressed payload size; usage reports bytes as
//! stored. Payloads that cannot be decompressed are returned as stored, and
//! a payload that then fails to decode is dropped by the manager.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::compression::CompressionManager;
use super::disk::{blocking, FileStore};
use super::entry::{CacheEntry, TagSet};
use super::key::CacheKey;
use super::tier::{Tier, TierName, TierUsage};
use crate::error::Result;

/// Compressed file tier
pub struct CompressedTier {
    store: Arc<FileStore>,
    compression: Arc<CompressionManager>,
}

impl CompressedTier {
    pub const PAYLOAD_SUFFIX: &'static str = ".bin.lz4";

    pub fn open(dir: impl Into<PathBuf>, compression: CompressionManager) -> Result<Self> {
        Ok(Self {
            store: Arc::new(FileStore::open(
                dir,
                Self::PAYLOAD_SUFFIX,
                TierName::Compressed,
            )?),
            compression: Arc::new(compression),
        })
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }
}

#[async_trait]
impl Tier for CompressedTier {
    fn name(&self) -> TierName {
        TierName::Compressed
    }

    async fn read(&self, key: &CacheKey, now: DateTime<Utc>) -> Result<Option<CacheEntry>> {
        let key = key.clone();
        let compression = Arc::clone(&self.compression);
        blocking(&self.store, move |store| {
            Ok(store.load(&key, now)?.map(|(stored, metadata)| {
                let max_len = usize::try_from(metadata.size_bytes).unwrap_or(usize::MAX);
                let payload = compression.decompress_or_raw(&stored, max_len);
                CacheEntry::new(key, payload, metadata)
            }))
        })
        .await
    }

    async fn contains(&self, key: &CacheKey, now: DateTime<Utc>) -> Result<bool> {
        let digest = key.as_str().to_string();
        blocking(&self.store, move |store| store.contains(&digest, now)).await
    }

    async fn write(&self, entry: &CacheEntry) -> Result<()> {
        let entry = entry.clone();
        let compression = Arc::clone(&self.compression);
        blocking(&self.store, move |store| {
            let stored = compression.compress(&entry.payload)?;
            store.store(&entry.key, &stored, &entry.metadata)
        })
        .await
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool> {
        let digest = key.as_str().to_string();
        blocking(&self.store, move |store| store.delete(&digest)).await
    }

    async fn clear(&self, tags: Option<&TagSet>) -> Result<u64> {
        let tags = tags.cloned();
        blocking(&self.store, move |store| store.clear(tags.as_ref())).await
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        blocking(&self.store, move |store| store.sweep(now)).await
    }

    async fn usage(&self) -> Result<TierUsage> {
        blocking(&self.store, |store| store.usage()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::EntryMetadata;
    use bytes::Bytes;
    use chrono::Duration;
    use tempfile::TempDir;

    fn big_entry(name: &str, now: DateTime<Utc>) -> CacheEntry {
        let payload = Bytes::from(vec![b'a'; 256 * 1024]);
        let size = payload.len() as u64;
        CacheEntry::new(
            CacheKey::from_parts("ns", name),
            payload,
            EntryMetadata::new("ns", now, Duration::hours(1), TagSet::new(), size),
        )
    }

    #[tokio::test]
    async fn test_payload_stored_compressed() {
        let dir = TempDir::new().unwrap();
        let tier = CompressedTier::open(dir.path(), CompressionManager::new()).unwrap();
        let now = Utc::now();
        let e = big_entry("a", now);

        tier.write(&e).await.unwrap();
        let on_disk = std::fs::metadata(dir.path().join("a.bin.lz4")).unwrap().len();
        assert!(on_disk < e.size());

        let hit = tier.read(&e.key, now).await.unwrap().unwrap();
        assert_eq!(hit.payload, e.payload);
        assert_eq!(hit.metadata.size_bytes, e.size());
    }

    #[tokio::test]
    async fn test_uncompressed_payload_read_as_is() {
        let dir = TempDir::new().unwrap();
        let now = Utc::now();
        let e = big_entry("a", now);

        // Written while compression was off, read back with it on
        CompressedTier::open(dir.path(), CompressionManager::with_settings(false, 4))
            .unwrap()
            .write(&e)
            .await
            .unwrap();
        let tier = CompressedTier::open(dir.path(), CompressionManager::new()).unwrap();

        let hit = tier.read(&e.key, now).await.unwrap().unwrap();
        assert_eq!(hit.payload, e.payload);
    }

    #[tokio::test]
    async fn test_usage_reports_stored_bytes() {
        let dir = TempDir::new().unwrap();
        let tier = CompressedTier::open(dir.path(), CompressionManager::new()).unwrap();
        let e = big_entry("a", Utc::now());
        tier.write(&e).await.unwrap();

        let usage = tier.usage().await.unwrap();
        assert_eq!(usage.entries_count, 1);
        assert!(usage.bytes_used < e.size());
    }
}
