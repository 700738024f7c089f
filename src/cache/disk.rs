//! Disk Tier - one payload file and one metadata file per key
//!
//! Layout inside the tier directory:
//!
//! ```text
//! {digest}{payload_suffix}   encoded payload
//! {digest}.meta              JSON EntryMetadata
//! ```
//!
//! Writes go through a temporary file and a rename. The payload lands
//! before its metadata, so a metadata file always points at a complete
//! payload. A payload without metadata is an orphan and is removed by the
//! next sweep, as are temporary files older than ten minutes.
//!
//! File I/O is blocking and runs on tokio's blocking pool.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::entry::{CacheEntry, EntryMetadata, TagSet};
use super::key::CacheKey;
use super::tier::{Tier, TierName, TierUsage};
use crate::error::{Error, Result};

const META_SUFFIX: &str = ".meta";
const TMP_SUFFIX: &str = ".tmp";

/// Temporary files older than this were left by an interrupted write
const STALE_TMP_MINUTES: i64 = 10;

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Result of looking up one metadata file
enum MetaLookup {
    Missing,
    Corrupt(String),
    Found(EntryMetadata),
}

/// Blocking payload + metadata file store shared by the disk and
/// compressed tiers
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    payload_suffix: &'static str,
    tier: TierName,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`
    pub fn open(dir: impl Into<PathBuf>, payload_suffix: &'static str, tier: TierName) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            payload_suffix,
            tier,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn payload_path(&self, digest: &str) -> PathBuf {
        self.dir.join(format!("{}{}", digest, self.payload_suffix))
    }

    pub fn meta_path(&self, digest: &str) -> PathBuf {
        self.dir.join(format!("{}{}", digest, META_SUFFIX))
    }

    /// Write payload then metadata
    pub fn store(&self, key: &CacheKey, payload: &[u8], metadata: &EntryMetadata) -> Result<()> {
        let meta = serde_json::to_vec(metadata)?;
        write_atomic(&self.payload_path(key.as_str()), payload)?;
        write_atomic(&self.meta_path(key.as_str()), &meta)?;
        Ok(())
    }

    fn lookup_meta(&self, digest: &str) -> Result<MetaLookup> {
        let raw = match fs::read(self.meta_path(digest)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(MetaLookup::Missing),
            Err(e) => return Err(e.into()),
        };
        let metadata: EntryMetadata = match serde_json::from_slice(&raw) {
            Ok(m) => m,
            Err(e) => return Ok(MetaLookup::Corrupt(e.to_string())),
        };
        match metadata.check() {
            Ok(()) => Ok(MetaLookup::Found(metadata)),
            Err(reason) => Ok(MetaLookup::Corrupt(reason)),
        }
    }

    /// Read metadata without touching the payload.
    ///
    /// Unreadable or inconsistent records surface as
    /// [`Error::CorruptedMetadata`].
    pub fn load_meta(&self, digest: &str) -> Result<Option<EntryMetadata>> {
        match self.lookup_meta(digest)? {
            MetaLookup::Missing => Ok(None),
            MetaLookup::Found(m) => Ok(Some(m)),
            MetaLookup::Corrupt(reason) => Err(Error::CorruptedMetadata {
                key: digest.to_string(),
                reason,
            }),
        }
    }

    /// True if an unexpired, readable record exists; never mutates
    pub fn contains(&self, digest: &str, now: DateTime<Utc>) -> Result<bool> {
        match self.lookup_meta(digest)? {
            MetaLookup::Found(m) => Ok(!m.is_expired(now) && self.payload_path(digest).exists()),
            _ => Ok(false),
        }
    }

    /// Load an unexpired payload and record the access in its metadata.
    ///
    /// Corrupt or expired records are deleted and reported as absent.
    pub fn load(&self, key: &CacheKey, now: DateTime<Utc>) -> Result<Option<(Bytes, EntryMetadata)>> {
        let digest = key.as_str();
        let mut metadata = match self.lookup_meta(digest)? {
            MetaLookup::Missing => return Ok(None),
            MetaLookup::Corrupt(reason) => {
                warn!(tier = %self.tier, key = %key, "corrupted metadata, dropping entry: {}", reason);
                self.delete(digest)?;
                return Ok(None);
            }
            MetaLookup::Found(m) => m,
        };

        if metadata.is_expired(now) {
            debug!(tier = %self.tier, key = %key, "expired on read");
            self.delete(digest)?;
            return Ok(None);
        }

        let payload = match fs::read(self.payload_path(digest)) {
            Ok(p) => Bytes::from(p),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(tier = %self.tier, key = %key, "metadata without payload, dropping entry");
                self.delete(digest)?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        metadata.record_access(now);
        // Losing an access-count update is not worth failing the read
        if let Err(e) = serde_json::to_vec(&metadata)
            .map_err(Error::from)
            .and_then(|raw| write_atomic(&self.meta_path(digest), &raw).map_err(Error::from))
        {
            warn!(tier = %self.tier, key = %key, "failed to update access stats: {}", e);
        }

        Ok(Some((payload, metadata)))
    }

    /// Remove both files of a key; true if either existed
    pub fn delete(&self, digest: &str) -> Result<bool> {
        let meta = remove_if_exists(&self.meta_path(digest))?;
        let payload = remove_if_exists(&self.payload_path(digest))?;
        Ok(meta || payload)
    }

    /// Remove every file, or only entries whose metadata carries any of `tags`
    pub fn clear(&self, tags: Option<&TagSet>) -> Result<u64> {
        let names = self.list()?;
        let mut removed = 0u64;

        match tags {
            None => {
                for name in &names {
                    if name.ends_with(META_SUFFIX) {
                        removed += 1;
                    }
                    remove_if_exists(&self.dir.join(name))?;
                }
            }
            Some(tags) => {
                for digest in names.iter().filter_map(|n| n.strip_suffix(META_SUFFIX)) {
                    match self.lookup_meta(digest)? {
                        MetaLookup::Found(m) if m.has_any_tag(tags) => {
                            self.delete(digest)?;
                            removed += 1;
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(removed)
    }

    /// Remove expired and corrupt entries, orphaned payloads and stale
    /// temporary files.
    ///
    /// Returns the number of entries removed; leftovers are not counted.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<u64> {
        let names = self.list()?;
        let mut removed = 0u64;

        for digest in names.iter().filter_map(|n| n.strip_suffix(META_SUFFIX)) {
            match self.lookup_meta(digest)? {
                MetaLookup::Found(m) if !m.is_expired(now) => {}
                MetaLookup::Missing => {}
                MetaLookup::Found(_) => {
                    self.delete(digest)?;
                    removed += 1;
                }
                MetaLookup::Corrupt(reason) => {
                    warn!(tier = %self.tier, digest, "removing entry with corrupted metadata: {}", reason);
                    self.delete(digest)?;
                    removed += 1;
                }
            }
        }

        for digest in names.iter().filter_map(|n| n.strip_suffix(self.payload_suffix)) {
            if !self.meta_path(digest).exists() && remove_if_exists(&self.payload_path(digest))? {
                debug!(tier = %self.tier, digest, "removed orphaned payload");
            }
        }

        for name in names.iter().filter(|n| n.ends_with(TMP_SUFFIX)) {
            let path = self.dir.join(name);
            if is_stale(&path, now)? && remove_if_exists(&path)? {
                debug!(tier = %self.tier, file = %name, "removed stale temporary file");
            }
        }

        Ok(removed)
    }

    /// Entry count from metadata files, bytes from payload and metadata files
    pub fn usage(&self) -> Result<TierUsage> {
        let mut usage = TierUsage::default();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(usage),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(TMP_SUFFIX) {
                continue;
            }
            usage.bytes_used += meta.len();
            if name.ends_with(META_SUFFIX) {
                usage.entries_count += 1;
            }
        }
        Ok(usage)
    }

    fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!("{}.{}{}", file_name, seq, TMP_SUFFIX));

    fs::write(&tmp, data)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

fn is_stale(path: &Path, now: DateTime<Utc>) -> io::Result<bool> {
    let modified = match fs::metadata(path) {
        Ok(meta) => meta.modified()?,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    let age = now.signed_duration_since(DateTime::<Utc>::from(modified));
    Ok(age >= chrono::Duration::minutes(STALE_TMP_MINUTES))
}

fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Run a blocking store operation on tokio's blocking pool
pub(crate) async fn blocking<T, F>(store: &Arc<FileStore>, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&FileStore) -> Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(&store)).await?
}

// =============================================================================
// Disk Tier
// =============================================================================

/// Uncompressed file tier
pub struct DiskTier {
    store: Arc<FileStore>,
}

impl DiskTier {
    pub const PAYLOAD_SUFFIX: &'static str = ".bin";

    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            store: Arc::new(FileStore::open(dir, Self::PAYLOAD_SUFFIX, TierName::Disk)?),
        })
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }
}

#[async_trait]
impl Tier for DiskTier {
    fn name(&self) -> TierName {
        TierName::Disk
    }

    async fn read(&self, key: &CacheKey, now: DateTime<Utc>) -> Result<Option<CacheEntry>> {
        let key = key.clone();
        blocking(&self.store, move |store| {
            Ok(store
                .load(&key, now)?
                .map(|(payload, metadata)| CacheEntry::new(key, payload, metadata)))
        })
        .await
    }

    async fn contains(&self, key: &CacheKey, now: DateTime<Utc>) -> Result<bool> {
        let digest = key.as_str().to_string();
        blocking(&self.store, move |store| store.contains(&digest, now)).await
    }

    async fn write(&self, entry: &CacheEntry) -> Result<()> {
        let entry = entry.clone();
        blocking(&self.store, move |store| {
            store.store(&entry.key, &entry.payload, &entry.metadata)
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

// =============================================================================
// Tests
// =============================================================================
