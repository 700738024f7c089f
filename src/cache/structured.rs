//! Structured Store Tier - embedded SQLite table keyed by cache key
//!
//! Expiry and access columns are kept alongside the JSON metadata so sweeps
//! and maintenance can run as plain SQL.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use super::entry::{CacheEntry, EntryMetadata, TagSet};
use super::key::CacheKey;
use super::tier::{Tier, TierName, TierUsage};
use crate::error::Result;

/// Database file name inside the tier directory
pub const DB_FILE_NAME: &str = "cache.db";

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS cache_data (
        key TEXT PRIMARY KEY,
        namespace TEXT NOT NULL,
        payload BLOB NOT NULL,
        metadata TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL,
        access_count INTEGER NOT NULL DEFAULT 0,
        last_access INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_cache_expires_at ON cache_data(expires_at);
    CREATE INDEX IF NOT EXISTS idx_cache_last_access ON cache_data(last_access);
"#;

/// SQLite-backed tier
pub struct StructuredStoreTier {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl StructuredStoreTier {
    /// Open (creating if needed) `cache.db` under `dir`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        let path = dir.as_ref().join(DB_FILE_NAME);
        let conn = Connection::open(&path)?;
        conn.busy_timeout(StdDuration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), "opened structured store");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a closure against the connection on the blocking pool
    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            op(&mut conn)
        })
        .await?
    }

    /// Delete entries carrying any of `tags`
    pub async fn delete_by_tag(&self, tags: &TagSet) -> Result<u64> {
        let tags = tags.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let doomed = {
                let mut stmt = tx.prepare("SELECT key, metadata FROM cache_data")?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                let mut doomed = Vec::new();
                for row in rows {
                    let (key, raw) = row?;
                    if let Ok(metadata) = serde_json::from_str::<EntryMetadata>(&raw) {
                        if metadata.has_any_tag(&tags) {
                            doomed.push(key);
                        }
                    }
                }
                doomed
            };
            for key in &doomed {
                tx.execute("DELETE FROM cache_data WHERE key = ?1", params![key])?;
            }
            tx.commit()?;
            Ok(doomed.len() as u64)
        })
        .await
    }

    /// Reclaim space left by deletions
    pub async fn vacuum(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch("VACUUM")?;
            Ok(())
        })
        .await?;
        info!(path = %self.path.display(), "structured store compacted");
        Ok(())
    }
}

fn decode_metadata(raw: &str) -> std::result::Result<EntryMetadata, String> {
    let metadata: EntryMetadata = serde_json::from_str(raw).map_err(|e| e.to_string())?;
    metadata.check()?;
    Ok(metadata)
}

#[async_trait]
impl Tier for StructuredStoreTier {
    fn name(&self) -> TierName {
        TierName::Structured
    }

    async fn read(&self, key: &CacheKey, now: DateTime<Utc>) -> Result<Option<CacheEntry>> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let row: Option<(Vec<u8>, String)> = conn
                .query_row(
                    "SELECT payload, metadata FROM cache_data WHERE key = ?1",
                    params![key.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((payload, raw)) = row else {
                return Ok(None);
            };

            let mut metadata = match decode_metadata(&raw) {
                Ok(m) => m,
                Err(reason) => {
                    warn!(key = %key, "corrupted structured metadata, dropping row: {}", reason);
                    conn.execute("DELETE FROM cache_data WHERE key = ?1", params![key.as_str()])?;
                    return Ok(None);
                }
            };

            if metadata.is_expired(now) {
                conn.execute("DELETE FROM cache_data WHERE key = ?1", params![key.as_str()])?;
                return Ok(None);
            }

            metadata.record_access(now);
            conn.execute(
                "UPDATE cache_data SET access_count = ?1, last_access = ?2, metadata = ?3 WHERE key = ?4",
                params![
                    metadata.access_count as i64,
                    metadata.last_access.timestamp_millis(),
                    serde_json::to_string(&metadata)?,
                    key.as_str(),
                ],
            )?;

            Ok(Some(CacheEntry::new(key, Bytes::from(payload), metadata)))
        })
        .await
    }

    async fn contains(&self, key: &CacheKey, now: DateTime<Utc>) -> Result<bool> {
        let digest = key.as_str().to_string();
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT metadata FROM cache_data WHERE key = ?1",
                    params![digest],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(raw
                .and_then(|raw| decode_metadata(&raw).ok())
                .is_some_and(|m| !m.is_expired(now)))
        })
        .await
    }

    async fn write(&self, entry: &CacheEntry) -> Result<()> {
        let entry = entry.clone();
        self.with_conn(move |conn| {
            let m = &entry.metadata;
            conn.execute(
                r#"INSERT OR REPLACE INTO cache_data
                   (key, namespace, payload, metadata, created_at, expires_at, access_count, last_access)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
                params![
                    entry.key.as_str(),
                    entry.key.namespace(),
                    entry.payload.as_ref(),
                    serde_json::to_string(m)?,
                    m.created_at.timestamp_millis(),
                    m.expires_at.timestamp_millis(),
                    m.access_count as i64,
                    m.last_access.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool> {
        let digest = key.as_str().to_string();
        self.with_conn(move |conn| {
            let n = conn.execute("DELETE FROM cache_data WHERE key = ?1", params![digest])?;
            Ok(n > 0)
        })
        .await
    }

    async fn clear(&self, tags: Option<&TagSet>) -> Result<u64> {
        match tags {
            Some(tags) => self.delete_by_tag(tags).await,
            None => {
                self.with_conn(|conn| Ok(conn.execute("DELETE FROM cache_data", [])? as u64))
                    .await
            }
        }
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let expired = tx.execute(
                "DELETE FROM cache_data WHERE expires_at <= ?1",
                params![now.timestamp_millis()],
            )? as u64;

            let corrupt = {
                let mut stmt = tx.prepare("SELECT key, metadata FROM cache_data")?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                let mut corrupt = Vec::new();
                for row in rows {
                    let (key, raw) = row?;
                    if let Err(reason) = decode_metadata(&raw) {
                        warn!(key = %key, "removing structured row with corrupted metadata: {}", reason);
                        corrupt.push(key);
                    }
                }
                corrupt
            };
            for key in &corrupt {
                tx.execute("DELETE FROM cache_data WHERE key = ?1", params![key])?;
            }
            tx.commit()?;
            Ok(expired + corrupt.len() as u64)
        })
        .await
    }

    async fn usage(&self) -> Result<TierUsage> {
        self.with_conn(|conn| {
            let (count, bytes): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(LENGTH(payload)), 0) FROM cache_data",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(TierUsage {
                entries_count: count.max(0) as u64,
                bytes_used: bytes.max(0) as u64,
            })
        })
        .await
    }

    async fn compact(&self) -> Result<()> {
        self.vacuum().await
    }
}

// =============================================================================
// Tests
// =============================================================================
