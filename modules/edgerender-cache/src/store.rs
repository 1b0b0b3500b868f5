//! The local cache store: blob files on disk, metadata in Redis.
//!
//! Write ordering is blob first, metadata second — the metadata SET is the
//! commit point. A crash between the two leaves an orphan blob that no
//! reader will ever serve; orphans are overwritten by the next put of the
//! same key.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use edgerender_common::{CacheKey, CacheMetadata, Compression, ExpiredPolicy};

use crate::blob::{compress, decompress, BlobStore, MIN_COMPRESS_SIZE};
use crate::error::{CacheError, Result};
use crate::meta::MetaStore;

/// Result of a cache lookup.
#[derive(Debug)]
pub enum Lookup {
    Hit {
        metadata: CacheMetadata,
        body: Vec<u8>,
        /// True when served past `expires_at` under the serve-stale policy.
        stale: bool,
    },
    Miss,
}

pub struct CacheStore {
    blobs: BlobStore,
    meta: Arc<dyn MetaStore>,
}

impl CacheStore {
    pub fn new(base_path: impl Into<std::path::PathBuf>, meta: Arc<dyn MetaStore>) -> Self {
        Self {
            blobs: BlobStore::new(base_path),
            meta,
        }
    }

    /// Look a key up. Metadata-store failures degrade to a miss: an
    /// unreachable Redis must not take render serving down with it.
    pub async fn get(
        &self,
        key: &CacheKey,
        policy: ExpiredPolicy,
        stale_ttl: Duration,
    ) -> Result<Lookup> {
        let metadata = match self.meta.get(&key.meta_key()).await {
            Ok(Some(m)) => m,
            Ok(None) => return Ok(Lookup::Miss),
            Err(e) => {
                warn!(key = %key, error = %e, "Metadata read failed, treating as miss");
                return Ok(Lookup::Miss);
            }
        };

        let now = Utc::now();
        let stale = if metadata.is_expired(now) {
            match policy {
                ExpiredPolicy::ServeStale => {
                    let stale_deadline = metadata.expires_at
                        + chrono::Duration::from_std(stale_ttl).unwrap_or_default();
                    if now >= stale_deadline {
                        self.delete(key).await;
                        return Ok(Lookup::Miss);
                    }
                    true
                }
                ExpiredPolicy::Delete => {
                    self.delete(key).await;
                    return Ok(Lookup::Miss);
                }
            }
        } else {
            false
        };

        let body = match self.blobs.read(&metadata.file_path).await {
            Ok(bytes) => decompress(&bytes, metadata.compression)?,
            Err(e) => {
                // Metadata without a blob: clean up and miss.
                warn!(key = %key, error = %e, "Blob missing for metadata, dropping entry");
                self.delete(key).await;
                return Ok(Lookup::Miss);
            }
        };

        Ok(Lookup::Hit {
            metadata,
            body,
            stale,
        })
    }

    /// Store a freshly rendered body. `metadata.file_path` and
    /// `metadata.compression` are filled in here; everything else is the
    /// caller's. `stale_window` extends the metadata TTL past `expires_at`
    /// so serve-stale reads can still find the entry.
    pub async fn put(
        &self,
        key: &CacheKey,
        body: &[u8],
        mut metadata: CacheMetadata,
        preferred: Compression,
        stale_window: Duration,
    ) -> Result<CacheMetadata> {
        let effective = if body.len() >= MIN_COMPRESS_SIZE {
            preferred
        } else {
            Compression::None
        };

        let rel = BlobStore::rel_path(key, effective);
        let packed = compress(body, effective)?;
        self.blobs.write(&rel, &packed).await?;

        metadata.file_path = rel;
        metadata.compression = effective;

        let ttl = retained_ttl(&metadata, stale_window)?;
        self.meta.set(&key.meta_key(), &metadata, ttl).await?;
        Ok(metadata)
    }

    /// Store a replica pushed from another EG. The bytes arrive exactly as
    /// stored there (already compressed); the metadata rides along
    /// unchanged so replicas expire in step with the origin copy.
    pub async fn put_replica(
        &self,
        key: &CacheKey,
        stored_bytes: &[u8],
        metadata: &CacheMetadata,
        stale_window: Duration,
    ) -> Result<()> {
        // The path comes from a peer; keep it inside the blob root.
        if metadata.file_path.starts_with('/')
            || metadata.file_path.split('/').any(|segment| segment == "..")
        {
            return Err(CacheError::InvalidPath(metadata.file_path.clone()));
        }
        let ttl = retained_ttl(metadata, stale_window)?;
        self.blobs.write(&metadata.file_path, stored_bytes).await?;
        self.meta.set(&key.meta_key(), metadata, ttl).await?;
        Ok(())
    }

    /// Raw stored form of an entry, for serving a shard pull: the bytes on
    /// disk plus metadata. The puller decompresses by extension.
    pub async fn read_stored(&self, key: &CacheKey) -> Option<(CacheMetadata, Vec<u8>)> {
        let metadata = match self.meta.get(&key.meta_key()).await {
            Ok(Some(m)) => m,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %key, error = %e, "Metadata read failed during pull");
                return None;
            }
        };
        match self.blobs.read(&metadata.file_path).await {
            Ok(bytes) => Some((metadata, bytes)),
            Err(e) => {
                warn!(key = %key, error = %e, "Blob missing during pull, dropping entry");
                self.delete(key).await;
                None
            }
        }
    }

    /// Best-effort removal: blob variants unlinked, then metadata DEL.
    /// Returns whether metadata existed. Never fails the caller.
    pub async fn delete(&self, key: &CacheKey) -> bool {
        self.blobs.remove_all_variants(key).await;
        match self.meta.delete(&key.meta_key()).await {
            Ok(existed) => existed,
            Err(e) => {
                warn!(key = %key, error = %e, "Metadata delete failed");
                false
            }
        }
    }

    pub async fn exists(&self, key: &CacheKey) -> bool {
        self.meta.exists(&key.meta_key()).await.unwrap_or(false)
    }

    /// Record a crawler hit on an entry, preserving its remaining TTL.
    pub async fn touch_bot_hit(&self, key: &CacheKey, now: DateTime<Utc>, stale_window: Duration) {
        let mut metadata = match self.meta.get(&key.meta_key()).await {
            Ok(Some(m)) => m,
            _ => return,
        };
        metadata.last_bot_hit = Some(now);
        if let Ok(ttl) = retained_ttl(&metadata, stale_window) {
            if let Err(e) = self.meta.set(&key.meta_key(), &metadata, ttl).await {
                warn!(key = %key, error = %e, "Failed to record bot hit");
            }
        }
    }
}

/// Metadata retention: time to `expires_at` plus the stale window.
fn retained_ttl(metadata: &CacheMetadata, stale_window: Duration) -> Result<Duration> {
    let remaining_ms = (metadata.expires_at - Utc::now()).num_milliseconds();
    if remaining_ms <= 0 {
        return Err(CacheError::AlreadyExpired(metadata.expires_at));
    }
    Ok(Duration::from_millis(remaining_ms as u64) + stale_window)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MemoryMetaStore;
    use edgerender_common::CacheSource;
    use std::collections::HashMap;

    fn make_store() -> (tempfile::TempDir, CacheStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path(), Arc::new(MemoryMetaStore::new()));
        (dir, store)
    }

    fn make_metadata(ttl_secs: i64) -> CacheMetadata {
        let now = Utc::now();
        CacheMetadata {
            url: "https://example.com/page".into(),
            created_at: now,
            expires_at: now + chrono::Duration::seconds(ttl_secs),
            status_code: 200,
            source: CacheSource::Render,
            headers: HashMap::new(),
            file_path: String::new(),
            compression: Compression::None,
            last_bot_hit: None,
            stored_on: vec!["eg-a".into()],
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let (_dir, store) = make_store();
        let key = CacheKey::new(1, 1, "aaaa");
        let body = b"<html>hello</html>".to_vec();

        store
            .put(&key, &body, make_metadata(60), Compression::Snappy, Duration::ZERO)
            .await
            .unwrap();

        match store
            .get(&key, ExpiredPolicy::ServeStale, Duration::ZERO)
            .await
            .unwrap()
        {
            Lookup::Hit { body: got, stale, .. } => {
                assert_eq!(got, body);
                assert!(!stale);
            }
            Lookup::Miss => panic!("expected hit"),
        }
    }

    #[tokio::test]
    async fn small_bodies_are_stored_uncompressed() {
        let (_dir, store) = make_store();
        let key = CacheKey::new(1, 1, "bbbb");

        let stored = store
            .put(&key, b"tiny", make_metadata(60), Compression::Snappy, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(stored.compression, Compression::None);
        assert!(!stored.file_path.ends_with(".snappy"));
    }

    #[tokio::test]
    async fn large_bodies_compress_and_extension_records_it() {
        let (_dir, store) = make_store();
        let key = CacheKey::new(1, 1, "cccc");
        let body = b"<p>repetitive</p>".repeat(200);

        let stored = store
            .put(&key, &body, make_metadata(60), Compression::Lz4, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(stored.compression, Compression::Lz4);
        assert!(stored.file_path.ends_with(".lz4"));

        match store
            .get(&key, ExpiredPolicy::ServeStale, Duration::ZERO)
            .await
            .unwrap()
        {
            Lookup::Hit { body: got, .. } => assert_eq!(got, body),
            Lookup::Miss => panic!("expected hit"),
        }
    }

    #[tokio::test]
    async fn expired_entry_serves_stale_within_window() {
        let (_dir, store) = make_store();
        let key = CacheKey::new(1, 1, "dddd");
        let body = b"<html>old</html>".to_vec();

        // Expires in 50ms; stale window of one hour keeps it servable.
        let mut metadata = make_metadata(60);
        metadata.expires_at = Utc::now() + chrono::Duration::milliseconds(50);
        store
            .put(&key, &body, metadata, Compression::None, Duration::from_secs(3600))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;

        match store
            .get(&key, ExpiredPolicy::ServeStale, Duration::from_secs(3600))
            .await
            .unwrap()
        {
            Lookup::Hit { stale, .. } => assert!(stale),
            Lookup::Miss => panic!("expected stale hit"),
        }
    }

    #[tokio::test]
    async fn expired_entry_under_delete_policy_is_dropped() {
        let (_dir, store) = make_store();
        let key = CacheKey::new(1, 1, "eeee");

        let mut metadata = make_metadata(60);
        metadata.expires_at = Utc::now() + chrono::Duration::milliseconds(50);
        store
            .put(&key, b"<html>old</html>", metadata, Compression::None, Duration::from_secs(3600))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(matches!(
            store
                .get(&key, ExpiredPolicy::Delete, Duration::ZERO)
                .await
                .unwrap(),
            Lookup::Miss
        ));
        assert!(!store.exists(&key).await);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_dir, store) = make_store();
        let key = CacheKey::new(1, 1, "ffff");

        store
            .put(&key, b"<html></html>", make_metadata(60), Compression::None, Duration::ZERO)
            .await
            .unwrap();
        assert!(store.delete(&key).await);
        assert!(!store.delete(&key).await);
        assert!(!store.exists(&key).await);
    }

    #[tokio::test]
    async fn replica_round_trips_stored_bytes() {
        let (_dir, origin) = make_store();
        let (_dir2, replica) = make_store();
        let key = CacheKey::new(2, 1, "abab");
        let body = b"<html>shared</html>".repeat(100);

        let metadata = origin
            .put(&key, &body, make_metadata(60), Compression::Snappy, Duration::ZERO)
            .await
            .unwrap();

        let (meta, stored_bytes) = origin.read_stored(&key).await.unwrap();
        assert_eq!(meta.file_path, metadata.file_path);

        replica
            .put_replica(&key, &stored_bytes, &meta, Duration::ZERO)
            .await
            .unwrap();

        match replica
            .get(&key, ExpiredPolicy::ServeStale, Duration::ZERO)
            .await
            .unwrap()
        {
            Lookup::Hit { body: got, .. } => assert_eq!(got, body),
            Lookup::Miss => panic!("expected replica hit"),
        }
    }

    #[tokio::test]
    async fn replica_rejects_escaping_paths() {
        let (_dir, store) = make_store();
        let key = CacheKey::new(1, 1, "ijkl");
        let mut metadata = make_metadata(60);
        metadata.file_path = "../outside".into();

        let result = store
            .put_replica(&key, b"bytes", &metadata, Duration::ZERO)
            .await;
        assert!(matches!(result, Err(CacheError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn putting_already_expired_metadata_fails() {
        let (_dir, store) = make_store();
        let key = CacheKey::new(1, 1, "gggg");
        let mut metadata = make_metadata(60);
        metadata.expires_at = Utc::now() - chrono::Duration::seconds(1);

        let result = store
            .put(&key, b"<html></html>", metadata, Compression::None, Duration::ZERO)
            .await;
        assert!(matches!(result, Err(CacheError::AlreadyExpired(_))));
    }

    #[tokio::test]
    async fn bot_hit_touch_records_timestamp() {
        let (_dir, store) = make_store();
        let key = CacheKey::new(1, 1, "hhhh");

        store
            .put(&key, b"<html></html>", make_metadata(60), Compression::None, Duration::ZERO)
            .await
            .unwrap();

        let now = Utc::now();
        store.touch_bot_hit(&key, now, Duration::ZERO).await;

        match store
            .get(&key, ExpiredPolicy::ServeStale, Duration::ZERO)
            .await
            .unwrap()
        {
            Lookup::Hit { metadata, .. } => {
                assert_eq!(metadata.last_bot_hit, Some(now));
            }
            Lookup::Miss => panic!("expected hit"),
        }
    }
}
