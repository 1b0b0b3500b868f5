//! Blob file layout and compression.
//!
//! Bodies live under `<base>/<host_id>/<dimension_id>/<url_hash>[.snappy|.lz4]`.
//! The extension is the single source of truth for the algorithm; metadata
//! records it redundantly for observability.

use std::path::{Path, PathBuf};

use edgerender_common::{CacheKey, Compression};

use crate::error::{CacheError, Result};

/// Bodies smaller than this are never compressed.
pub const MIN_COMPRESS_SIZE: usize = 1024;

pub struct BlobStore {
    base: PathBuf,
}

impl BlobStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Relative blob path for a key under a given compression.
    pub fn rel_path(key: &CacheKey, compression: Compression) -> String {
        format!(
            "{}/{}/{}{}",
            key.host_id,
            key.dimension_id,
            key.url_hash,
            compression.extension()
        )
    }

    fn abs(&self, rel: &str) -> PathBuf {
        self.base.join(rel)
    }

    pub async fn write(&self, rel: &str, bytes: &[u8]) -> Result<()> {
        let path = self.abs(rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| io_err(parent, source))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|source| io_err(&path, source))
    }

    pub async fn read(&self, rel: &str) -> Result<Vec<u8>> {
        let path = self.abs(rel);
        tokio::fs::read(&path)
            .await
            .map_err(|source| io_err(&path, source))
    }

    /// Best-effort unlink. Missing files are fine.
    pub async fn remove(&self, rel: &str) {
        let path = self.abs(rel);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "Failed to unlink blob");
            }
        }
    }

    /// Unlink every possible compression variant of a key's blob.
    pub async fn remove_all_variants(&self, key: &CacheKey) {
        for c in [Compression::None, Compression::Snappy, Compression::Lz4] {
            self.remove(&Self::rel_path(key, c)).await;
        }
    }
}

fn io_err(path: &Path, source: std::io::Error) -> CacheError {
    CacheError::Io {
        path: path.display().to_string(),
        source,
    }
}

pub fn compress(bytes: &[u8], compression: Compression) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(bytes.to_vec()),
        Compression::Snappy => snap::raw::Encoder::new()
            .compress_vec(bytes)
            .map_err(|e| CacheError::Compression(format!("snappy encode: {e}"))),
        Compression::Lz4 => Ok(lz4_flex::compress_prepend_size(bytes)),
    }
}

pub fn decompress(bytes: &[u8], compression: Compression) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(bytes.to_vec()),
        Compression::Snappy => snap::raw::Decoder::new()
            .decompress_vec(bytes)
            .map_err(|e| CacheError::Compression(format!("snappy decode: {e}"))),
        Compression::Lz4 => lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| CacheError::Compression(format!("lz4 decode: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rel_path_encodes_compression() {
        let key = CacheKey::new(1, 2, "abcd");
        assert_eq!(BlobStore::rel_path(&key, Compression::None), "1/2/abcd");
        assert_eq!(
            BlobStore::rel_path(&key, Compression::Snappy),
            "1/2/abcd.snappy"
        );
        assert_eq!(BlobStore::rel_path(&key, Compression::Lz4), "1/2/abcd.lz4");
    }

    #[test]
    fn compression_round_trips() {
        let body = b"<html>".repeat(500);
        for c in [Compression::None, Compression::Snappy, Compression::Lz4] {
            let packed = compress(&body, c).unwrap();
            let unpacked = decompress(&packed, c).unwrap();
            assert_eq!(unpacked, body, "{c:?}");
        }
    }

    #[test]
    fn snappy_actually_shrinks_repetitive_html() {
        let body = b"<div class=\"row\"></div>".repeat(200);
        let packed = compress(&body, Compression::Snappy).unwrap();
        assert!(packed.len() < body.len());
    }

    #[tokio::test]
    async fn write_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());

        store.write("1/1/hash", b"body").await.unwrap();
        assert_eq!(store.read("1/1/hash").await.unwrap(), b"body");

        store.remove("1/1/hash").await;
        assert!(store.read("1/1/hash").await.is_err());

        // Removing a missing blob is quiet.
        store.remove("1/1/hash").await;
    }
}
