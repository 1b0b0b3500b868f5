//! Shared data model: cache keys, metadata, recache queue members, and
//! registry entries. Everything here crosses a process or wire boundary,
//! so it is all serde-serializable with stable field names.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a cache entry: which host, which render dimension, which URL.
///
/// The `url_hash` is the xxh64 fingerprint of the normalized URL (see
/// `urlnorm`). Two keys are equal iff they address the same stored entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub host_id: i32,
    pub dimension_id: i32,
    pub url_hash: String,
}

impl CacheKey {
    pub fn new(host_id: i32, dimension_id: i32, url_hash: impl Into<String>) -> Self {
        Self {
            host_id,
            dimension_id,
            url_hash: url_hash.into(),
        }
    }

    /// Redis key for the entry's metadata.
    pub fn meta_key(&self) -> String {
        format!("meta:{self}")
    }

    /// Parse the canonical `cache:<host>:<dim>:<hash>` form.
    pub fn parse(raw: &str) -> Option<Self> {
        let rest = raw.strip_prefix("cache:")?;
        let mut parts = rest.splitn(3, ':');
        let host_id = parts.next()?.parse().ok()?;
        let dimension_id = parts.next()?.parse().ok()?;
        let url_hash = parts.next()?;
        if url_hash.is_empty() {
            return None;
        }
        Some(Self::new(host_id, dimension_id, url_hash))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cache:{}:{}:{}", self.host_id, self.dimension_id, self.url_hash)
    }
}

/// How a cached body was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
    Render,
    Bypass,
}

/// Blob compression algorithm, encoded in the blob file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    None,
    Snappy,
    Lz4,
}

impl Compression {
    /// File extension suffix, including the dot. Empty for uncompressed.
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Snappy => ".snappy",
            Compression::Lz4 => ".lz4",
        }
    }

    /// Recover the algorithm from a stored file path.
    pub fn from_path(path: &str) -> Self {
        if path.ends_with(".snappy") {
            Compression::Snappy
        } else if path.ends_with(".lz4") {
            Compression::Lz4
        } else {
            Compression::None
        }
    }
}

/// Cache entry metadata, stored in Redis at `meta:<CacheKey>` with a TTL
/// matching `expires_at`. The metadata write is the commit point of a `put`:
/// a blob without metadata is an orphan and is never served.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status_code: u16,
    pub source: CacheSource,
    /// Response headers that passed the safe-response allowlist.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Blob path relative to the EG base directory. The extension encodes
    /// the compression algorithm.
    pub file_path: String,
    #[serde(default)]
    pub compression: Compression,
    /// Last time a crawler hit this entry. Drives bot-hit recaching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_bot_hit: Option<DateTime<Utc>>,
    /// EG ids currently holding a copy. Informational replica tags, not
    /// cross-references.
    #[serde(default)]
    pub stored_on: Vec<String>,
}

impl CacheMetadata {
    /// Seconds since this entry was created. Clamped at zero.
    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_seconds().max(0)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Browser viewport for a render dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1366,
            height: 768,
        }
    }
}

/// Page lifecycle event the renderer waits for before capturing HTML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WaitFor {
    #[serde(rename = "DOMContentLoaded")]
    DomContentLoaded,
    #[serde(rename = "load")]
    Load,
    #[default]
    #[serde(rename = "networkIdle")]
    NetworkIdle,
    #[serde(rename = "networkAlmostIdle")]
    NetworkAlmostIdle,
}

/// What to do with an entry whose TTL has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiredPolicy {
    /// Serve the expired body within the stale window and schedule a
    /// high-priority recache.
    #[default]
    ServeStale,
    /// Drop the entry and treat the lookup as a miss.
    Delete,
}

/// Priority class of a recache queue. Each host has one Redis ZSET per
/// priority, keyed `recache:<host>:<priority>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecachePriority {
    High,
    Normal,
    Autorecache,
}

impl RecachePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecachePriority::High => "high",
            RecachePriority::Normal => "normal",
            RecachePriority::Autorecache => "autorecache",
        }
    }

    /// Redis ZSET key for a host's queue at this priority.
    pub fn queue_key(&self, host_id: i32) -> String {
        format!("recache:{}:{}", host_id, self.as_str())
    }

    /// All priorities in strict dispatch order.
    pub fn all() -> [RecachePriority; 3] {
        [
            RecachePriority::High,
            RecachePriority::Normal,
            RecachePriority::Autorecache,
        ]
    }
}

impl fmt::Display for RecachePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recache queue member. Serialized as compact JSON so that the pair
/// `(url, dimension_id)` is the ZSET member identity: re-adding the same
/// pair updates the score instead of duplicating the member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecacheMember {
    pub url: String,
    pub dimension_id: i32,
}

impl RecacheMember {
    pub fn new(url: impl Into<String>, dimension_id: i32) -> Self {
        Self {
            url: url.into(),
            dimension_id,
        }
    }

    /// Canonical member encoding. Field order is fixed by the struct, so
    /// equal members always encode to identical strings.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("RecacheMember serializes")
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Registry entry for an edge gateway, stored at `registry:eg:<eg_id>` with
/// TTL `registry_ttl`. Health is key presence; there is no liveness probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgInfo {
    pub eg_id: String,
    pub address: String,
    pub last_heartbeat: DateTime<Utc>,
    pub sharding_enabled: bool,
}

/// Registry entry for a render service instance, stored at
/// `registry:rs:<rs_id>`. The daemon reads these to compute free capacity;
/// RS instances maintain their own entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsInfo {
    pub rs_id: String,
    pub address: String,
    pub capacity: u32,
    pub load: u32,
}

impl RsInfo {
    /// Free render slots on this instance. Zero when over capacity.
    pub fn free(&self) -> u32 {
        self.capacity.saturating_sub(self.load)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_renders_canonical_form() {
        let key = CacheKey::new(7, 2, "a1b2c3d4e5f60718");
        assert_eq!(key.to_string(), "cache:7:2:a1b2c3d4e5f60718");
        assert_eq!(key.meta_key(), "meta:cache:7:2:a1b2c3d4e5f60718");
    }

    #[test]
    fn cache_key_parse_round_trips() {
        let key = CacheKey::new(7, 2, "a1b2c3d4e5f60718");
        assert_eq!(CacheKey::parse(&key.to_string()), Some(key));
        assert_eq!(CacheKey::parse("cache:1:2:"), None);
        assert_eq!(CacheKey::parse("meta:1:2:abcd"), None);
        assert_eq!(CacheKey::parse("cache:x:2:abcd"), None);
    }

    #[test]
    fn compression_round_trips_through_path_extension() {
        for c in [Compression::None, Compression::Snappy, Compression::Lz4] {
            let path = format!("1/2/abcd{}", c.extension());
            assert_eq!(Compression::from_path(&path), c);
        }
    }

    #[test]
    fn recache_member_encoding_is_stable() {
        let a = RecacheMember::new("https://example.com/x", 3);
        let b = RecacheMember::new("https://example.com/x", 3);
        assert_eq!(a.encode(), b.encode());
        assert_eq!(RecacheMember::decode(&a.encode()).unwrap(), b);
    }

    #[test]
    fn queue_key_layout() {
        assert_eq!(RecachePriority::High.queue_key(1), "recache:1:high");
        assert_eq!(
            RecachePriority::Autorecache.queue_key(42),
            "recache:42:autorecache"
        );
    }

    #[test]
    fn metadata_age_and_expiry() {
        let now = Utc::now();
        let meta = CacheMetadata {
            url: "https://example.com/".into(),
            created_at: now - chrono::Duration::seconds(90),
            expires_at: now + chrono::Duration::seconds(10),
            status_code: 200,
            source: CacheSource::Render,
            headers: HashMap::new(),
            file_path: "1/1/abcd".into(),
            compression: Compression::None,
            last_bot_hit: None,
            stored_on: vec![],
        };
        assert_eq!(meta.age_seconds(now), 90);
        assert!(!meta.is_expired(now));
        assert!(meta.is_expired(now + chrono::Duration::seconds(11)));
    }
}
