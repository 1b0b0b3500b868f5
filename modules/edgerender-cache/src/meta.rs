//! Cache metadata persistence. The Redis implementation is the production
//! store; the in-memory one backs tests and single-node development.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use edgerender_common::CacheMetadata;

use crate::error::Result;

#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheMetadata>>;
    /// Set with TTL. The TTL is the entry's remaining life; Redis expiry
    /// is what ages entries out.
    async fn set(&self, key: &str, meta: &CacheMetadata, ttl: Duration) -> Result<()>;
    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;
    async fn exists(&self, key: &str) -> Result<bool>;
}

pub struct RedisMetaStore {
    conn: ConnectionManager,
}

impl RedisMetaStore {
    pub async fn connect(addr: &str) -> Result<Self> {
        let client = redis::Client::open(addr)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl MetaStore for RedisMetaStore {
    async fn get(&self, key: &str) -> Result<Option<CacheMetadata>> {
        let raw: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, meta: &CacheMetadata, ttl: Duration) -> Result<()> {
        let json = serde_json::to_string(meta)?;
        redis::cmd("SET")
            .arg(key)
            .arg(&json)
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async::<_, ()>(&mut self.conn.clone())
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let n: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(n > 0)
    }
}

/// In-memory metadata store with TTL semantics, for tests.
#[derive(Default)]
pub struct MemoryMetaStore {
    entries: Mutex<HashMap<String, (CacheMetadata, Instant)>>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn get(&self, key: &str) -> Result<Option<CacheMetadata>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some((meta, expiry)) if *expiry > Instant::now() => Ok(Some(meta.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, meta: &CacheMetadata, ttl: Duration) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (meta.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.lock().unwrap().remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}
