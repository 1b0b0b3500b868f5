//! Inter-EG cache transfer: pull, push, and status over authenticated HTTP.
//!
//! Bodies travel in their stored (possibly compressed) form; metadata rides
//! in the `X-Shard-Metadata` header as JSON. A pull answering anything but
//! 200 is a miss at this layer — the caller cascades to the next peer and
//! finally to a local render.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use edgerender_common::{CacheKey, CacheMetadata};

use crate::error::{ClusterError, Result};

pub const SHARD_METADATA_HEADER: &str = "X-Shard-Metadata";
pub const INTERNAL_AUTH_HEADER: &str = "X-Internal-Auth";

/// Metadata envelope accompanying pull responses and push requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardMetadata {
    pub cache_key: String,
    pub metadata: CacheMetadata,
    pub request_id: String,
}

/// A replica transfer to peers.
#[derive(Debug, Clone)]
pub struct PushRequest {
    pub key: CacheKey,
    pub metadata: CacheMetadata,
    /// Blob bytes exactly as stored (compression per `metadata.file_path`).
    pub stored_bytes: Vec<u8>,
    pub request_id: String,
}

/// A successful pull from a peer.
#[derive(Debug)]
pub struct PulledEntry {
    pub metadata: CacheMetadata,
    pub stored_bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardStatus {
    pub eg_id: String,
    pub sharding_enabled: bool,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate result of a parallel push.
#[derive(Debug, PartialEq, Eq)]
pub enum ReplicationOutcome {
    /// Every remote accepted the copy.
    FullyReplicated,
    /// Some remotes failed; the local copy stands, replication is short.
    UnderReplicated { failed: Vec<String> },
    /// Every remote failed.
    FailedRemote,
}

#[derive(Clone)]
pub struct ShardClient {
    client: reqwest::Client,
    auth_key: String,
    timeout: Duration,
}

impl ShardClient {
    pub fn new(auth_key: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            // Inter-EG connections are bursty; keep idle sockets short.
            .pool_idle_timeout(Duration::from_millis(500))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            client,
            auth_key: auth_key.into(),
            timeout,
        }
    }

    /// Pull an entry from a peer. 200 is a hit; anything else is a miss.
    pub async fn pull(&self, eg_id: &str, eg_addr: &str, key: &CacheKey) -> Result<PulledEntry> {
        let endpoint = format!(
            "{}/internal/cache/pull?cache_key={}",
            eg_addr.trim_end_matches('/'),
            key
        );

        let resp = self
            .client
            .get(&endpoint)
            .header(INTERNAL_AUTH_HEADER, &self.auth_key)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            return Err(ClusterError::PullMiss {
                eg_id: eg_id.to_string(),
                status: status.as_u16(),
            });
        }

        let shard_meta: ShardMetadata = resp
            .headers()
            .get(SHARD_METADATA_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| serde_json::from_str(v).ok())
            .ok_or_else(|| ClusterError::BadShardMetadata {
                header: SHARD_METADATA_HEADER.to_string(),
            })?;

        let stored_bytes = resp.bytes().await?.to_vec();
        debug!(eg_id, key = %key, bytes = stored_bytes.len(), "Pulled entry from peer");

        Ok(PulledEntry {
            metadata: shard_meta.metadata,
            stored_bytes,
        })
    }

    /// Push a replica to one peer.
    pub async fn push(&self, eg_id: &str, eg_addr: &str, req: &PushRequest) -> Result<()> {
        let endpoint = format!("{}/internal/cache/push", eg_addr.trim_end_matches('/'));
        let shard_meta = ShardMetadata {
            cache_key: req.key.to_string(),
            metadata: req.metadata.clone(),
            request_id: req.request_id.clone(),
        };

        let resp = self
            .client
            .post(&endpoint)
            .header(INTERNAL_AUTH_HEADER, &self.auth_key)
            .header(SHARD_METADATA_HEADER, serde_json::to_string(&shard_meta)?)
            .timeout(self.timeout)
            .body(req.stored_bytes.clone())
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ClusterError::PushRejected {
                eg_id: eg_id.to_string(),
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }

    pub async fn status(&self, eg_addr: &str) -> Result<ShardStatus> {
        let endpoint = format!("{}/internal/cache/status", eg_addr.trim_end_matches('/'));
        let resp = self
            .client
            .get(&endpoint)
            .header(INTERNAL_AUTH_HEADER, &self.auth_key)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ClusterError::Network(format!(
                "status probe returned {status}: {message}"
            )));
        }
        Ok(resp.json().await?)
    }

    /// Fire-and-collect push to every target. Each target is independent;
    /// one failure never aborts the others.
    pub async fn push_parallel(
        &self,
        targets: &[(String, String)],
        req: &PushRequest,
    ) -> ReplicationOutcome {
        if targets.is_empty() {
            return ReplicationOutcome::FullyReplicated;
        }

        let pushes = targets.iter().map(|(eg_id, eg_addr)| async move {
            let result = self.push(eg_id, eg_addr, req).await;
            (eg_id.clone(), result)
        });

        let results: HashMap<String, Result<()>> = join_all(pushes).await.into_iter().collect();

        let failed: Vec<String> = results
            .iter()
            .filter_map(|(eg_id, r)| {
                if let Err(e) = r {
                    warn!(eg_id = eg_id.as_str(), key = %req.key, error = %e, "Replica push failed");
                    Some(eg_id.clone())
                } else {
                    None
                }
            })
            .collect();

        if failed.is_empty() {
            ReplicationOutcome::FullyReplicated
        } else if failed.len() == targets.len() {
            ReplicationOutcome::FailedRemote
        } else {
            let mut failed = failed;
            failed.sort();
            ReplicationOutcome::UnderReplicated { failed }
        }
    }
}
