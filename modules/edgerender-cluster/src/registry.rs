//! Heartbeat-based cluster membership in Redis.
//!
//! Each EG owns its key `registry:eg:<eg_id>` and refreshes it every
//! `ttl/3`; health is simply key presence. RS instances maintain their own
//! `registry:rs:<rs_id>` entries the same way. Peers discover each other
//! only by reading the independent keys — no adjacency graph is persisted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use redis::aio::ConnectionManager;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use edgerender_common::{EgInfo, RsInfo};

use crate::error::{ClusterError, Result};

const EG_PREFIX: &str = "registry:eg:";
const RS_PREFIX: &str = "registry:rs:";

/// This node's registry identity.
#[derive(Debug, Clone)]
pub struct EgRegistration {
    pub eg_id: String,
    pub address: String,
    pub sharding_enabled: bool,
}

#[derive(Clone)]
pub struct Registry {
    conn: ConnectionManager,
    ttl: Duration,
}

impl Registry {
    pub async fn connect(redis_addr: &str, ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(redis_addr)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn, ttl })
    }

    pub fn new(conn: ConnectionManager, ttl: Duration) -> Self {
        Self { conn, ttl }
    }

    pub fn heartbeat_period(&self) -> Duration {
        self.ttl / 3
    }

    /// Write (or refresh) this EG's registry entry.
    pub async fn register(&self, reg: &EgRegistration) -> Result<()> {
        let info = EgInfo {
            eg_id: reg.eg_id.clone(),
            address: reg.address.clone(),
            last_heartbeat: Utc::now(),
            sharding_enabled: reg.sharding_enabled,
        };
        let json = serde_json::to_string(&info)?;
        redis::cmd("SET")
            .arg(format!("{EG_PREFIX}{}", reg.eg_id))
            .arg(&json)
            .arg("PX")
            .arg(self.ttl.as_millis() as u64)
            .query_async::<_, ()>(&mut self.conn.clone())
            .await?;
        Ok(())
    }

    pub async fn deregister(&self, eg_id: &str) -> Result<()> {
        redis::cmd("DEL")
            .arg(format!("{EG_PREFIX}{eg_id}"))
            .query_async::<_, ()>(&mut self.conn.clone())
            .await?;
        Ok(())
    }

    /// All healthy EGs, sorted by id for deterministic placement. Registry
    /// read failures fail open: a warning and the empty set.
    pub async fn get_healthy_egs(&self) -> Vec<EgInfo> {
        match self.read_all::<EgInfo>(EG_PREFIX).await {
            Ok(mut egs) => {
                egs.sort_by(|a, b| a.eg_id.cmp(&b.eg_id));
                egs
            }
            Err(e) => {
                warn!(error = %e, "Registry read failed, treating cluster as empty");
                Vec::new()
            }
        }
    }

    /// Healthy EG ids, sorted.
    pub async fn get_cluster_members(&self) -> Vec<String> {
        self.get_healthy_egs()
            .await
            .into_iter()
            .map(|eg| eg.eg_id)
            .collect()
    }

    pub async fn get_eg_address(&self, eg_id: &str) -> Result<String> {
        let raw: Option<String> = redis::cmd("GET")
            .arg(format!("{EG_PREFIX}{eg_id}"))
            .query_async(&mut self.conn.clone())
            .await?;
        let raw = raw.ok_or_else(|| ClusterError::UnknownEg(eg_id.to_string()))?;
        let info: EgInfo = serde_json::from_str(&raw)?;
        Ok(info.address)
    }

    /// Healthy render-service instances, for daemon capacity computation.
    pub async fn get_healthy_rs(&self) -> Vec<RsInfo> {
        match self.read_all::<RsInfo>(RS_PREFIX).await {
            Ok(mut instances) => {
                instances.sort_by(|a, b| a.rs_id.cmp(&b.rs_id));
                instances
            }
            Err(e) => {
                warn!(error = %e, "RS registry read failed, assuming no free capacity");
                Vec::new()
            }
        }
    }

    /// Startup guard: an unsharded node must not silently join a cluster
    /// that already has members. Redis being unreachable fails open — the
    /// node starts and logs.
    pub async fn guard_unsharded_start(&self, sharding_enabled: bool) -> Result<()> {
        if sharding_enabled {
            return Ok(());
        }
        match self.read_all::<EgInfo>(EG_PREFIX).await {
            Ok(egs) if !egs.is_empty() => Err(ClusterError::ShardedClusterPresent {
                members: egs.into_iter().map(|e| e.eg_id).collect(),
            }),
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(error = %e, "Registry unreachable during startup guard, continuing");
                Ok(())
            }
        }
    }

    async fn read_all<T: serde::de::DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{prefix}*"))
            .query_async(&mut self.conn.clone())
            .await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut self.conn.clone())
            .await?;

        let mut out = Vec::with_capacity(values.len());
        for value in values.into_iter().flatten() {
            // A key expiring between KEYS and MGET is normal churn; a
            // malformed value is not.
            match serde_json::from_str(&value) {
                Ok(parsed) => out.push(parsed),
                Err(e) => warn!(error = %e, "Skipping malformed registry entry"),
            }
        }
        Ok(out)
    }
}

/// Run the heartbeat loop until `shutdown` flips. Registers immediately,
/// then refreshes every `ttl/3`; deregisters on the way out.
pub fn spawn_heartbeat(
    registry: Arc<Registry>,
    reg: EgRegistration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = registry.heartbeat_period();
        let mut tick = tokio::time::interval(period);
        info!(
            eg_id = reg.eg_id.as_str(),
            period_ms = period.as_millis() as u64,
            "Heartbeat loop starting"
        );

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = registry.register(&reg).await {
                        warn!(eg_id = reg.eg_id.as_str(), error = %e, "Heartbeat failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = registry.deregister(&reg.eg_id).await {
            warn!(eg_id = reg.eg_id.as_str(), error = %e, "Deregister failed");
        } else {
            info!(eg_id = reg.eg_id.as_str(), "Deregistered from cluster");
        }
    })
}
