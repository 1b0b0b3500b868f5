//! Inter-node surface: shard pull/push/status, recache execution, and
//! invalidation. Everything requires `X-Internal-Auth`; failures answer
//! JSON `{ success: false, message }`.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{FromRequestParts, Query, State},
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use edgerender_cluster::{ShardMetadata, ShardStatus, INTERNAL_AUTH_HEADER, SHARD_METADATA_HEADER};
use edgerender_common::{CacheKey, RecachePriority};

use crate::auth::constant_time_eq;
use crate::metrics::Metrics;
use crate::pipeline::stale_window;
use crate::recache::refresh_entry;
use crate::state::AppState;

/// Maximum URLs per recache/invalidate request.
pub const MAX_BATCH_URLS: usize = 10_000;

/// Concurrent refreshes an EG runs for one recache request.
const REFRESH_CONCURRENCY: usize = 8;

/// Extractor enforcing the shared internal auth key.
pub struct InternalAuth;

impl FromRequestParts<Arc<AppState>> for InternalAuth {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let presented = parts
            .headers
            .get(INTERNAL_AUTH_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        if constant_time_eq(presented, &state.config.auth.internal_key) {
            Ok(InternalAuth)
        } else {
            Err(unauthorized())
        }
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "success": false, "message": "unauthorized" })),
    )
        .into_response()
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "success": false, "message": message })),
    )
        .into_response()
}

// --- shard pull / push / status ---

#[derive(Debug, Deserialize)]
pub struct PullQuery {
    pub cache_key: String,
}

pub async fn pull(
    State(state): State<Arc<AppState>>,
    _auth: InternalAuth,
    Query(query): Query<PullQuery>,
) -> Response {
    let Some(key) = CacheKey::parse(&query.cache_key) else {
        return bad_request("malformed cache_key");
    };

    let Some((metadata, stored_bytes)) = state.store.read_stored(&key).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "success": false, "message": "miss" })),
        )
            .into_response();
    };

    // Expired entries are a miss for peers; stale serving is a local
    // policy decision, not a replication one.
    if metadata.is_expired(Utc::now()) {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "success": false, "message": "expired" })),
        )
            .into_response();
    }

    let shard_meta = ShardMetadata {
        cache_key: key.to_string(),
        metadata,
        request_id: Uuid::new_v4().to_string(),
    };
    let header_value = match serde_json::to_string(&shard_meta) {
        Ok(json) => json,
        Err(e) => {
            warn!(key = %key, error = %e, "Shard metadata serialization failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    (
        StatusCode::OK,
        [(SHARD_METADATA_HEADER, header_value)],
        stored_bytes,
    )
        .into_response()
}

pub async fn push(
    State(state): State<Arc<AppState>>,
    _auth: InternalAuth,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(shard_meta) = headers
        .get(SHARD_METADATA_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| serde_json::from_str::<ShardMetadata>(v).ok())
    else {
        return bad_request("missing or malformed shard metadata");
    };
    let Some(key) = CacheKey::parse(&shard_meta.cache_key) else {
        return bad_request("malformed cache_key");
    };

    // Retain a stale window matching this host's effective policy.
    let window = state
        .config
        .host_by_id(key.host_id)
        .map(|host| stale_window(&state.config.resolve(host, None)))
        .unwrap_or_default();

    match state
        .store
        .put_replica(&key, &body, &shard_meta.metadata, window)
        .await
    {
        Ok(()) => {
            info!(key = %key, request_id = shard_meta.request_id.as_str(), "Stored pushed replica");
            Json(serde_json::json!({ "success": true })).into_response()
        }
        Err(e) => {
            warn!(key = %key, error = %e, "Replica store failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "success": false, "message": e.to_string() })),
            )
                .into_response()
        }
    }
}

pub async fn status(State(state): State<Arc<AppState>>, _auth: InternalAuth) -> Response {
    let status = ShardStatus {
        eg_id: state.eg.id.clone(),
        sharding_enabled: state.config.sharding.enabled,
        timestamp: Utc::now(),
    };
    let mut body = serde_json::to_value(&status).unwrap_or_default();
    if let Some(map) = body.as_object_mut() {
        map.insert("metrics".to_string(), state.metrics.snapshot());
        map.insert(
            "uptime_secs".to_string(),
            serde_json::json!(state.started_at.elapsed().as_secs()),
        );
    }
    Json(body).into_response()
}

// --- recache execution (daemon → EG) ---

#[derive(Debug, Deserialize)]
pub struct RecacheRequest {
    pub host_id: i32,
    pub urls: Vec<String>,
    #[serde(default)]
    pub dimension_ids: Vec<i32>,
    #[serde(default = "default_priority")]
    pub priority: RecachePriority,
}

fn default_priority() -> RecachePriority {
    RecachePriority::Normal
}

pub async fn recache(
    State(state): State<Arc<AppState>>,
    _auth: InternalAuth,
    Json(request): Json<RecacheRequest>,
) -> Response {
    if request.urls.is_empty() {
        return bad_request("urls must not be empty");
    }
    if request.urls.len() > MAX_BATCH_URLS {
        return bad_request("too many urls");
    }
    let Some(host) = state.config.host_by_id(request.host_id) else {
        return bad_request("unknown host_id");
    };

    let dimension_ids: Vec<i32> = if request.dimension_ids.is_empty() {
        host.dimensions.iter().map(|d| d.id).collect()
    } else {
        request.dimension_ids.clone()
    };

    // Fan the refreshes out with bounded concurrency and answer once all
    // are spawned; the work itself runs in the background.
    let semaphore = Arc::new(Semaphore::new(REFRESH_CONCURRENCY));
    let mut entries_enqueued = 0usize;
    for url in &request.urls {
        for dimension_id in &dimension_ids {
            if host.dimension_by_id(*dimension_id).is_none() {
                continue;
            }
            entries_enqueued += 1;
            let state = Arc::clone(&state);
            let semaphore = Arc::clone(&semaphore);
            let url = url.clone();
            let host_id = request.host_id;
            let dimension_id = *dimension_id;
            tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                if let Err(e) = refresh_entry(&state, host_id, dimension_id, &url).await {
                    warn!(host_id, dimension_id, url = url.as_str(), error = %e, "Recache refresh failed");
                }
            });
        }
    }

    Json(serde_json::json!({
        "success": true,
        "data": {
            "host_id": request.host_id,
            "urls_count": request.urls.len(),
            "dimension_ids_count": dimension_ids.len(),
            "entries_enqueued": entries_enqueued,
            "priority": request.priority.as_str(),
        }
    }))
    .into_response()
}

// --- invalidation ---

#[derive(Debug, Deserialize)]
pub struct InvalidateRequest {
    pub host_id: i32,
    pub urls: Vec<String>,
    #[serde(default)]
    pub dimension_ids: Vec<i32>,
}

/// Delete cache metadata for the given URLs. Never touches recache queues.
pub async fn invalidate(
    State(state): State<Arc<AppState>>,
    _auth: InternalAuth,
    Json(request): Json<InvalidateRequest>,
) -> Response {
    if request.urls.len() > MAX_BATCH_URLS {
        return bad_request("too many urls");
    }
    let Some(host) = state.config.host_by_id(request.host_id) else {
        return bad_request("unknown host_id");
    };

    let resolved = state.config.resolve(host, None);
    let tracking: &[String] = if resolved.strip_tracking {
        &resolved.tracking_params
    } else {
        &[]
    };

    let dimension_ids: Vec<i32> = if request.dimension_ids.is_empty() {
        host.dimensions.iter().map(|d| d.id).collect()
    } else {
        request.dimension_ids.clone()
    };

    let mut entries_invalidated = 0usize;
    for url in &request.urls {
        let hash = match edgerender_common::urlnorm::hash_url(url, tracking) {
            Ok(hash) => hash,
            Err(e) => {
                warn!(url = url.as_str(), error = %e, "Skipping invalid URL in invalidate");
                continue;
            }
        };
        for dimension_id in &dimension_ids {
            let key = CacheKey::new(request.host_id, *dimension_id, hash.clone());
            if state.store.delete(&key).await {
                entries_invalidated += 1;
                Metrics::incr(&state.metrics.invalidations);
            }
        }
    }

    info!(
        host_id = request.host_id,
        entries_invalidated, "Invalidation complete"
    );
    Json(serde_json::json!({
        "success": true,
        "data": { "entries_invalidated": entries_invalidated }
    }))
    .into_response()
}

// --- header helpers for tests ---

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recache_request_defaults() {
        let parsed: RecacheRequest = serde_json::from_str(
            r#"{"host_id": 1, "urls": ["https://example.com/a"]}"#,
        )
        .unwrap();
        assert_eq!(parsed.priority, RecachePriority::Normal);
        assert!(parsed.dimension_ids.is_empty());

        let parsed: RecacheRequest = serde_json::from_str(
            r#"{"host_id": 1, "urls": ["https://example.com/a"], "priority": "high", "dimension_ids": [1, 2]}"#,
        )
        .unwrap();
        assert_eq!(parsed.priority, RecachePriority::High);
        assert_eq!(parsed.dimension_ids, vec![1, 2]);
    }

    #[test]
    fn invalidate_request_shape() {
        let parsed: InvalidateRequest = serde_json::from_str(
            r#"{"host_id": 2, "urls": ["https://example.com/x"], "dimension_ids": []}"#,
        )
        .unwrap();
        assert_eq!(parsed.host_id, 2);
        assert!(parsed.dimension_ids.is_empty());
    }
}
