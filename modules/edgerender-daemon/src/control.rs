//! Daemon control plane: status snapshot, scheduler pause/resume, and the
//! bulk recache-scheduling API.

use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use edgerender_cache::RecacheQueue;
use edgerender_cluster::{Registry, INTERNAL_AUTH_HEADER};
use edgerender_common::util::constant_time_eq;
use edgerender_common::{urlnorm, Config, RecacheMember, RecachePriority};

use crate::capacity;
use crate::scheduler::WorkItem;
use crate::stats::DaemonStats;

/// Maximum URLs per bulk recache request.
pub const MAX_BATCH_URLS: usize = 10_000;

pub struct DaemonState {
    pub config: Arc<Config>,
    pub daemon_id: String,
    pub queues: Arc<dyn RecacheQueue>,
    pub registry: Arc<Registry>,
    pub stats: Arc<DaemonStats>,
    pub paused: watch::Sender<bool>,
    /// Sender clone used only to observe channel occupancy.
    pub channel_probe: mpsc::Sender<WorkItem>,
}

pub struct DaemonAuth;

impl FromRequestParts<Arc<DaemonState>> for DaemonAuth {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<DaemonState>,
    ) -> Result<Self, Self::Rejection> {
        let presented = parts
            .headers
            .get(INTERNAL_AUTH_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        if constant_time_eq(presented, &state.config.auth.internal_key) {
            Ok(DaemonAuth)
        } else {
            Err((
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "success": false, "message": "unauthorized" })),
            )
                .into_response())
        }
    }
}

pub async fn health() -> &'static str {
    "ok"
}

/// Full daemon snapshot: queue depths, internal channel occupancy, RS
/// capacity, identity, and counters.
pub async fn status(State(state): State<Arc<DaemonState>>) -> Response {
    let mut queues = serde_json::Map::new();
    for host in &state.config.hosts {
        let mut depths = serde_json::Map::new();
        for priority in RecachePriority::all() {
            let depth = state.queues.depth(host.id, priority).await.unwrap_or(0);
            depths.insert(priority.as_str().to_string(), serde_json::json!(depth));
        }
        queues.insert(host.id.to_string(), serde_json::Value::Object(depths));
    }

    let max = state.channel_probe.max_capacity();
    let size = max - state.channel_probe.capacity();
    let fleet = state.registry.get_healthy_rs().await;
    let rs_capacity = capacity::snapshot(&fleet, state.config.recache.rs_capacity_reserved);

    Json(serde_json::json!({
        "daemon": {
            "id": state.daemon_id,
            "paused": *state.paused.borrow(),
        },
        "queues": queues,
        "internal_queue": {
            "size": size,
            "max": max,
            "pct": if max > 0 { (size as f64 / max as f64) * 100.0 } else { 0.0 },
        },
        "rs_capacity": rs_capacity,
        "stats": state.stats.snapshot(),
    }))
    .into_response()
}

pub async fn pause(State(state): State<Arc<DaemonState>>, _auth: DaemonAuth) -> Response {
    let _ = state.paused.send(true);
    info!("Scheduler paused");
    Json(serde_json::json!({ "success": true, "data": { "paused": true } })).into_response()
}

pub async fn resume(State(state): State<Arc<DaemonState>>, _auth: DaemonAuth) -> Response {
    let _ = state.paused.send(false);
    info!("Scheduler resumed");
    Json(serde_json::json!({ "success": true, "data": { "paused": false } })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct ScheduleRecacheRequest {
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

/// Schedule URLs into the Redis recache queues. The daemon picks them up
/// on subsequent ticks.
pub async fn schedule_recache(
    State(state): State<Arc<DaemonState>>,
    _auth: DaemonAuth,
    Json(request): Json<ScheduleRecacheRequest>,
) -> Response {
    if request.urls.is_empty() || request.urls.len() > MAX_BATCH_URLS {
        return bad_request("urls must be between 1 and 10000");
    }
    if request.priority == RecachePriority::Autorecache {
        return bad_request("priority must be high or normal");
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

    let now = Utc::now().timestamp() as f64;
    let mut entries_enqueued = 0usize;
    for url in &request.urls {
        let normalized = match urlnorm::normalize_stripped(url, tracking) {
            Ok(n) => n,
            Err(e) => {
                warn!(url = url.as_str(), error = %e, "Skipping invalid URL");
                continue;
            }
        };
        for dimension_id in &dimension_ids {
            if host.dimension_by_id(*dimension_id).is_none() {
                continue;
            }
            let member = RecacheMember::new(normalized.clone(), *dimension_id);
            match state
                .queues
                .add(request.host_id, request.priority, &member, now)
                .await
            {
                Ok(()) => entries_enqueued += 1,
                Err(e) => {
                    warn!(url = url.as_str(), error = %e, "Recache enqueue failed")
                }
            }
        }
    }

    info!(
        host_id = request.host_id,
        entries_enqueued,
        priority = %request.priority,
        "Recache scheduled"
    );
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

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "success": false, "message": message })),
    )
        .into_response()
}
