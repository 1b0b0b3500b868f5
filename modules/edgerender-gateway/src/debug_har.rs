//! Debug HAR endpoints: fetch a stored HAR by request id, or run an
//! on-demand render that returns the raw HAR JSON.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use edgerender_common::{urlnorm, RuleAction, UnmatchedPolicy};
use renderer_client::RenderRequest;

use crate::internal::InternalAuth;
use crate::state::AppState;

/// How long the on-demand render waits for an RS instance to come up.
const RS_WAIT: Duration = Duration::from_secs(10);

pub async fn fetch_har(
    State(state): State<Arc<AppState>>,
    _auth: InternalAuth,
    Path((host_id, request_id)): Path<(i32, String)>,
) -> Response {
    match state.har_store.get(host_id, &request_id) {
        Some(har) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            har.as_ref().clone(),
        )
            .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "success": false, "message": "no HAR for request" })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct DebugRenderQuery {
    pub url: String,
    pub dimension: Option<String>,
    /// Render timeout in seconds; the resolved config's otherwise.
    pub timeout: Option<u64>,
}

pub async fn render_har(
    State(state): State<Arc<AppState>>,
    _auth: InternalAuth,
    Query(query): Query<DebugRenderQuery>,
) -> Response {
    let Ok(parsed) = url::Url::parse(query.url.trim()) else {
        return fail(StatusCode::BAD_REQUEST, "invalid_url: cannot parse url");
    };
    let Some(domain) = parsed.host_str() else {
        return fail(StatusCode::BAD_REQUEST, "invalid_url: no host");
    };

    let Some(host) = state.config.host_for_domain(domain) else {
        return fail(StatusCode::NOT_FOUND, "unknown host");
    };

    // Explicit dimension name, unmatched fallback, or error.
    let dimension = match &query.dimension {
        Some(name) => match host.dimension_by_name(name) {
            Some(d) => d,
            None => return fail(StatusCode::BAD_REQUEST, "unknown dimension"),
        },
        None => match &host.unmatched {
            UnmatchedPolicy::Dimension(name) => match host.dimension_by_name(name) {
                Some(d) => d,
                None => return fail(StatusCode::BAD_REQUEST, "no dimension available"),
            },
            UnmatchedPolicy::Block | UnmatchedPolicy::Bypass => {
                return fail(StatusCode::BAD_REQUEST, "no dimension available")
            }
        },
    };

    let query_pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let rule = host.match_rule(parsed.path(), &query_pairs);
    if let Some(rule) = rule {
        match &rule.action {
            RuleAction::Status(status) => {
                return (
                    StatusCode::from_u16(status.code).unwrap_or(StatusCode::OK),
                    status.body.clone(),
                )
                    .into_response()
            }
            RuleAction::Block => return fail(StatusCode::FORBIDDEN, "blocked by url rule"),
            RuleAction::Bypass => {
                return fail(
                    StatusCode::BAD_REQUEST,
                    "bypass rules are not supported for debug renders",
                )
            }
            RuleAction::Render => {}
        }
    }

    let resolved = state.config.resolve(host, rule);
    let timeout = query
        .timeout
        .map(Duration::from_secs)
        .unwrap_or(resolved.timeout);

    let Some(rs) = state
        .registry
        .get_healthy_rs()
        .await
        .into_iter()
        .max_by_key(|r| r.free())
    else {
        return fail(StatusCode::SERVICE_UNAVAILABLE, "no render service instance");
    };
    if let Err(e) = state.renderer.wait_available(&rs.address, RS_WAIT).await {
        warn!(rs = rs.address.as_str(), error = %e, "RS never became available");
        return fail(StatusCode::SERVICE_UNAVAILABLE, "render service unavailable");
    }

    let tracking: &[String] = if resolved.strip_tracking {
        &resolved.tracking_params
    } else {
        &[]
    };
    let normalized = match urlnorm::normalize_stripped(&query.url, tracking) {
        Ok(n) => n,
        Err(e) => return fail(StatusCode::BAD_REQUEST, &format!("invalid_url: {e}")),
    };

    let request_id = Uuid::new_v4().to_string();
    let request = RenderRequest {
        request_id: request_id.clone(),
        url: normalized,
        tab_id: None,
        viewport: dimension.viewport,
        user_agent: dimension.user_agent.clone(),
        timeout_ms: timeout.as_millis() as u64,
        wait_for: resolved.wait_for,
        extra_wait_ms: resolved.extra_wait.as_millis() as u64,
        blocked_patterns: resolved.blocked_patterns.clone(),
        blocked_resource_types: resolved.blocked_resource_types.clone(),
        include_har: true,
        headers: HashMap::new(),
        strip_scripts: resolved.strip_scripts,
    };

    let response = match state.renderer.render(&rs.address, &request, timeout).await {
        Ok(r) => r,
        Err(e) => return fail(StatusCode::BAD_GATEWAY, &format!("render failed: {e}")),
    };

    let Some(bytes) = crate::har::har_bytes(&request.url, &request, &response) else {
        return fail(StatusCode::BAD_GATEWAY, "render returned no HAR");
    };
    state.har_store.put(host.id, &request_id, bytes.clone());

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        bytes,
    )
        .into_response()
}

fn fail(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({ "success": false, "message": message })),
    )
        .into_response()
}
