//! Public render endpoint: `GET /render?url=<abs-url>` with `X-Render-Key`
//! auth and User-Agent dimension matching. Errors are plain text; every
//! response carries `X-Request-ID`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::pipeline::{handle_render, RenderParams, Served};
use crate::state::AppState;

pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

#[derive(Debug, Deserialize)]
pub struct RenderQuery {
    pub url: String,
    /// Optional explicit host; the target URL's domain otherwise.
    pub host: Option<String>,
}

pub async fn render_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RenderQuery>,
    headers: HeaderMap,
) -> Response {
    let request_id = Uuid::new_v4().to_string();

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let render_key = headers
        .get("X-Render-Key")
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let mut client_headers = HashMap::new();
    for (name, value) in &headers {
        if let Ok(value) = value.to_str() {
            client_headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
        }
    }

    let params = RenderParams {
        target_url: query.url,
        host_override: query.host,
        render_key,
        user_agent,
        client_headers,
        request_id: request_id.clone(),
    };

    match handle_render(&state, params).await {
        Ok(served) => serve_response(&request_id, served),
        Err(e) => {
            debug!(request_id = request_id.as_str(), error = %e, "Render request failed");
            error_response(&request_id, &e)
        }
    }
}

fn serve_response(request_id: &str, served: Served) -> Response {
    let mut response = Response::builder().status(served.status);

    let has_content_type = served
        .headers
        .iter()
        .any(|(name, _)| name.eq_ignore_ascii_case("content-type"));
    if !has_content_type {
        response = response.header(header::CONTENT_TYPE, "text/html; charset=utf-8");
    }

    for (name, value) in &served.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            response = response.header(name, value);
        }
    }

    if let Some(source) = served.source {
        response = response.header("X-Render-Source", source);
        response = response.header(
            "X-Render-Cache",
            if served.cache_hit { "hit" } else { "miss" },
        );
    }
    if let Some(age) = served.age_seconds {
        response = response.header("X-Cache-Age", age.to_string());
    }
    if served.stale {
        response = response.header("stale", "true");
    }
    response = response.header(REQUEST_ID_HEADER, request_id);

    response
        .body(axum::body::Body::from(served.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn error_response(request_id: &str, error: &PipelineError) -> Response {
    let status = StatusCode::from_u16(error.status()).unwrap_or(StatusCode::BAD_GATEWAY);
    (
        status,
        [
            (HeaderName::from_static("x-request-id"), request_id.to_string()),
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
        ],
        error.to_string(),
    )
        .into_response()
}

pub async fn health() -> &'static str {
    "ok"
}
