//! Bypass: fetch the origin directly, no browser. Triggered by a URL rule
//! or by the host's unmatched-dimension policy. Responses are cached only
//! when the bypass config says so and a dimension is available to key on.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use edgerender_cache::Lookup;
use edgerender_common::{
    urlnorm, CacheKey, CacheMetadata, CacheSource, Dimension, Host, ResolvedConfig,
};

use crate::auth::filter_headers;
use crate::error::PipelineError;
use crate::metrics::Metrics;
use crate::pipeline::{stale_window, RenderParams, Served};
use crate::state::AppState;

pub async fn fetch(
    state: &Arc<AppState>,
    host: &Host,
    dimension: Option<&Dimension>,
    params: &RenderParams,
    resolved: &ResolvedConfig,
) -> Result<Served, PipelineError> {
    let key = match dimension {
        Some(dim) if resolved.bypass_cache => {
            let tracking: &[String] = if resolved.strip_tracking {
                &resolved.tracking_params
            } else {
                &[]
            };
            let normalized = urlnorm::normalize_stripped(&params.target_url, tracking)
                .map_err(|e| PipelineError::InvalidUrl(e.to_string()))?;
            Some((
                CacheKey::new(host.id, dim.id, urlnorm::fingerprint(&normalized)),
                normalized,
            ))
        }
        _ => None,
    };

    // Cached bypass copy?
    if let Some((key, _)) = &key {
        if let Ok(Lookup::Hit { metadata, body, stale }) = state
            .store
            .get(key, resolved.expired_policy, resolved.stale_ttl)
            .await
        {
            Metrics::incr(&state.metrics.cache_hits);
            let now = Utc::now();
            return Ok(Served {
                status: metadata.status_code,
                body,
                headers: metadata
                    .headers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                source: Some("bypass_cache"),
                cache_hit: true,
                age_seconds: Some(metadata.age_seconds(now)),
                stale,
            });
        }
    }

    Metrics::incr(&state.metrics.bypasses);
    let response = state
        .origin
        .get(&params.target_url)
        .headers(to_header_map(&filter_headers(
            &params.client_headers,
            &resolved.safe_request_headers,
        )))
        .timeout(resolved.origin_timeout)
        .send()
        .await
        .map_err(|e| PipelineError::OriginFetch(e.to_string()))?;

    let status = response.status().as_u16();
    let mut response_headers = std::collections::HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            response_headers.insert(name.as_str().to_string(), value.to_string());
        }
    }
    let response_headers = filter_headers(&response_headers, &resolved.safe_response_headers);

    let body = response
        .bytes()
        .await
        .map_err(|e| PipelineError::OriginFetch(e.to_string()))?
        .to_vec();

    if let Some((key, normalized)) = &key {
        if resolved.is_cacheable_status(status) {
            let now = Utc::now();
            let metadata = CacheMetadata {
                url: normalized.clone(),
                created_at: now,
                expires_at: now
                    + chrono::Duration::from_std(resolved.bypass_ttl).unwrap_or_default(),
                status_code: status,
                source: CacheSource::Bypass,
                headers: response_headers.clone(),
                file_path: String::new(),
                compression: Default::default(),
                last_bot_hit: None,
                stored_on: vec![state.eg.id.clone()],
            };
            if let Err(e) = state
                .store
                .put(key, &body, metadata, resolved.compression, stale_window(resolved))
                .await
            {
                warn!(key = %key, error = %e, "Bypass cache store failed");
            }
        } else {
            debug!(key = %key, status, "Bypass status not cacheable");
        }
    }

    Ok(Served {
        status,
        body,
        headers: response_headers.into_iter().collect(),
        source: Some("bypass"),
        cache_hit: false,
        age_seconds: None,
        stale: false,
    })
}

fn to_header_map(headers: &std::collections::HashMap<String, String>) -> reqwest::header::HeaderMap {
    let mut map = reqwest::header::HeaderMap::new();
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_bytes()),
            reqwest::header::HeaderValue::from_str(value),
        ) {
            map.insert(name, value);
        }
    }
    map
}
