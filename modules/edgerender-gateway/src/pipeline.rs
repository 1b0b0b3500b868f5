//! The render request pipeline: host/auth → dimension → URL rules →
//! resolved config → cache lookup → shard pull-through → single-flight
//! render. Every step short-circuits; the whole request runs under an
//! absolute deadline of `resolved.timeout`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use edgerender_cache::blob::decompress;
use edgerender_cache::{Lookup, RecacheQueue};
use edgerender_cluster::{PushRequest, ReplicationOutcome};
use edgerender_common::{
    urlnorm, CacheKey, CacheMetadata, CacheSource, Dimension, DimensionDecision, ExpiredPolicy,
    Host, RecacheMember, RecachePriority, ResolvedConfig, RuleAction,
};
use renderer_client::RenderRequest;

use crate::auth::{constant_time_eq, filter_headers};
use crate::bypass;
use crate::error::{PipelineError, SharedError};
use crate::metrics::Metrics;
use crate::singleflight::{self, Flight, FlightWait};
use crate::state::AppState;

/// Inputs extracted from the public render request.
pub struct RenderParams {
    pub target_url: String,
    /// Explicit `host` parameter; the target URL's domain otherwise.
    pub host_override: Option<String>,
    pub render_key: Option<String>,
    pub user_agent: String,
    /// Client headers with lowercased names.
    pub client_headers: HashMap<String, String>,
    pub request_id: String,
}

/// A response ready to leave the gateway.
#[derive(Debug, Clone)]
pub struct Served {
    pub status: u16,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
    /// `X-Render-Source` value; None for rule-generated responses.
    pub source: Option<&'static str>,
    pub cache_hit: bool,
    pub age_seconds: Option<i64>,
    pub stale: bool,
}

pub async fn handle_render(
    state: &Arc<AppState>,
    params: RenderParams,
) -> Result<Served, PipelineError> {
    let started = tokio::time::Instant::now();

    let parsed = url::Url::parse(params.target_url.trim())
        .map_err(|_| PipelineError::InvalidUrl(params.target_url.clone()))?;
    let url_domain = parsed
        .host_str()
        .ok_or_else(|| PipelineError::InvalidUrl(params.target_url.clone()))?
        .to_string();
    let domain = params.host_override.as_deref().unwrap_or(&url_domain);

    let host = state
        .config
        .host_for_domain(domain)
        .ok_or_else(|| PipelineError::UnknownHost(domain.to_string()))?;

    match params.render_key.as_deref() {
        Some(key) if constant_time_eq(key, &host.render_key) => {}
        _ => return Err(PipelineError::Unauthorized),
    }

    let query_pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    // Dimension before rules: a blocked user agent never reaches rule
    // evaluation or the renderer.
    let dimension = match host.match_dimension(&params.user_agent) {
        DimensionDecision::Dimension(d) => d,
        DimensionDecision::Block => return Err(PipelineError::DimensionBlocked),
        DimensionDecision::Bypass => {
            let resolved = state.config.resolve(host, None);
            return bypass::fetch(state, host, None, &params, &resolved).await;
        }
    };

    let rule = host.match_rule(parsed.path(), &query_pairs);
    if let Some(rule) = rule {
        match &rule.action {
            RuleAction::Status(status) => {
                debug!(host_id = host.id, path = parsed.path(), code = status.code, "URL rule status response");
                return Ok(Served {
                    status: status.code,
                    body: status.body.clone().into_bytes(),
                    headers: status.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                    source: None,
                    cache_hit: false,
                    age_seconds: None,
                    stale: false,
                });
            }
            RuleAction::Block => return Err(PipelineError::Blocked),
            RuleAction::Bypass => {
                let resolved = state.config.resolve(host, Some(rule));
                return bypass::fetch(state, host, Some(dimension), &params, &resolved).await;
            }
            RuleAction::Render => {}
        }
    }

    let resolved = state.config.resolve(host, rule);
    let deadline = started + resolved.timeout;

    let tracking: &[String] = if resolved.strip_tracking {
        &resolved.tracking_params
    } else {
        &[]
    };
    let normalized = urlnorm::normalize_stripped(&params.target_url, tracking)
        .map_err(|e| PipelineError::InvalidUrl(e.to_string()))?;
    let key = CacheKey::new(host.id, dimension.id, urlnorm::fingerprint(&normalized));

    // Local cache.
    match state
        .store
        .get(&key, resolved.expired_policy, resolved.stale_ttl)
        .await
    {
        Ok(Lookup::Hit {
            metadata,
            body,
            stale,
        }) => {
            let now = Utc::now();
            if stale {
                Metrics::incr(&state.metrics.cache_stale_hits);
                // Refresh out of band; the crawler gets the stale copy now.
                enqueue_recache(
                    state,
                    host.id,
                    &normalized,
                    dimension.id,
                    RecachePriority::High,
                    now.timestamp() as f64,
                )
                .await;
            } else {
                Metrics::incr(&state.metrics.cache_hits);
                if resolved.bothit_enabled {
                    state
                        .store
                        .touch_bot_hit(&key, now, stale_window(&resolved))
                        .await;
                    let due = (now
                        + chrono::Duration::from_std(resolved.bothit_interval)
                            .unwrap_or_default())
                    .timestamp() as f64;
                    let member = RecacheMember::new(normalized.clone(), dimension.id);
                    if let Err(e) = state.queues.add_keep_earlier(host.id, &member, due).await {
                        warn!(key = %key, error = %e, "Bot-hit recache enqueue failed");
                    } else {
                        Metrics::incr(&state.metrics.recaches_enqueued);
                    }
                }
            }

            let source = match metadata.source {
                CacheSource::Render => "cache",
                CacheSource::Bypass => "bypass_cache",
            };
            return Ok(Served {
                status: metadata.status_code,
                body,
                headers: metadata.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                source: Some(source),
                cache_hit: true,
                age_seconds: Some(metadata.age_seconds(now)),
                stale,
            });
        }
        Ok(Lookup::Miss) => {
            Metrics::incr(&state.metrics.cache_misses);
        }
        Err(e) => {
            warn!(key = %key, error = %e, "Cache lookup failed, treating as miss");
            Metrics::incr(&state.metrics.cache_misses);
        }
    }

    // Pull-through from the key's natural replicas.
    if state.config.sharding.enabled {
        if let Some(served) = try_pull(state, &key, &resolved).await {
            return Ok(served);
        }
    }

    // At-most-one concurrent render per key on this EG.
    match state.flights.join(&key) {
        Flight::Leader(leader) => {
            let result =
                render_and_store(state, host, dimension, &key, &normalized, &params, &resolved, deadline)
                    .await;
            match result {
                Ok(served) => {
                    let shared = Arc::new(served);
                    leader.complete(Ok(Arc::clone(&shared)));
                    Ok((*shared).clone())
                }
                Err(e) => {
                    leader.complete(Err(SharedError::from(&e)));
                    Err(e)
                }
            }
        }
        Flight::Waiter(rx) => {
            let budget = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or(Duration::ZERO);
            match singleflight::wait(rx, budget).await {
                FlightWait::Done(Ok(shared)) => Ok((*shared).clone()),
                FlightWait::Done(Err(shared_err)) => Err(PipelineError::Coalesced {
                    status: shared_err.status,
                    message: shared_err.message,
                }),
                FlightWait::LeaderFailed => Err(PipelineError::RenderFailed {
                    error_type: None,
                    message: "coalesced render abandoned".to_string(),
                }),
                FlightWait::TimedOut => Err(PipelineError::DeadlineExceeded),
            }
        }
    }
}

/// Try the key's natural replicas in hash-rotated order (primary first).
/// Every pull failure cascades to the next peer; exhaustion falls through
/// to a local render.
async fn try_pull(
    state: &Arc<AppState>,
    key: &CacheKey,
    resolved: &ResolvedConfig,
) -> Option<Served> {
    let peers = state.registry.get_cluster_members().await;
    if peers.is_empty() {
        return None;
    }

    let key_str = key.to_string();
    let natural = state.distributor.compute_hash_targets(
        &key_str,
        state.distributor.replication_factor(),
        &peers,
    );
    match natural.first() {
        // Nothing natural (random/primary_only) or we are the primary:
        // render locally.
        None => return None,
        Some(primary) if *primary == state.eg.id => return None,
        Some(_) => {}
    }
    let may_store_locally = natural.iter().any(|id| *id == state.eg.id);

    for peer in natural.iter().filter(|id| **id != state.eg.id) {
        let addr = match state.registry.get_eg_address(peer).await {
            Ok(addr) => addr,
            Err(e) => {
                debug!(peer = peer.as_str(), error = %e, "No address for pull target");
                continue;
            }
        };
        match state.shard.pull(peer, &addr, key).await {
            Ok(entry) => {
                Metrics::incr(&state.metrics.pulls);
                let body = match decompress(&entry.stored_bytes, entry.metadata.compression) {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(peer = peer.as_str(), key = %key, error = %e, "Pulled blob failed to decompress");
                        Metrics::incr(&state.metrics.pull_failures);
                        continue;
                    }
                };

                if may_store_locally {
                    if let Err(e) = state
                        .store
                        .put_replica(key, &entry.stored_bytes, &entry.metadata, stale_window(resolved))
                        .await
                    {
                        warn!(key = %key, error = %e, "Failed to store pulled replica");
                    }
                }

                let now = Utc::now();
                return Some(Served {
                    status: entry.metadata.status_code,
                    body,
                    headers: entry
                        .metadata
                        .headers
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                    source: Some("cache"),
                    cache_hit: true,
                    age_seconds: Some(entry.metadata.age_seconds(now)),
                    stale: false,
                });
            }
            Err(e) => {
                Metrics::incr(&state.metrics.pull_failures);
                debug!(peer = peer.as_str(), key = %key, error = %e, "Pull missed, cascading");
            }
        }
    }
    None
}

/// Leader path: invoke the RS, store, replicate, serve.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn render_and_store(
    state: &Arc<AppState>,
    host: &Host,
    dimension: &Dimension,
    key: &CacheKey,
    normalized: &str,
    params: &RenderParams,
    resolved: &ResolvedConfig,
    deadline: tokio::time::Instant,
) -> Result<Served, PipelineError> {
    let rs = state
        .registry
        .get_healthy_rs()
        .await
        .into_iter()
        .max_by_key(|r| r.free())
        .ok_or(PipelineError::RsUnavailable)?;

    let budget = deadline
        .checked_duration_since(tokio::time::Instant::now())
        .ok_or(PipelineError::DeadlineExceeded)?;

    let request = RenderRequest {
        request_id: params.request_id.clone(),
        url: normalized.to_string(),
        tab_id: None,
        viewport: dimension.viewport,
        user_agent: dimension.user_agent.clone(),
        timeout_ms: budget.as_millis() as u64,
        wait_for: resolved.wait_for,
        extra_wait_ms: resolved.extra_wait.as_millis() as u64,
        blocked_patterns: resolved.blocked_patterns.clone(),
        blocked_resource_types: resolved.blocked_resource_types.clone(),
        include_har: false,
        headers: filter_headers(&params.client_headers, &resolved.safe_request_headers),
        strip_scripts: resolved.strip_scripts,
    };

    Metrics::incr(&state.metrics.renders);
    let response = tokio::time::timeout_at(deadline, state.renderer.render(&rs.address, &request, budget))
        .await
        .map_err(|_| PipelineError::DeadlineExceeded)?
        .map_err(|e| {
            Metrics::incr(&state.metrics.render_failures);
            PipelineError::RenderFailed {
                error_type: None,
                message: e.to_string(),
            }
        })?;

    if !response.has_storable_html() {
        Metrics::incr(&state.metrics.render_failures);
        return Err(PipelineError::RenderFailed {
            error_type: response.error_type,
            message: response
                .error
                .unwrap_or_else(|| "render produced no output".to_string()),
        });
    }

    let har = crate::har::har_bytes(normalized, &request, &response);
    let status = response.status_code.unwrap_or(200);
    let render_time_ms = response.render_time_ms;
    let response_headers = filter_headers(&response.headers, &resolved.safe_response_headers);
    let body = response.html.into_bytes();

    if resolved.is_cacheable_status(status) {
        store_and_replicate(
            state,
            host,
            key,
            normalized,
            params,
            resolved,
            status,
            &body,
            &response_headers,
        )
        .await;
    } else {
        debug!(key = %key, status, "Status not cacheable, serving without store");
    }

    if let Some(bytes) = har {
        state.har_store.put(host.id, &params.request_id, bytes);
    }

    info!(key = %key, status, render_time_ms, "Rendered");

    Ok(Served {
        status,
        body,
        headers: response_headers.into_iter().collect(),
        source: Some("rendered"),
        cache_hit: false,
        age_seconds: None,
        stale: false,
    })
}

/// Local PUT then parallel PUSH to the remaining targets. Failures degrade:
/// a failed local store serves uncached, failed pushes leave the entry
/// under-replicated.
#[allow(clippy::too_many_arguments)]
async fn store_and_replicate(
    state: &Arc<AppState>,
    host: &Host,
    key: &CacheKey,
    normalized: &str,
    params: &RenderParams,
    resolved: &ResolvedConfig,
    status: u16,
    body: &[u8],
    response_headers: &HashMap<String, String>,
) {
    let peers = state.registry.get_cluster_members().await;
    let targets = if state.config.sharding.enabled {
        let key_str = key.to_string();
        // Substituted set keeps the writer local; the natural set keeps
        // the key findable at its hash position. Push to the union so a
        // non-natural writer still seeds the primary.
        let mut targets = state
            .distributor
            .compute_targets(&key_str, &state.eg.id, &peers);
        for natural in state.distributor.compute_hash_targets(
            &key_str,
            state.distributor.replication_factor(),
            &peers,
        ) {
            if !targets.contains(&natural) {
                targets.push(natural);
            }
        }
        targets
    } else {
        vec![state.eg.id.clone()]
    };

    let now = Utc::now();
    let metadata = CacheMetadata {
        url: normalized.to_string(),
        created_at: now,
        expires_at: now + chrono::Duration::from_std(resolved.ttl).unwrap_or_default(),
        status_code: status,
        source: CacheSource::Render,
        headers: response_headers.clone(),
        file_path: String::new(),
        compression: Default::default(),
        last_bot_hit: None,
        stored_on: targets.clone(),
    };

    let stored = match state
        .store
        .put(key, body, metadata, resolved.compression, stale_window(resolved))
        .await
    {
        Ok(stored) => stored,
        Err(e) => {
            warn!(key = %key, error = %e, "Cache store failed, serving uncached");
            return;
        }
    };

    let mut remote = Vec::new();
    for target in targets.iter().filter(|t| **t != state.eg.id) {
        match state.registry.get_eg_address(target).await {
            Ok(addr) => remote.push((target.clone(), addr)),
            Err(e) => {
                warn!(target = target.as_str(), error = %e, "No address for push target")
            }
        }
    }
    if remote.is_empty() {
        return;
    }

    let Some((_, stored_bytes)) = state.store.read_stored(key).await else {
        return;
    };
    let push = PushRequest {
        key: key.clone(),
        metadata: stored,
        stored_bytes,
        request_id: params.request_id.clone(),
    };

    match state.shard.push_parallel(&remote, &push).await {
        ReplicationOutcome::FullyReplicated => {
            Metrics::incr(&state.metrics.pushes);
        }
        ReplicationOutcome::UnderReplicated { failed } => {
            Metrics::incr(&state.metrics.pushes);
            Metrics::incr(&state.metrics.under_replicated);
            warn!(key = %key, ?failed, "Replication under-satisfied");
        }
        ReplicationOutcome::FailedRemote => {
            Metrics::incr(&state.metrics.under_replicated);
            warn!(key = %key, "All replica pushes failed");
        }
    }
}

pub(crate) async fn enqueue_recache(
    state: &Arc<AppState>,
    host_id: i32,
    url: &str,
    dimension_id: i32,
    priority: RecachePriority,
    due_unix: f64,
) {
    let member = RecacheMember::new(url, dimension_id);
    match state.queues.add(host_id, priority, &member, due_unix).await {
        Ok(()) => Metrics::incr(&state.metrics.recaches_enqueued),
        Err(e) => warn!(host_id, url, error = %e, "Recache enqueue failed"),
    }
}

/// Stale retention window: only serve-stale policies keep expired entries
/// findable.
pub(crate) fn stale_window(resolved: &ResolvedConfig) -> Duration {
    match resolved.expired_policy {
        ExpiredPolicy::ServeStale => resolved.stale_ttl,
        ExpiredPolicy::Delete => Duration::ZERO,
    }
}
