//! Recache execution on the gateway: a forced re-render of one
//! (url, dimension), dispatched by the cache daemon. Skips the cache
//! lookup, runs through single-flight so an in-progress render of the same
//! key is never duplicated, and stores per the normal write path.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use edgerender_common::{urlnorm, CacheKey, RuleAction};

use crate::error::{PipelineError, SharedError};
use crate::pipeline::{render_and_store, RenderParams};
use crate::singleflight::Flight;
use crate::state::AppState;

pub(crate) async fn refresh_entry(
    state: &Arc<AppState>,
    host_id: i32,
    dimension_id: i32,
    url: &str,
) -> Result<(), PipelineError> {
    let host = state
        .config
        .host_by_id(host_id)
        .ok_or_else(|| PipelineError::UnknownHost(host_id.to_string()))?;
    let dimension = host
        .dimension_by_id(dimension_id)
        .ok_or_else(|| PipelineError::Internal(format!("unknown dimension {dimension_id}")))?;

    let parsed =
        url::Url::parse(url).map_err(|_| PipelineError::InvalidUrl(url.to_string()))?;
    let query_pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    // URL rules may have changed since this entry was scheduled; a URL
    // that no longer renders is silently dropped.
    let rule = host.match_rule(parsed.path(), &query_pairs);
    if let Some(rule) = rule {
        if !matches!(rule.action, RuleAction::Render) {
            return Ok(());
        }
    }

    let resolved = state.config.resolve(host, rule);
    let tracking: &[String] = if resolved.strip_tracking {
        &resolved.tracking_params
    } else {
        &[]
    };
    let normalized = urlnorm::normalize_stripped(url, tracking)
        .map_err(|e| PipelineError::InvalidUrl(e.to_string()))?;
    let key = CacheKey::new(host.id, dimension.id, urlnorm::fingerprint(&normalized));

    let params = RenderParams {
        target_url: url.to_string(),
        host_override: None,
        render_key: None,
        user_agent: dimension.user_agent.clone().unwrap_or_default(),
        client_headers: HashMap::new(),
        request_id: Uuid::new_v4().to_string(),
    };
    let deadline = tokio::time::Instant::now() + resolved.timeout;

    match state.flights.join(&key) {
        Flight::Leader(leader) => {
            match render_and_store(
                state, host, dimension, &key, &normalized, &params, &resolved, deadline,
            )
            .await
            {
                Ok(served) => {
                    leader.complete(Ok(Arc::new(served)));
                    Ok(())
                }
                Err(e) => {
                    leader.complete(Err(SharedError::from(&e)));
                    Err(e)
                }
            }
        }
        // A render of this key is already in flight; its result will land
        // in the cache either way.
        Flight::Waiter(_) => Ok(()),
    }
}
