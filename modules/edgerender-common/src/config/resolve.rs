//! Scope merging: global defaults → host → matched URL rule, flattened
//! into one `ResolvedConfig` per request. Merge rules:
//!
//! - scalars: child `Some` replaces parent
//! - lists: replacement by default; the `*_add` sibling extends instead
//! - nullable bool/int: `None` inherits, explicit value overrides
//!
//! Resolution happens once per request; nothing re-merges per sub-operation.

use std::time::Duration;

use crate::types::{Compression, ExpiredPolicy, Viewport, WaitFor};

use super::model::ScopeConfig;

/// Built-in fallbacks underneath the global `defaults` scope.
pub mod builtin {
    use super::*;

    pub const RENDER_TIMEOUT: Duration = Duration::from_secs(30);
    pub const EXTRA_WAIT: Duration = Duration::ZERO;
    pub const CACHE_TTL: Duration = Duration::from_secs(24 * 3600);
    pub const STALE_TTL: Duration = Duration::from_secs(24 * 3600);
    pub const BYPASS_TTL: Duration = Duration::from_secs(3600);
    pub const ORIGIN_TIMEOUT: Duration = Duration::from_secs(10);
    pub const BOTHIT_INTERVAL: Duration = Duration::from_secs(3600);

    pub const STATUS_CODES: &[u16] = &[200];

    pub fn tracking_params() -> Vec<String> {
        [
            "utm_source",
            "utm_medium",
            "utm_campaign",
            "utm_term",
            "utm_content",
            "gclid",
            "fbclid",
            "msclkid",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    pub fn safe_request_headers() -> Vec<String> {
        ["accept-language", "cookie", "referer"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    pub fn safe_response_headers() -> Vec<String> {
        ["content-type", "cache-control", "location", "link"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }
}

/// Effective configuration for one request. Flat: every field holds a
/// concrete value after the merge.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    // render
    pub timeout: Duration,
    pub wait_for: WaitFor,
    pub extra_wait: Duration,
    pub viewport: Viewport,
    pub blocked_patterns: Vec<String>,
    pub blocked_resource_types: Vec<String>,
    pub strip_scripts: bool,
    // cache
    pub ttl: Duration,
    pub status_codes: Vec<u16>,
    pub expired_policy: ExpiredPolicy,
    pub stale_ttl: Duration,
    pub compression: Compression,
    // tracking params
    pub strip_tracking: bool,
    pub tracking_params: Vec<String>,
    // headers
    pub safe_request_headers: Vec<String>,
    pub safe_response_headers: Vec<String>,
    // bypass
    pub bypass_cache: bool,
    pub bypass_ttl: Duration,
    pub origin_timeout: Duration,
    // bot-hit recache
    pub bothit_enabled: bool,
    pub bothit_interval: Duration,
}

impl ResolvedConfig {
    pub fn is_cacheable_status(&self, status: u16) -> bool {
        self.status_codes.contains(&status)
    }
}

/// Merge an ordered scope chain (outermost first) into a flat config.
/// `bothit` is host-level only and rides alongside the chain.
pub fn resolve(
    chain: &[&ScopeConfig],
    bothit: Option<(bool, Option<Duration>)>,
) -> ResolvedConfig {
    let mut timeout = builtin::RENDER_TIMEOUT;
    let mut wait_for = WaitFor::default();
    let mut extra_wait = builtin::EXTRA_WAIT;
    let mut viewport = Viewport::default();
    let mut blocked_patterns: Vec<String> = Vec::new();
    let mut blocked_resource_types: Vec<String> = Vec::new();
    let mut strip_scripts = true;

    let mut ttl = builtin::CACHE_TTL;
    let mut status_codes: Vec<u16> = builtin::STATUS_CODES.to_vec();
    let mut expired_policy = ExpiredPolicy::default();
    let mut stale_ttl = builtin::STALE_TTL;
    let mut compression = Compression::Snappy;

    let mut strip_tracking = true;
    let mut tracking_params = builtin::tracking_params();

    let mut safe_request_headers = builtin::safe_request_headers();
    let mut safe_response_headers = builtin::safe_response_headers();

    let mut bypass_cache = false;
    let mut bypass_ttl = builtin::BYPASS_TTL;
    let mut origin_timeout = builtin::ORIGIN_TIMEOUT;

    for scope in chain {
        if let Some(render) = &scope.render {
            replace(&mut timeout, &render.timeout);
            replace(&mut wait_for, &render.wait_for);
            replace(&mut extra_wait, &render.extra_wait);
            replace(&mut viewport, &render.viewport);
            merge_list(
                &mut blocked_patterns,
                &render.blocked_patterns,
                &render.blocked_patterns_add,
            );
            merge_list(
                &mut blocked_resource_types,
                &render.blocked_resource_types,
                &render.blocked_resource_types_add,
            );
            replace(&mut strip_scripts, &render.strip_scripts);
        }
        if let Some(cache) = &scope.cache {
            replace(&mut ttl, &cache.ttl);
            replace(&mut status_codes, &cache.status_codes);
            replace(&mut expired_policy, &cache.expired_policy);
            replace(&mut stale_ttl, &cache.stale_ttl);
            replace(&mut compression, &cache.compression);
        }
        if let Some(tracking) = &scope.tracking_params {
            replace(&mut strip_tracking, &tracking.strip);
            merge_list(&mut tracking_params, &tracking.params, &tracking.params_add);
        }
        if let Some(headers) = &scope.headers {
            merge_list(
                &mut safe_request_headers,
                &headers.safe_request,
                &headers.safe_request_add,
            );
            merge_list(
                &mut safe_response_headers,
                &headers.safe_response,
                &headers.safe_response_add,
            );
        }
        if let Some(bypass) = &scope.bypass {
            replace(&mut bypass_cache, &bypass.cache);
            replace(&mut bypass_ttl, &bypass.ttl);
            replace(&mut origin_timeout, &bypass.origin_timeout);
        }
    }

    let (bothit_enabled, bothit_interval) = match bothit {
        Some((enabled, interval)) => (enabled, interval.unwrap_or(builtin::BOTHIT_INTERVAL)),
        None => (false, builtin::BOTHIT_INTERVAL),
    };

    ResolvedConfig {
        timeout,
        wait_for,
        extra_wait,
        viewport,
        blocked_patterns,
        blocked_resource_types,
        strip_scripts,
        ttl,
        status_codes,
        expired_policy,
        stale_ttl,
        compression,
        strip_tracking,
        tracking_params,
        safe_request_headers,
        safe_response_headers,
        bypass_cache,
        bypass_ttl,
        origin_timeout,
        bothit_enabled,
        bothit_interval,
    }
}

fn replace<T: Clone>(slot: &mut T, value: &Option<T>) {
    if let Some(v) = value {
        *slot = v.clone();
    }
}

/// List merge: `replace` swaps the inherited list out, `add` extends it.
/// Scope validation guarantees at most one of the two is set.
fn merge_list<T: Clone>(slot: &mut Vec<T>, replace: &Option<Vec<T>>, add: &Option<Vec<T>>) {
    if let Some(r) = replace {
        *slot = r.clone();
    }
    if let Some(a) = add {
        slot.extend(a.iter().cloned());
    }
}
