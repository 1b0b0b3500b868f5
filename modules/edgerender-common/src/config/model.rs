//! Raw YAML configuration model. Every struct rejects unknown fields so
//! that a typo in a config file is fatal at load instead of a silently
//! ignored knob. Nullable fields are `Option<T>`: `None` means "inherit
//! from the parent scope", an explicit value overrides.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{Compression, ExpiredPolicy, Viewport, WaitFor};

use super::duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub auth: AuthConfig,
    /// Present on edge gateway nodes only.
    #[serde(default)]
    pub eg: Option<EgConfig>,
    /// Present on the cache daemon only.
    #[serde(default)]
    pub daemon: Option<DaemonConfig>,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub sharding: ShardingConfig,
    #[serde(default)]
    pub recache: RecacheSettings,
    /// Global defaults, merged under every host and rule scope.
    #[serde(default)]
    pub defaults: ScopeConfig,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_listen_host")]
    pub host: String,
    pub port: u16,
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    /// redis:// connection URL.
    pub addr: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Shared secret for `X-Internal-Auth` between nodes.
    pub internal_key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EgConfig {
    /// Unique id of this gateway within the cluster.
    pub id: String,
    /// Address other nodes reach this gateway at, e.g. `http://eg-a:8080`.
    pub address: String,
    /// Base directory for cache blobs.
    pub base_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RegistryConfig {
    /// Registry key TTL. Heartbeat period is ttl/3.
    #[serde(with = "duration")]
    pub ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStrategy {
    #[default]
    HashModulo,
    Random,
    PrimaryOnly,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ShardingConfig {
    pub enabled: bool,
    pub strategy: ShardStrategy,
    pub replication_factor: usize,
    #[serde(with = "duration")]
    pub inter_eg_timeout: Duration,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: ShardStrategy::HashModulo,
            replication_factor: 1,
            inter_eg_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RecacheSettings {
    #[serde(with = "duration")]
    pub tick_interval: Duration,
    /// How often normal and autorecache queues are polled. High queues are
    /// polled every tick.
    #[serde(with = "duration")]
    pub normal_check_interval: Duration,
    /// Max members popped from one queue per poll.
    pub batch_size: usize,
    /// Capacity of the in-process dispatch channel.
    pub internal_queue_max_size: usize,
    pub max_retries: u32,
    #[serde(with = "duration")]
    pub retry_base_delay: Duration,
    /// Fraction of free RS capacity reserved for interactive traffic.
    pub rs_capacity_reserved: f64,
    /// Per-URL dispatch timeout.
    #[serde(with = "duration")]
    pub dispatch_timeout: Duration,
}

impl Default for RecacheSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            normal_check_interval: Duration::from_secs(6),
            batch_size: 100,
            internal_queue_max_size: 1000,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            rs_capacity_reserved: 0.3,
            dispatch_timeout: Duration::from_secs(60),
        }
    }
}

/// One mergeable configuration scope. The same shape appears at the global
/// `defaults` level, per host, and per URL rule; scopes merge child-over-
/// parent into a `ResolvedConfig`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScopeConfig {
    #[serde(default)]
    pub render: Option<RenderOverrides>,
    #[serde(default)]
    pub cache: Option<CacheOverrides>,
    #[serde(default)]
    pub tracking_params: Option<TrackingParamsConfig>,
    #[serde(default)]
    pub headers: Option<HeadersConfig>,
    #[serde(default)]
    pub bypass: Option<BypassConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenderOverrides {
    #[serde(default, with = "duration::opt")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub wait_for: Option<WaitFor>,
    #[serde(default, with = "duration::opt")]
    pub extra_wait: Option<Duration>,
    #[serde(default)]
    pub viewport: Option<Viewport>,
    #[serde(default)]
    pub blocked_patterns: Option<Vec<String>>,
    #[serde(default)]
    pub blocked_patterns_add: Option<Vec<String>>,
    #[serde(default)]
    pub blocked_resource_types: Option<Vec<String>>,
    #[serde(default)]
    pub blocked_resource_types_add: Option<Vec<String>>,
    #[serde(default)]
    pub strip_scripts: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheOverrides {
    #[serde(default, with = "duration::opt")]
    pub ttl: Option<Duration>,
    /// Status codes whose responses are cacheable.
    #[serde(default)]
    pub status_codes: Option<Vec<u16>>,
    #[serde(default)]
    pub expired_policy: Option<ExpiredPolicy>,
    #[serde(default, with = "duration::opt")]
    pub stale_ttl: Option<Duration>,
    #[serde(default)]
    pub compression: Option<Compression>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackingParamsConfig {
    #[serde(default)]
    pub strip: Option<bool>,
    /// Replaces the inherited list.
    #[serde(default)]
    pub params: Option<Vec<String>>,
    /// Extends the inherited list.
    #[serde(default)]
    pub params_add: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeadersConfig {
    #[serde(default)]
    pub safe_request: Option<Vec<String>>,
    #[serde(default)]
    pub safe_request_add: Option<Vec<String>>,
    #[serde(default)]
    pub safe_response: Option<Vec<String>>,
    #[serde(default)]
    pub safe_response_add: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BypassConfig {
    /// Whether bypass responses are cached.
    #[serde(default)]
    pub cache: Option<bool>,
    #[serde(default, with = "duration::opt")]
    pub ttl: Option<Duration>,
    #[serde(default, with = "duration::opt")]
    pub origin_timeout: Option<Duration>,
}

/// `domain: example.com` or `domain: [a.com, b.com]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DomainSpec {
    One(String),
    Many(Vec<String>),
}

impl DomainSpec {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            DomainSpec::One(d) => vec![d],
            DomainSpec::Many(ds) => ds,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    pub id: i32,
    pub domain: DomainSpec,
    /// Host-level render key clients must present in `X-Render-Key`.
    pub render_key: String,
    pub dimensions: Vec<DimensionConfig>,
    /// Dimension name to fall back to when no `match_ua` matches, or the
    /// sentinel policies `block` / `bypass`.
    #[serde(default)]
    pub unmatched_dimension: Option<String>,
    #[serde(default)]
    pub bothit_recache: Option<BothitRecacheConfig>,
    #[serde(default)]
    pub render: Option<RenderOverrides>,
    #[serde(default)]
    pub cache: Option<CacheOverrides>,
    #[serde(default)]
    pub tracking_params: Option<TrackingParamsConfig>,
    #[serde(default)]
    pub headers: Option<HeadersConfig>,
    #[serde(default)]
    pub bypass: Option<BypassConfig>,
    #[serde(default)]
    pub url_rules: Vec<UrlRuleConfig>,
}

impl HostConfig {
    pub fn scope(&self) -> ScopeConfig {
        ScopeConfig {
            render: self.render.clone(),
            cache: self.cache.clone(),
            tracking_params: self.tracking_params.clone(),
            headers: self.headers.clone(),
            bypass: self.bypass.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DimensionConfig {
    pub id: i32,
    pub name: String,
    /// Regex matched against the request User-Agent.
    #[serde(default)]
    pub match_ua: Option<String>,
    /// User-Agent the renderer browses with.
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub viewport: Option<Viewport>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BothitRecacheConfig {
    pub enabled: bool,
    /// Delay between a bot hit and the scheduled autorecache.
    #[serde(default, with = "duration::opt")]
    pub interval: Option<Duration>,
}

/// `match: "/x/*"` or `match: ["/a", "/b/*"]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MatchSpec {
    One(String),
    Many(Vec<String>),
}

impl MatchSpec {
    pub fn as_slice(&self) -> &[String] {
        match self {
            MatchSpec::One(p) => std::slice::from_ref(p),
            MatchSpec::Many(ps) => ps,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleActionConfig {
    #[default]
    Render,
    Bypass,
    Block,
    #[serde(rename = "status_403")]
    Status403,
    #[serde(rename = "status_404")]
    Status404,
    #[serde(rename = "status_410")]
    Status410,
    Status,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusActionConfig {
    /// Required when `action: status`; implied by the shorthand actions.
    #[serde(default)]
    pub code: Option<u16>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UrlRuleConfig {
    #[serde(rename = "match")]
    pub matches: MatchSpec,
    #[serde(default)]
    pub action: RuleActionConfig,
    #[serde(default)]
    pub status: Option<StatusActionConfig>,
    /// AND across keys, OR across each key's values.
    #[serde(default)]
    pub match_query: Option<HashMap<String, Vec<String>>>,
    #[serde(default)]
    pub render: Option<RenderOverrides>,
    #[serde(default)]
    pub cache: Option<CacheOverrides>,
    #[serde(default)]
    pub tracking_params: Option<TrackingParamsConfig>,
    #[serde(default)]
    pub headers: Option<HeadersConfig>,
    #[serde(default)]
    pub bypass: Option<BypassConfig>,
}

impl UrlRuleConfig {
    pub fn scope(&self) -> ScopeConfig {
        ScopeConfig {
            render: self.render.clone(),
            cache: self.cache.clone(),
            tracking_params: self.tracking_params.clone(),
            headers: self.headers.clone(),
            bypass: self.bypass.clone(),
        }
    }
}
