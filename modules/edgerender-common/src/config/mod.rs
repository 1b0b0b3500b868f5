//! Configuration loading, validation, and per-request resolution.
//!
//! YAML at rest, strict unknown-field rejection (typos are fatal). Raw
//! config compiles into runtime form at load: domain lookup table, compiled
//! URL patterns and User-Agent regexes. Nothing compiles on the hot path.

pub mod duration;
pub mod model;
pub mod resolve;

use std::collections::HashMap;
use std::time::Duration;

use regex::Regex;

use crate::error::{ConfigError, PatternError};
use crate::pattern::{normalize_domain, QueryFilter, UrlPattern};
use crate::types::Viewport;

pub use model::{
    AuthConfig, DaemonConfig, EgConfig, RawConfig, RecacheSettings, RedisConfig, RegistryConfig,
    ScopeConfig, ServerConfig, ShardStrategy, ShardingConfig,
};
pub use resolve::{builtin, ResolvedConfig};

/// Compiled application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub auth: AuthConfig,
    pub eg: Option<EgConfig>,
    pub daemon: Option<DaemonConfig>,
    pub registry: RegistryConfig,
    pub sharding: ShardingConfig,
    pub recache: RecacheSettings,
    defaults: ScopeConfig,
    pub hosts: Vec<Host>,
    domain_index: HashMap<String, usize>,
}

/// A configured host with compiled rules and dimensions.
#[derive(Debug, Clone)]
pub struct Host {
    pub id: i32,
    pub domains: Vec<String>,
    pub render_key: String,
    pub dimensions: Vec<Dimension>,
    pub unmatched: UnmatchedPolicy,
    pub bothit_enabled: bool,
    pub bothit_interval: Option<Duration>,
    scope: ScopeConfig,
    pub url_rules: Vec<UrlRule>,
}

#[derive(Debug, Clone)]
pub struct Dimension {
    pub id: i32,
    pub name: String,
    match_ua: Option<Regex>,
    pub user_agent: Option<String>,
    pub viewport: Viewport,
}

/// What to do when no dimension's `match_ua` matches the User-Agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnmatchedPolicy {
    /// Fall back to the named dimension.
    Dimension(String),
    Block,
    Bypass,
}

/// Compiled URL rule. First match wins in list order.
#[derive(Debug, Clone)]
pub struct UrlRule {
    patterns: Vec<UrlPattern>,
    query: Option<QueryFilter>,
    pub action: RuleAction,
    pub overrides: ScopeConfig,
}

#[derive(Debug, Clone)]
pub enum RuleAction {
    Render,
    Bypass,
    Block,
    Status(StatusResponse),
}

#[derive(Debug, Clone)]
pub struct StatusResponse {
    pub code: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Outcome of dimension resolution for a request.
#[derive(Debug)]
pub enum DimensionDecision<'a> {
    Dimension(&'a Dimension),
    Block,
    Bypass,
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(yaml)?;
        Self::compile(raw)
    }

    fn compile(raw: RawConfig) -> Result<Self, ConfigError> {
        validate_headers_scope(&raw.defaults, 0, "defaults")?;

        let mut hosts = Vec::with_capacity(raw.hosts.len());
        let mut domain_index: HashMap<String, usize> = HashMap::new();
        let mut seen_ids: Vec<i32> = Vec::new();

        for host_cfg in raw.hosts {
            if seen_ids.contains(&host_cfg.id) {
                return Err(ConfigError::DuplicateHostId(host_cfg.id));
            }
            seen_ids.push(host_cfg.id);

            let host = Host::compile(host_cfg)?;
            validate_headers_scope(&host.scope, host.id, "host")?;
            for rule in &host.url_rules {
                validate_headers_scope(&rule.overrides, host.id, "url_rule")?;
            }

            let index = hosts.len();
            for domain in &host.domains {
                if domain_index.insert(domain.clone(), index).is_some() {
                    return Err(ConfigError::DuplicateDomain {
                        domain: domain.clone(),
                    });
                }
            }
            hosts.push(host);
        }

        Ok(Self {
            server: raw.server,
            redis: raw.redis,
            auth: raw.auth,
            eg: raw.eg,
            daemon: raw.daemon,
            registry: raw.registry,
            sharding: raw.sharding,
            recache: raw.recache,
            defaults: raw.defaults,
            hosts,
            domain_index,
        })
    }

    /// Apply node-scoped environment overrides (`REDIS_ADDR`,
    /// `INTERNAL_AUTH_KEY`, `EG_ID`, `EG_ADDRESS`, `REGISTRY_TTL`,
    /// `INTER_EG_TIMEOUT`).
    pub fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("REDIS_ADDR") {
            self.redis.addr = addr;
        }
        if let Ok(key) = std::env::var("INTERNAL_AUTH_KEY") {
            self.auth.internal_key = key;
        }
        if let Some(eg) = &mut self.eg {
            if let Ok(id) = std::env::var("EG_ID") {
                eg.id = id;
            }
            if let Ok(address) = std::env::var("EG_ADDRESS") {
                eg.address = address;
            }
        }
        if let Ok(raw) = std::env::var("REGISTRY_TTL") {
            match humantime::parse_duration(&raw) {
                Ok(ttl) => self.registry.ttl = ttl,
                Err(e) => tracing::warn!(value = raw.as_str(), error = %e, "Ignoring bad REGISTRY_TTL"),
            }
        }
        if let Ok(raw) = std::env::var("INTER_EG_TIMEOUT") {
            match humantime::parse_duration(&raw) {
                Ok(timeout) => self.sharding.inter_eg_timeout = timeout,
                Err(e) => tracing::warn!(value = raw.as_str(), error = %e, "Ignoring bad INTER_EG_TIMEOUT"),
            }
        }
    }

    /// Look a host up by request domain (case-insensitive, port stripped).
    pub fn host_for_domain(&self, domain: &str) -> Option<&Host> {
        self.domain_index
            .get(&normalize_domain(domain))
            .map(|&i| &self.hosts[i])
    }

    pub fn host_by_id(&self, id: i32) -> Option<&Host> {
        self.hosts.iter().find(|h| h.id == id)
    }

    /// Build the effective config for a request: defaults → host → rule.
    pub fn resolve(&self, host: &Host, rule: Option<&UrlRule>) -> ResolvedConfig {
        let mut chain: Vec<&ScopeConfig> = vec![&self.defaults, &host.scope];
        if let Some(rule) = rule {
            chain.push(&rule.overrides);
        }
        resolve::resolve(&chain, Some((host.bothit_enabled, host.bothit_interval)))
    }
}

impl Host {
    fn compile(cfg: model::HostConfig) -> Result<Self, ConfigError> {
        let host_id = cfg.id;

        let domains: Vec<String> = cfg
            .domain
            .clone()
            .into_vec()
            .iter()
            .map(|d| normalize_domain(d))
            .collect();
        if domains.is_empty() {
            return Err(ConfigError::NoDomains { host_id });
        }

        let mut dimensions = Vec::with_capacity(cfg.dimensions.len());
        for dim in &cfg.dimensions {
            if dimensions.iter().any(|d: &Dimension| d.id == dim.id) {
                return Err(ConfigError::DuplicateDimensionId {
                    host_id,
                    dimension_id: dim.id,
                });
            }
            let match_ua = dim
                .match_ua
                .as_deref()
                .map(|re| {
                    regex::RegexBuilder::new(re)
                        .case_insensitive(true)
                        .build()
                        .map_err(|source| PatternError::Regex {
                            pattern: re.to_string(),
                            source,
                        })
                })
                .transpose()?;
            dimensions.push(Dimension {
                id: dim.id,
                name: dim.name.clone(),
                match_ua,
                user_agent: dim.user_agent.clone(),
                viewport: dim.viewport.unwrap_or_default(),
            });
        }

        let unmatched = match cfg.unmatched_dimension.as_deref() {
            None | Some("block") => UnmatchedPolicy::Block,
            Some("bypass") => UnmatchedPolicy::Bypass,
            Some(name) => {
                if !dimensions.iter().any(|d| d.name == name) {
                    return Err(ConfigError::UnknownUnmatchedDimension {
                        host_id,
                        name: name.to_string(),
                    });
                }
                UnmatchedPolicy::Dimension(name.to_string())
            }
        };

        let mut url_rules = Vec::with_capacity(cfg.url_rules.len());
        for (rule_index, rule) in cfg.url_rules.iter().enumerate() {
            url_rules.push(UrlRule::compile(host_id, rule_index, rule)?);
        }

        let (bothit_enabled, bothit_interval) = match &cfg.bothit_recache {
            Some(b) => (b.enabled, b.interval),
            None => (false, None),
        };

        Ok(Self {
            id: host_id,
            domains,
            render_key: cfg.render_key.clone(),
            dimensions,
            unmatched,
            bothit_enabled,
            bothit_interval,
            scope: cfg.scope(),
            url_rules,
        })
    }

    /// Resolve the render dimension for a User-Agent. Dimensions are tried
    /// in configuration order; the unmatched policy applies when none hit.
    pub fn match_dimension(&self, user_agent: &str) -> DimensionDecision<'_> {
        for dim in &self.dimensions {
            if let Some(re) = &dim.match_ua {
                if re.is_match(user_agent) {
                    return DimensionDecision::Dimension(dim);
                }
            }
        }
        match &self.unmatched {
            UnmatchedPolicy::Dimension(name) => {
                // Validated at load.
                let dim = self
                    .dimensions
                    .iter()
                    .find(|d| &d.name == name)
                    .expect("unmatched_dimension validated at load");
                DimensionDecision::Dimension(dim)
            }
            UnmatchedPolicy::Block => DimensionDecision::Block,
            UnmatchedPolicy::Bypass => DimensionDecision::Bypass,
        }
    }

    pub fn dimension_by_id(&self, id: i32) -> Option<&Dimension> {
        self.dimensions.iter().find(|d| d.id == id)
    }

    pub fn dimension_by_name(&self, name: &str) -> Option<&Dimension> {
        self.dimensions.iter().find(|d| d.name == name)
    }

    /// First matching rule in list order, or None (default action: render).
    pub fn match_rule(&self, path: &str, query_pairs: &[(String, String)]) -> Option<&UrlRule> {
        self.url_rules
            .iter()
            .find(|rule| rule.matches(path, query_pairs))
    }
}

impl UrlRule {
    fn compile(
        host_id: i32,
        rule_index: usize,
        cfg: &model::UrlRuleConfig,
    ) -> Result<Self, ConfigError> {
        let mut patterns = Vec::new();
        for p in cfg.matches.as_slice() {
            patterns.push(UrlPattern::compile(p)?);
        }

        let status_cfg = cfg.status.clone().unwrap_or_default();
        let status_response = |code: u16| StatusResponse {
            code,
            headers: status_cfg.headers.clone(),
            body: status_cfg.body.clone().unwrap_or_default(),
        };

        let action = match cfg.action {
            model::RuleActionConfig::Render => RuleAction::Render,
            model::RuleActionConfig::Bypass => RuleAction::Bypass,
            model::RuleActionConfig::Block => RuleAction::Block,
            model::RuleActionConfig::Status403 => RuleAction::Status(status_response(403)),
            model::RuleActionConfig::Status404 => RuleAction::Status(status_response(404)),
            model::RuleActionConfig::Status410 => RuleAction::Status(status_response(410)),
            model::RuleActionConfig::Status => {
                let code = status_cfg.code.ok_or(ConfigError::MissingStatus {
                    host_id,
                    rule_index,
                    action: "status".to_string(),
                })?;
                RuleAction::Status(status_response(code))
            }
        };

        let query = cfg
            .match_query
            .as_ref()
            .map(|q| QueryFilter::new(q.clone()));

        Ok(Self {
            patterns,
            query,
            action,
            overrides: cfg.scope(),
        })
    }

    pub fn matches(&self, path: &str, query_pairs: &[(String, String)]) -> bool {
        if !self.patterns.iter().any(|p| p.matches(path)) {
            return false;
        }
        match &self.query {
            Some(filter) => filter.matches(query_pairs),
            None => true,
        }
    }
}

/// At most one of `safe_request` / `safe_request_add` per scope, same for
/// response. Both set is a config error, not a silent precedence.
fn validate_headers_scope(
    scope: &ScopeConfig,
    host_id: i32,
    where_: &str,
) -> Result<(), ConfigError> {
    if let Some(headers) = &scope.headers {
        if headers.safe_request.is_some() && headers.safe_request_add.is_some() {
            return Err(ConfigError::HeaderScopeConflict {
                host_id,
                scope: format!("{where_}: both safe_request and safe_request_add set"),
            });
        }
        if headers.safe_response.is_some() && headers.safe_response_add.is_some() {
            return Err(ConfigError::HeaderScopeConflict {
                host_id,
                scope: format!("{where_}: both safe_response and safe_response_add set"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExpiredPolicy;

    const BASE: &str = r#"
server:
  port: 8080
redis:
  addr: redis://127.0.0.1:6379
auth:
  internal_key: secret
eg:
  id: eg-a
  address: http://eg-a:8080
  base_path: /var/cache/edgerender
"#;

    fn with_hosts(hosts: &str) -> String {
        format!("{BASE}{hosts}")
    }

    #[test]
    fn minimal_config_loads_with_defaults() {
        let cfg = Config::from_yaml(BASE).unwrap();
        assert_eq!(cfg.registry.ttl, Duration::from_secs(3));
        assert_eq!(cfg.sharding.replication_factor, 1);
        assert!(!cfg.sharding.enabled);
        assert_eq!(cfg.recache.tick_interval, Duration::from_millis(100));
        assert_eq!(cfg.recache.internal_queue_max_size, 1000);
    }

    #[test]
    fn unknown_field_is_fatal() {
        let yaml = format!("{BASE}typo_field: true\n");
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn host_domain_scalar_or_list() {
        let cfg = Config::from_yaml(&with_hosts(
            r#"
hosts:
  - id: 1
    domain: Example.COM.
    render_key: k1
    dimensions:
      - id: 1
        name: desktop
  - id: 2
    domain: [a.example.org, b.example.org]
    render_key: k2
    dimensions:
      - id: 1
        name: desktop
"#,
        ))
        .unwrap();

        assert_eq!(cfg.host_for_domain("example.com").unwrap().id, 1);
        assert_eq!(cfg.host_for_domain("EXAMPLE.COM:443").unwrap().id, 1);
        assert_eq!(cfg.host_for_domain("b.example.org").unwrap().id, 2);
        assert!(cfg.host_for_domain("c.example.org").is_none());
    }

    #[test]
    fn duplicate_domain_across_hosts_is_fatal() {
        let result = Config::from_yaml(&with_hosts(
            r#"
hosts:
  - id: 1
    domain: example.com
    render_key: k1
    dimensions: [{id: 1, name: desktop}]
  - id: 2
    domain: example.com
    render_key: k2
    dimensions: [{id: 1, name: desktop}]
"#,
        ));
        assert!(matches!(result, Err(ConfigError::DuplicateDomain { .. })));
    }

    #[test]
    fn duplicate_host_id_is_fatal() {
        let result = Config::from_yaml(&with_hosts(
            r#"
hosts:
  - id: 1
    domain: a.com
    render_key: k1
    dimensions: [{id: 1, name: desktop}]
  - id: 1
    domain: b.com
    render_key: k2
    dimensions: [{id: 1, name: desktop}]
"#,
        ));
        assert!(matches!(result, Err(ConfigError::DuplicateHostId(1))));
    }

    #[test]
    fn unmatched_dimension_must_exist_or_be_sentinel() {
        let bad = Config::from_yaml(&with_hosts(
            r#"
hosts:
  - id: 1
    domain: example.com
    render_key: k
    unmatched_dimension: tablet
    dimensions: [{id: 1, name: desktop}]
"#,
        ));
        assert!(matches!(
            bad,
            Err(ConfigError::UnknownUnmatchedDimension { .. })
        ));

        let ok = Config::from_yaml(&with_hosts(
            r#"
hosts:
  - id: 1
    domain: example.com
    render_key: k
    unmatched_dimension: bypass
    dimensions: [{id: 1, name: desktop}]
"#,
        ))
        .unwrap();
        assert_eq!(ok.hosts[0].unmatched, UnmatchedPolicy::Bypass);
    }

    #[test]
    fn dimension_matching_with_fallback() {
        let cfg = Config::from_yaml(&with_hosts(
            r#"
hosts:
  - id: 1
    domain: example.com
    render_key: k
    unmatched_dimension: desktop
    dimensions:
      - id: 1
        name: desktop
      - id: 2
        name: mobile
        match_ua: "Mobile|Android|iPhone"
"#,
        ))
        .unwrap();
        let host = &cfg.hosts[0];

        match host.match_dimension("Mozilla/5.0 (iPhone; Mobile)") {
            DimensionDecision::Dimension(d) => assert_eq!(d.name, "mobile"),
            other => panic!("expected mobile dimension, got {other:?}"),
        }
        match host.match_dimension("Googlebot/2.1") {
            DimensionDecision::Dimension(d) => assert_eq!(d.name, "desktop"),
            other => panic!("expected desktop fallback, got {other:?}"),
        }
    }

    #[test]
    fn unmatched_defaults_to_block() {
        let cfg = Config::from_yaml(&with_hosts(
            r#"
hosts:
  - id: 1
    domain: example.com
    render_key: k
    dimensions:
      - id: 2
        name: mobile
        match_ua: "Mobile"
"#,
        ))
        .unwrap();
        assert!(matches!(
            cfg.hosts[0].match_dimension("Desktop UA"),
            DimensionDecision::Block
        ));
    }

    #[test]
    fn url_rules_first_match_wins() {
        let cfg = Config::from_yaml(&with_hosts(
            r#"
hosts:
  - id: 1
    domain: example.com
    render_key: k
    dimensions: [{id: 1, name: desktop}]
    url_rules:
      - match: "/gone/*"
        action: status_410
      - match: ["/feed", "/feed/*"]
        action: bypass
      - match: "~^/admin"
        action: block
      - match: "/gone/but-actually-fine"
        action: render
"#,
        ))
        .unwrap();
        let host = &cfg.hosts[0];

        let rule = host.match_rule("/gone/x", &[]).unwrap();
        assert!(matches!(&rule.action, RuleAction::Status(s) if s.code == 410));

        // Earlier glob shadows the later exact rule.
        let rule = host.match_rule("/gone/but-actually-fine", &[]).unwrap();
        assert!(matches!(&rule.action, RuleAction::Status(s) if s.code == 410));

        assert!(matches!(
            host.match_rule("/feed/atom", &[]).unwrap().action,
            RuleAction::Bypass
        ));
        assert!(matches!(
            host.match_rule("/admin/users", &[]).unwrap().action,
            RuleAction::Block
        ));
        assert!(host.match_rule("/page", &[]).is_none());
    }

    #[test]
    fn status_action_requires_code() {
        let result = Config::from_yaml(&with_hosts(
            r#"
hosts:
  - id: 1
    domain: example.com
    render_key: k
    dimensions: [{id: 1, name: desktop}]
    url_rules:
      - match: "/legal/*"
        action: status
"#,
        ));
        assert!(matches!(result, Err(ConfigError::MissingStatus { .. })));
    }

    #[test]
    fn header_scope_conflict_is_fatal() {
        let result = Config::from_yaml(&with_hosts(
            r#"
hosts:
  - id: 1
    domain: example.com
    render_key: k
    dimensions: [{id: 1, name: desktop}]
    headers:
      safe_request: [cookie]
      safe_request_add: [x-debug]
"#,
        ));
        assert!(matches!(
            result,
            Err(ConfigError::HeaderScopeConflict { .. })
        ));
    }

    #[test]
    fn resolve_chains_defaults_host_rule() {
        let cfg = Config::from_yaml(&format!(
            "{BASE}{}",
            r#"
defaults:
  cache:
    ttl: 1h
    expired_policy: serve_stale
hosts:
  - id: 1
    domain: example.com
    render_key: k
    dimensions: [{id: 1, name: desktop}]
    cache:
      ttl: 30m
    url_rules:
      - match: "/news/*"
        cache:
          ttl: 5m
          expired_policy: delete
"#
        ))
        .unwrap();
        let host = &cfg.hosts[0];

        let resolved = cfg.resolve(host, None);
        assert_eq!(resolved.ttl, Duration::from_secs(1800));
        assert_eq!(resolved.expired_policy, ExpiredPolicy::ServeStale);

        let rule = host.match_rule("/news/today", &[]).unwrap();
        let resolved = cfg.resolve(host, Some(rule));
        assert_eq!(resolved.ttl, Duration::from_secs(300));
        assert_eq!(resolved.expired_policy, ExpiredPolicy::Delete);
    }
}
