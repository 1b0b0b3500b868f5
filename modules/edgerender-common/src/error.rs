use thiserror::Error;

/// Fatal configuration problems. Any of these refuses process start.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("duplicate host id {0}")]
    DuplicateHostId(i32),

    #[error("domain '{domain}' is configured on more than one host")]
    DuplicateDomain { domain: String },

    #[error("host {host_id} has no domains")]
    NoDomains { host_id: i32 },

    #[error("host {host_id}: duplicate dimension id {dimension_id}")]
    DuplicateDimensionId { host_id: i32, dimension_id: i32 },

    #[error("host {host_id}: unmatched_dimension '{name}' does not name a configured dimension")]
    UnknownUnmatchedDimension { host_id: i32, name: String },

    #[error("host {host_id}: {scope}")]
    HeaderScopeConflict { host_id: i32, scope: String },

    #[error("invalid pattern: {0}")]
    Pattern(#[from] PatternError),

    #[error("host {host_id}, rule {rule_index}: action '{action}' requires a status code")]
    MissingStatus {
        host_id: i32,
        rule_index: usize,
        action: String,
    },

    #[error("{0}")]
    Invalid(String),
}

/// Pattern compilation failures (bad regex, empty pattern).
#[derive(Error, Debug)]
pub enum PatternError {
    #[error("empty pattern")]
    Empty,

    #[error("invalid regex '{pattern}': {source}")]
    Regex {
        pattern: String,
        source: regex::Error,
    },
}

/// URL normalization failures.
#[derive(Error, Debug)]
pub enum UrlError {
    #[error("invalid url '{0}'")]
    Invalid(String),

    #[error("url '{0}' has no host")]
    NoHost(String),

    #[error("unsupported scheme '{scheme}' in url '{url}'")]
    UnsupportedScheme { url: String, scheme: String },
}
