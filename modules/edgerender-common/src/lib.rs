pub mod config;
pub mod error;
pub mod pattern;
pub mod types;
pub mod urlnorm;
pub mod util;

pub use config::{
    Config, Dimension, DimensionDecision, Host, ResolvedConfig, RuleAction, StatusResponse,
    UnmatchedPolicy, UrlRule,
};
pub use error::{ConfigError, PatternError, UrlError};
pub use types::{
    CacheKey, CacheMetadata, CacheSource, Compression, EgInfo, ExpiredPolicy, RecacheMember,
    RecachePriority, RsInfo, Viewport, WaitFor,
};
