use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Shard pull miss from {eg_id} (status {status})")]
    PullMiss { eg_id: String, status: u16 },

    #[error("Shard push to {eg_id} rejected (status {status}): {message}")]
    PushRejected {
        eg_id: String,
        status: u16,
        message: String,
    },

    #[error("Peer response missing or invalid {header} header")]
    BadShardMetadata { header: String },

    #[error(
        "Sharding is disabled but the cluster already has members: {members:?}. \
         Refusing to start unsharded in a sharded cluster"
    )]
    ShardedClusterPresent { members: Vec<String> },

    #[error("Unknown EG '{0}' in registry")]
    UnknownEg(String),
}

impl From<reqwest::Error> for ClusterError {
    fn from(err: reqwest::Error) -> Self {
        ClusterError::Network(err.to_string())
    }
}
