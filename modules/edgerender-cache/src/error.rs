use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Blob I/O error at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Metadata serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Entry already expired: expires_at {0}")]
    AlreadyExpired(chrono::DateTime<chrono::Utc>),

    #[error("Refusing blob path outside the cache root: {0}")]
    InvalidPath(String),
}
