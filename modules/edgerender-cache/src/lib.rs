pub mod blob;
pub mod error;
pub mod meta;
pub mod queue;
pub mod store;

pub use blob::{BlobStore, MIN_COMPRESS_SIZE};
pub use error::{CacheError, Result};
pub use meta::{MemoryMetaStore, MetaStore, RedisMetaStore};
pub use queue::{MemoryRecacheQueue, RecacheQueue, RedisRecacheQueue};
pub use store::{CacheStore, Lookup};
