pub mod distributor;
pub mod error;
pub mod registry;
pub mod shard;

pub use distributor::Distributor;
pub use error::{ClusterError, Result};
pub use registry::{spawn_heartbeat, EgRegistration, Registry};
pub use shard::{
    PulledEntry, PushRequest, ReplicationOutcome, ShardClient, ShardMetadata, ShardStatus,
    INTERNAL_AUTH_HEADER, SHARD_METADATA_HEADER,
};
