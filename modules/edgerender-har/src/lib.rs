//! HAR capture for rendered pages: a passive network-event collector fed
//! by the browser's lifecycle events, and a HAR 1.2 builder with an
//! `_metadata` extension for render-specific context.

pub mod builder;
pub mod collector;

pub use builder::{build, Har, HarEntry, HarLog, HarMetadata};
pub use collector::{
    collect, BlockedRequest, FailedRequest, HarCollector, LifecycleEvent, NetworkEvent,
    RequestRecord, ResponseRecord, MAX_TRACKED_REQUESTS,
};
