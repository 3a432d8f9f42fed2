//! Snapshot caching and cross-instance invalidation.
//!
//! ## Architecture
//!
//! - **L1 Cache (DashMap)**: In-memory, per-instance
//! - **L2 Cache (Redis)**: Network, shared across instances
//! - **Invalidation bus**: Redis pub/sub (or an in-process broadcast) carrying
//!   project ids whose snapshots went stale
//!
//! ## Read path
//!
//! ```text
//! GET /v1/flags → SnapshotCache::fetch → L1 → L2 → FlagStorage
//!                                         (repopulate with a new tag on miss)
//! ```
//!
//! ## Write path
//!
//! ```text
//! POST /v1/flags → commit → InvalidationPublisher::invalidate
//!                               ├─ SCAN + DEL flags:{project}:*
//!                               └─ PUBLISH {project}
//! ```
//!
//! ## Graceful Degradation
//!
//! If Redis is unavailable or disabled, the system falls back to L1-only
//! mode with an in-process bus. Cache and bus faults never fail a request.

pub mod backend;
pub mod invalidation;
pub mod keys;
pub mod pubsub;
pub mod snapshot;

pub use backend::{CacheError, CacheStore, CachedEntry, DynCache, LocalCache, RedisCache, TieredCache};
pub use invalidation::{InvalidationPublisher, InvalidationReport};
pub use keys::{project_prefix, snapshot_key};
pub use pubsub::{
    BusError, DynBus, EvictLocalSnapshots, InvalidationBus, InvalidationHandler,
    InvalidationStream, InvalidationSubscriber, LocalBus, RecordInvalidation, RedisBus,
    SubscriberExit, spawn_supervised, wait_for_shutdown,
};
pub use snapshot::{
    CacheFault, FetchedSnapshot, SnapshotCache, SnapshotCacheSettings, SnapshotSource, mint_tag,
};
