pub mod cache;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod observability;
pub mod server;
pub mod service;

use std::sync::Arc;
use std::time::Duration;

use flagforge_db_memory::InMemoryFlagStorage;
use flagforge_storage::{DynStorage, StorageError};

pub use cache::{
    CacheStore, DynBus, DynCache, FetchedSnapshot, InvalidationBus, InvalidationPublisher,
    InvalidationReport, InvalidationSubscriber, LocalBus, LocalCache, RedisBus, RedisCache,
    SnapshotCache, TieredCache,
};
pub use config::{
    AppConfig, CacheConfig, InvalidationConfig, PostgresStorageConfig, RedisConfig,
    ServerConfig, StorageBackend, StorageConfig,
};
pub use error::ApiError;
pub use observability::init_tracing;
pub use server::{AppState, FlagforgeServer, ServerBuilder, build_app};
pub use service::{FlagService, InvalidationMode};

/// The cache and bus a process runs with.
#[derive(Clone)]
pub struct CacheLayer {
    /// Snapshot cache seen by readers and the publisher.
    pub cache: DynCache,
    /// Process-local tier, evicted by the invalidation subscriber.
    pub local: LocalCache,
    pub bus: DynBus,
}

impl CacheLayer {
    /// Single-instance layer: local cache and an in-process bus.
    pub fn local(channel: &str) -> Self {
        let local = LocalCache::new();
        Self {
            cache: Arc::new(local.clone()),
            local,
            bus: Arc::new(LocalBus::new(channel)),
        }
    }

    pub fn mode(&self) -> &'static str {
        self.cache.mode()
    }
}

/// Create the cache layer based on configuration.
///
/// ## Cache Modes
///
/// - **Redis disabled**: local cache (DashMap) and an in-process bus
/// - **Redis enabled**: L1 DashMap in front of Redis, Redis pub/sub bus.
///   Falls back to local mode when Redis cannot be reached.
///
/// ## Graceful Degradation
///
/// The server starts and serves reads even if Redis is unavailable.
pub async fn create_cache_backend(
    redis: &RedisConfig,
    cache: &CacheConfig,
    channel: &str,
) -> CacheLayer {
    if !redis.enabled {
        tracing::info!("Redis disabled, using local cache only");
        return CacheLayer::local(channel);
    }

    tracing::info!(url = %redis.url, "Connecting to Redis");

    let mut redis_config = deadpool_redis::Config::from_url(&redis.url);
    if let Some(ref mut pool_config) = redis_config.pool {
        pool_config.max_size = redis.pool_size;
        pool_config.timeouts.wait = Some(Duration::from_millis(redis.timeout_ms));
        pool_config.timeouts.create = Some(Duration::from_millis(redis.timeout_ms));
        pool_config.timeouts.recycle = Some(Duration::from_millis(redis.timeout_ms));
    } else {
        let mut pool_config = deadpool_redis::PoolConfig::new(redis.pool_size);
        pool_config.timeouts.wait = Some(Duration::from_millis(redis.timeout_ms));
        pool_config.timeouts.create = Some(Duration::from_millis(redis.timeout_ms));
        pool_config.timeouts.recycle = Some(Duration::from_millis(redis.timeout_ms));
        redis_config.pool = Some(pool_config);
    }

    let pool = match redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1)) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to create Redis pool. Falling back to local cache."
            );
            return CacheLayer::local(channel);
        }
    };

    match pool.get().await {
        Ok(_) => {
            tracing::info!("Connected to Redis");
            let local = LocalCache::new();
            let tiered = TieredCache::new(
                local.clone(),
                RedisCache::new(pool.clone()),
                cache.local_ttl(),
            );
            CacheLayer {
                cache: Arc::new(tiered),
                local,
                bus: Arc::new(RedisBus::new(pool, redis.url.clone(), channel)),
            }
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to connect to Redis. Falling back to local cache."
            );
            CacheLayer::local(channel)
        }
    }
}

/// Create the flag store selected by `storage.backend`.
pub async fn create_storage(cfg: &StorageConfig) -> Result<DynStorage, StorageError> {
    match cfg.backend {
        StorageBackend::Postgres => {
            let storage: DynStorage =
                flagforge_db_postgres::create_storage(cfg.postgres.to_postgres_config()).await?;
            Ok(storage)
        }
        StorageBackend::Memory => {
            let storage = InMemoryFlagStorage::new();
            for env in &cfg.memory.environments {
                storage.add_environment(env.clone()).await;
            }
            tracing::warn!(
                environments = cfg.memory.environments.len(),
                "Using in-memory flag store; data is lost on restart"
            );
            Ok(Arc::new(storage))
        }
    }
}
