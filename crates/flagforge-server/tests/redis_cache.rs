//! Integration tests for the Redis-backed cache and invalidation bus.
//!
//! - L2 (Redis): shared snapshot cache, prefix scan and delete
//! - Tiered: L1 promotion and eviction
//! - Bus: Redis pub/sub delivery between two subscribers
//!
//! Tests use testcontainers to spin up a real Redis instance.
//!
//! Run with: cargo test -p flagforge-server --test redis_cache -- --ignored

use std::sync::Arc;
use std::time::Duration;

use flagforge_db_memory::InMemoryFlagStorage;
use flagforge_server::cache::{
    CacheStore, DynBus, EvictLocalSnapshots, InvalidationBus, InvalidationPublisher,
    InvalidationStream, InvalidationSubscriber, LocalBus, LocalCache, RecordInvalidation,
    RedisBus, RedisCache, SnapshotCache, SnapshotCacheSettings, SnapshotSource, TieredCache,
    snapshot_key, spawn_supervised,
};
use flagforge_server::{CacheConfig, RedisConfig, create_cache_backend};
use flagforge_storage::{FlagStorage, NewFlag};
use futures_util::StreamExt;
use serde_json::json;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::{OnceCell, watch};

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

/// Get or create the shared Redis container
async fn get_redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");

            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let url = format!("redis://127.0.0.1:{}", host_port);

            (container, url)
        })
        .await;

    url.clone()
}

fn pool(url: &str) -> deadpool_redis::Pool {
    deadpool_redis::Config::from_url(url)
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .expect("create redis pool")
}

async fn recv(stream: &mut InvalidationStream) -> String {
    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("message in time")
        .expect("stream open")
        .expect("valid payload")
}

fn redis_config(url: String) -> RedisConfig {
    RedisConfig {
        enabled: true,
        url,
        pool_size: 4,
        timeout_ms: 2000,
    }
}

#[tokio::test]
#[ignore = "requires docker"]
async fn redis_cache_get_set_delete_and_scan() {
    let url = get_redis_url().await;
    let cache = RedisCache::new(pool(&url));
    assert!(cache.is_available().await);

    let ttl = Duration::from_secs(60);
    for key in [
        snapshot_key("rc-a", "prod"),
        snapshot_key("rc-a", "dev"),
        snapshot_key("rc-ab", "prod"),
    ] {
        cache.set(&key, b"snapshot".to_vec(), ttl).await.unwrap();
    }

    let value = cache.get(&snapshot_key("rc-a", "prod")).await.unwrap();
    assert_eq!(value, Some(Arc::new(b"snapshot".to_vec())));

    let mut keys = cache.scan_prefix("flags:rc-a:").await.unwrap();
    keys.sort();
    assert_eq!(keys, vec!["flags:rc-a:dev", "flags:rc-a:prod"]);

    cache.delete(&snapshot_key("rc-a", "prod")).await.unwrap();
    assert!(cache.get(&snapshot_key("rc-a", "prod")).await.unwrap().is_none());
    assert!(cache.get(&snapshot_key("rc-ab", "prod")).await.unwrap().is_some());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn redis_cache_sub_second_ttl_rounds_up() {
    let url = get_redis_url().await;
    let cache = RedisCache::new(pool(&url));

    cache
        .set("flags:rc-ttl:prod", b"v".to_vec(), Duration::from_millis(100))
        .await
        .unwrap();
    assert!(cache.get("flags:rc-ttl:prod").await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(cache.get("flags:rc-ttl:prod").await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn tiered_cache_promotes_and_deletes_both_tiers() {
    let url = get_redis_url().await;
    let redis = RedisCache::new(pool(&url));
    let key = snapshot_key("tier", "prod");

    // Written by another instance, straight into L2
    redis.set(&key, b"shared".to_vec(), Duration::from_secs(60)).await.unwrap();

    let local = LocalCache::new();
    let tiered = TieredCache::new(local.clone(), redis.clone(), Duration::from_secs(5));
    assert_eq!(tiered.mode(), "tiered");
    assert!(!local.contains(&key));

    let value = tiered.get(&key).await.unwrap();
    assert_eq!(value, Some(Arc::new(b"shared".to_vec())));
    assert!(local.contains(&key), "L2 hit is promoted into L1");

    let keys = tiered.scan_prefix("flags:tier:").await.unwrap();
    assert_eq!(keys, vec![key.clone()]);

    tiered.delete(&key).await.unwrap();
    assert!(!local.contains(&key));
    assert!(redis.get(&key).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn promoted_entry_expires_with_its_l2_copy() {
    let url = get_redis_url().await;
    let redis = RedisCache::new(pool(&url));
    let key = snapshot_key("tier-ttl", "prod");
    redis.set(&key, b"short".to_vec(), Duration::from_secs(1)).await.unwrap();

    let local = LocalCache::new();
    let tiered = TieredCache::new(local.clone(), redis, Duration::from_secs(60));
    assert!(tiered.get(&key).await.unwrap().is_some());
    assert!(local.contains(&key));

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(!local.contains(&key), "L1 copy outlived the L2 entry");
    assert!(tiered.get(&key).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn redis_bus_delivers_to_every_subscriber() {
    let url = get_redis_url().await;
    let bus = RedisBus::new(pool(&url), url.clone(), "test.bus.delivery");

    let mut a = bus.subscribe().await.unwrap();
    let mut b = bus.subscribe().await.unwrap();
    bus.publish("proj1").await.unwrap();

    assert_eq!(recv(&mut a).await, "proj1");
    assert_eq!(recv(&mut b).await, "proj1");
}

#[tokio::test]
#[ignore = "requires docker"]
async fn two_instances_share_cache_and_invalidation() {
    let url = get_redis_url().await;
    let cfg = CacheConfig::default();
    let channel = "test.bus.instances";

    let instance_a = create_cache_backend(&redis_config(url.clone()), &cfg, channel).await;
    let instance_b = create_cache_backend(&redis_config(url.clone()), &cfg, channel).await;
    assert_eq!(instance_a.mode(), "tiered");

    let store = InMemoryFlagStorage::new().with_environment("shared", "env-prod", "prod");
    store
        .commit_flag(&NewFlag::new("shared", "dark_mode", "boolean").with_value("env-prod", json!(true)))
        .await
        .unwrap();

    let (shutdown, shutdown_rx) = watch::channel(false);
    let recorder = Arc::new(RecordInvalidation::new());
    let worker = spawn_supervised(
        Arc::new(InvalidationSubscriber::new(instance_b.bus.clone(), recorder.clone())),
        shutdown_rx.clone(),
    );
    let evictor = spawn_supervised(
        Arc::new(InvalidationSubscriber::new(
            instance_b.bus.clone(),
            Arc::new(EvictLocalSnapshots::new(instance_b.local.clone())),
        )),
        shutdown_rx,
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    let reader_a = SnapshotCache::new(
        Arc::new(store.clone()),
        instance_a.cache.clone(),
        SnapshotCacheSettings::default(),
    );
    let reader_b = SnapshotCache::new(
        Arc::new(store.clone()),
        instance_b.cache.clone(),
        SnapshotCacheSettings::default(),
    );

    // A populates L2, B hits it and fills its own L1
    let first = reader_a.fetch("shared", "prod").await.unwrap();
    let from_b = reader_b.fetch("shared", "prod").await.unwrap();
    assert_eq!(from_b.source, SnapshotSource::Cache);
    assert_eq!(from_b.tag, first.tag);
    assert!(instance_b.local.contains(&snapshot_key("shared", "prod")));

    // A invalidates; B's L1 copy goes away through the broadcast
    let publisher = InvalidationPublisher::new(
        instance_a.cache.clone(),
        instance_a.bus.clone(),
        cfg.operation_timeout(),
    );
    let report = publisher.invalidate("shared").await;
    assert!(report.is_clean());

    tokio::time::timeout(Duration::from_secs(5), async {
        while instance_b.local.contains(&snapshot_key("shared", "prod")) || recorder.received() == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("peer evicted and worker notified");

    let after = reader_b.fetch("shared", "prod").await.unwrap();
    assert_eq!(after.source, SnapshotSource::Store);
    assert_eq!(after.flags, first.flags);

    shutdown.send(true).unwrap();
    worker.await.unwrap();
    evictor.await.unwrap();
}

#[tokio::test]
async fn unreachable_redis_falls_back_to_local() {
    let cfg = RedisConfig {
        enabled: true,
        url: "redis://127.0.0.1:1".into(),
        pool_size: 1,
        timeout_ms: 200,
    };

    let layer = create_cache_backend(&cfg, &CacheConfig::default(), "test.fallback").await;
    assert_eq!(layer.mode(), "local");

    let bus: DynBus = layer.bus.clone();
    assert_eq!(bus.channel(), "test.fallback");
}

#[tokio::test]
async fn invalidation_clears_l1_while_redis_is_down() {
    let local = LocalCache::new();
    let tiered = Arc::new(TieredCache::new(
        local.clone(),
        RedisCache::new(pool("redis://127.0.0.1:1")),
        Duration::from_secs(60),
    ));
    let store = InMemoryFlagStorage::new().with_environment("proj1", "env-prod", "prod");
    let settings = SnapshotCacheSettings {
        ttl: Duration::from_secs(60),
        operation_timeout: Duration::from_millis(500),
    };
    let reader = SnapshotCache::new(Arc::new(store.clone()), tiered.clone(), settings);
    let key = snapshot_key("proj1", "prod");

    // L2 writes fail but the snapshot still lands in L1
    let first = reader.fetch("proj1", "prod").await.unwrap();
    assert!(first.flags.is_empty());
    assert!(local.contains(&key));
    assert!(reader.fetch("proj1", "prod").await.unwrap().is_hit());

    store
        .commit_flag(&NewFlag::new("proj1", "dark_mode", "boolean").with_value("env-prod", json!(true)))
        .await
        .unwrap();

    let publisher = InvalidationPublisher::new(
        tiered,
        Arc::new(LocalBus::new("test.degraded")),
        Duration::from_millis(500),
    );
    let report = publisher.invalidate("proj1").await;
    assert!(!report.is_clean());
    assert!(report.published());
    assert!(report.delete_failures.iter().any(|(k, _)| k == &key));
    assert!(!local.contains(&key), "L1 copy survived the invalidation");

    let after = reader.fetch("proj1", "prod").await.unwrap();
    assert_eq!(after.source, SnapshotSource::Store);
    assert_eq!(after.flags.len(), 1);
    assert_eq!(after.flags[0].key, "dark_mode");
}
