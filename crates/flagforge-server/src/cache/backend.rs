//! Cache backends: L1 (DashMap), L2 (Redis) and the tiered combination.

use async_trait::async_trait;
use dashmap::DashMap;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Keys fetched per SCAN round trip.
const SCAN_BATCH: usize = 100;

/// Errors raised by a cache backend.
///
/// None of these ever fail a read or a write on their own; callers record
/// them as degradations and fall back to the store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("cache connection error: {0}")]
    Connection(String),

    #[error("cache command error: {0}")]
    Command(String),

    #[error("cache operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Key/value operations the snapshot cache and the invalidation publisher need.
///
/// Each call is independently fallible and individually atomic per key.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Returns the value under `key`, or `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Arc<Vec<u8>>>, CacheError>;

    /// Stores `value` under `key` for at most `ttl`.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    /// Removes `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Lists every live key starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError>;

    /// Short label for logs, metrics and readiness output.
    fn mode(&self) -> &'static str;
}

/// Shared cache handle.
pub type DynCache = Arc<dyn CacheStore>;

/// Runs a cache call under a deadline, turning expiry into [`CacheError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, CacheError>
where
    F: Future<Output = Result<T, CacheError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(CacheError::Timeout(limit)),
    }
}

/// A cached entry with TTL support.
///
/// The data is wrapped in `Arc` so hits hand out the snapshot bytes without copying.
#[derive(Clone, Debug)]
pub struct CachedEntry {
    pub data: Arc<Vec<u8>>,
    pub cached_at: Instant,
    pub ttl: Duration,
}

impl CachedEntry {
    /// Create a new cached entry.
    pub fn new(data: Vec<u8>, ttl: Duration) -> Self {
        Self {
            data: Arc::new(data),
            cached_at: Instant::now(),
            ttl,
        }
    }

    /// Check if this entry has expired.
    pub fn is_expired(&self) -> bool {
        self.cached_at.elapsed() > self.ttl
    }
}

/// Process-local cache on a `DashMap`.
///
/// Used on its own in single-instance mode and as the L1 tier of [`TieredCache`].
/// Clones share the same map.
#[derive(Clone, Debug, Default)]
pub struct LocalCache {
    entries: Arc<DashMap<String, CachedEntry>>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries held, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a live entry exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired())
    }

    /// Drops every entry under `prefix`, returning how many were removed.
    ///
    /// Expired entries under other prefixes are reaped on the way.
    pub fn evict_prefix(&self, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|key, entry| !key.starts_with(prefix) && !entry.is_expired());
        before.saturating_sub(self.entries.len())
    }

    /// Drops every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        before.saturating_sub(self.entries.len())
    }

    fn get_live(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let entry = self.entries.get(key)?;
        if !entry.is_expired() {
            return Some(Arc::clone(&entry.data));
        }
        drop(entry);
        // Expired: drop it so the map does not keep dead snapshots around
        self.entries.remove_if(key, |_, entry| entry.is_expired());
        None
    }

    fn insert(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        self.entries
            .insert(key.to_string(), CachedEntry::new(value, ttl));
    }

    fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    fn live_keys(&self, prefix: &str) -> Vec<String> {
        self.purge_expired();
        self.entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && !entry.value().is_expired())
            .map(|entry| entry.key().clone())
            .collect()
    }
}

#[async_trait]
impl CacheStore for LocalCache {
    async fn get(&self, key: &str) -> Result<Option<Arc<Vec<u8>>>, CacheError> {
        Ok(self.get_live(key))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        self.insert(key, value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.remove(key);
        tracing::debug!(key = %key, "cache invalidated (local)");
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        Ok(self.live_keys(prefix))
    }

    fn mode(&self) -> &'static str {
        "local"
    }
}

/// Shared cache on Redis via a `deadpool-redis` pool.
#[derive(Clone)]
pub struct RedisCache {
    pool: Pool,
}

impl RedisCache {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, CacheError> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))
    }

    /// Value and remaining lifetime of `key`, in one round trip.
    ///
    /// The lifetime is `None` when the key has no expiry.
    async fn get_with_ttl(
        &self,
        key: &str,
    ) -> Result<Option<(Arc<Vec<u8>>, Option<Duration>)>, CacheError> {
        let mut conn = self.conn().await?;
        let (value, pttl): (Option<Vec<u8>>, i64) = redis::pipe()
            .cmd("GET")
            .arg(key)
            .cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Command(format!("GET {key}: {e}")))?;

        // PTTL is -1 without an expiry and -2 once the key is gone
        let remaining = u64::try_from(pttl).ok().map(Duration::from_millis);
        Ok(value.map(|data| (Arc::new(data), remaining)))
    }

    /// Check if Redis is reachable (for readiness checks).
    pub async fn is_available(&self) -> bool {
        self.pool.get().await.is_ok()
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Arc<Vec<u8>>>, CacheError> {
        let mut conn = self.conn().await?;
        let value = conn
            .get::<_, Option<Vec<u8>>>(key)
            .await
            .map_err(|e| CacheError::Command(format!("GET {key}: {e}")))?;
        Ok(value.map(Arc::new))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        // SET EX rejects 0, so sub-second TTLs round up
        let ttl_secs = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, value, ttl_secs)
            .await
            .map_err(|e| CacheError::Command(format!("SET {key}: {e}")))?;
        tracing::debug!(key = %key, ttl_secs, "cache set (redis)");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| CacheError::Command(format!("DEL {key}: {e}")))?;
        tracing::debug!(key = %key, "cache invalidated (redis)");
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn().await?;
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| CacheError::Command(format!("SCAN {pattern}: {e}")))?;

            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may repeat keys across iterations
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    fn mode(&self) -> &'static str {
        "redis"
    }
}

/// L1 [`LocalCache`] in front of L2 [`RedisCache`].
///
/// ## Lookup Order
///
/// 1. Check L1 (DashMap)
/// 2. Check L2 (Redis), promoting a hit into L1
///
/// L1 entries live for at most `local_ttl`, and never longer than the L2
/// entry they were promoted from. A process that misses an invalidation
/// broadcast serves a stale snapshot for no longer than that.
#[derive(Clone)]
pub struct TieredCache {
    local: LocalCache,
    redis: RedisCache,
    local_ttl: Duration,
}

impl TieredCache {
    pub fn new(local: LocalCache, redis: RedisCache, local_ttl: Duration) -> Self {
        Self {
            local,
            redis,
            local_ttl,
        }
    }
}

#[async_trait]
impl CacheStore for TieredCache {
    async fn get(&self, key: &str) -> Result<Option<Arc<Vec<u8>>>, CacheError> {
        if let Some(data) = self.local.get_live(key) {
            tracing::debug!(key = %key, "cache hit (L1)");
            return Ok(Some(data));
        }

        let Some((data, remaining)) = self.redis.get_with_ttl(key).await? else {
            return Ok(None);
        };
        let ttl = remaining.map_or(self.local_ttl, |left| left.min(self.local_ttl));
        tracing::debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "cache hit (L2)");
        if !ttl.is_zero() {
            self.local.insert(key, data.as_ref().clone(), ttl);
        }
        Ok(Some(data))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        self.local.insert(key, value.clone(), ttl.min(self.local_ttl));
        self.redis.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.local.remove(key);
        self.redis.delete(key).await
    }

    /// Falls back to the L1 keys when Redis cannot be scanned, so the caller
    /// can still clear this process's copies.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        let mut keys = match self.redis.scan_prefix(prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(prefix = %prefix, error = %e, "L2 scan failed, listing L1 only");
                Vec::new()
            }
        };
        keys.extend(self.local.live_keys(prefix));
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    fn mode(&self) -> &'static str {
        "tiered"
    }
}
