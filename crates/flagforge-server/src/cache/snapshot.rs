//! Read-through snapshot cache.
//!
//! `fetch` serves a project/environment snapshot from the cache when it can,
//! and otherwise reads the store and repopulates the cache with a fresh tag.
//! Cache faults never fail a read: they come back as [`CacheFault`]s on the
//! result. Only a store failure aborts.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use flagforge_storage::{DynStorage, FlagSnapshot, StorageError};

use super::backend::{CacheError, DynCache, with_timeout};
use super::keys::snapshot_key;

/// Mints a new freshness tag, a weak entity tag around a random UUID.
pub fn mint_tag() -> String {
    format!("W/\"{}\"", uuid::Uuid::new_v4().simple())
}

/// Snapshot and tag stored together, so a tag is never read without its body.
#[derive(Debug, Serialize, Deserialize)]
struct CachedSnapshot {
    tag: String,
    flags: FlagSnapshot,
}

/// Where a fetched snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSource {
    Cache,
    Store,
}

/// A cache problem that was logged and worked around.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheFault {
    #[error("cache read failed: {0}")]
    Read(CacheError),

    #[error("cached snapshot could not be decoded: {0}")]
    Decode(String),

    #[error("snapshot could not be encoded: {0}")]
    Encode(String),

    #[error("cache write failed: {0}")]
    Write(CacheError),
}

impl CacheFault {
    /// Metric label for the fault.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Read(_) => "read",
            Self::Decode(_) => "decode",
            Self::Encode(_) => "encode",
            Self::Write(_) => "write",
        }
    }
}

/// Result of a successful [`SnapshotCache::fetch`].
#[derive(Debug, Clone)]
pub struct FetchedSnapshot {
    pub flags: FlagSnapshot,
    pub tag: String,
    pub source: SnapshotSource,
    /// Faults swallowed along the way; empty on a clean read.
    pub degradations: Vec<CacheFault>,
}

impl FetchedSnapshot {
    pub fn is_hit(&self) -> bool {
        self.source == SnapshotSource::Cache
    }

    pub fn is_degraded(&self) -> bool {
        !self.degradations.is_empty()
    }

    /// Whether a caller-supplied tag still names this content.
    pub fn matches_tag(&self, candidate: &str) -> bool {
        !candidate.is_empty() && candidate == self.tag
    }
}

/// Timing knobs for the snapshot cache.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotCacheSettings {
    /// How long a populated entry is trusted without invalidation.
    pub ttl: Duration,
    /// Deadline for each individual store or cache call.
    pub operation_timeout: Duration,
}

impl Default for SnapshotCacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            operation_timeout: Duration::from_secs(5),
        }
    }
}

/// Cache-aside reader over a [`FlagStorage`](flagforge_storage::FlagStorage).
#[derive(Clone)]
pub struct SnapshotCache {
    store: DynStorage,
    cache: DynCache,
    settings: SnapshotCacheSettings,
}

impl SnapshotCache {
    pub fn new(store: DynStorage, cache: DynCache, settings: SnapshotCacheSettings) -> Self {
        Self {
            store,
            cache,
            settings,
        }
    }

    pub fn cache(&self) -> &DynCache {
        &self.cache
    }

    pub fn settings(&self) -> SnapshotCacheSettings {
        self.settings
    }

    /// Returns the current snapshot and freshness tag for a project/environment pair.
    ///
    /// # Errors
    ///
    /// Fails only when the store query fails or exceeds the operation timeout.
    pub async fn fetch(
        &self,
        project_id: &str,
        environment_key: &str,
    ) -> Result<FetchedSnapshot, StorageError> {
        let key = snapshot_key(project_id, environment_key);
        let limit = self.settings.operation_timeout;
        let mode = self.cache.mode();
        let mut degradations = Vec::new();

        match with_timeout(limit, self.cache.get(&key)).await {
            Ok(Some(bytes)) => match rmp_serde::from_slice::<CachedSnapshot>(&bytes) {
                Ok(cached) => {
                    tracing::debug!(key = %key, "snapshot served from cache");
                    crate::metrics::record_cache_hit(mode);
                    return Ok(FetchedSnapshot {
                        flags: cached.flags,
                        tag: cached.tag,
                        source: SnapshotSource::Cache,
                        degradations,
                    });
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "discarding undecodable cached snapshot");
                    degradations.push(CacheFault::Decode(e.to_string()));
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cache read failed, falling back to store");
                degradations.push(CacheFault::Read(e));
            }
        }

        crate::metrics::record_cache_miss(mode);

        let flags = match tokio::time::timeout(
            limit,
            self.store.current_snapshot(project_id, environment_key),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(StorageError::timeout("current_snapshot")),
        };

        let cached = CachedSnapshot {
            tag: mint_tag(),
            flags,
        };

        match rmp_serde::to_vec_named(&cached) {
            Ok(bytes) => {
                if let Err(e) =
                    with_timeout(limit, self.cache.set(&key, bytes, self.settings.ttl)).await
                {
                    tracing::warn!(key = %key, error = %e, "failed to repopulate snapshot cache");
                    degradations.push(CacheFault::Write(e));
                }
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to encode snapshot for cache");
                degradations.push(CacheFault::Encode(e.to_string()));
            }
        }

        for fault in &degradations {
            crate::metrics::record_cache_degraded(fault.kind());
        }

        tracing::debug!(
            project_id = %project_id,
            environment = %environment_key,
            flags = cached.flags.len(),
            degraded = !degradations.is_empty(),
            "snapshot loaded from store"
        );

        Ok(FetchedSnapshot {
            flags: cached.flags,
            tag: cached.tag,
            source: SnapshotSource::Store,
            degradations,
        })
    }
}
