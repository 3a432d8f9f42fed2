//! Invalidation publisher.
//!
//! Called after a write commits: deletes every cached snapshot of the
//! project, then broadcasts the project id. Everything here is best-effort;
//! the outcome is reported, never raised.

use std::time::Duration;

use super::backend::{CacheError, DynCache, with_timeout};
use super::keys::project_prefix;
use super::pubsub::{BusError, DynBus};

/// What an invalidation managed to do.
#[derive(Debug, Clone, Default)]
pub struct InvalidationReport {
    pub project_id: String,
    pub keys_deleted: Vec<String>,
    pub delete_failures: Vec<(String, CacheError)>,
    /// Set when the key scan failed, in which case nothing was deleted.
    pub scan_failure: Option<CacheError>,
    /// Set when the broadcast could not be published.
    pub publish_failure: Option<BusError>,
}

impl InvalidationReport {
    pub fn published(&self) -> bool {
        self.publish_failure.is_none()
    }

    /// True when every step succeeded.
    pub fn is_clean(&self) -> bool {
        self.delete_failures.is_empty() && self.scan_failure.is_none() && self.published()
    }
}

/// Deletes a project's cached snapshots and broadcasts the change.
#[derive(Clone)]
pub struct InvalidationPublisher {
    cache: DynCache,
    bus: DynBus,
    operation_timeout: Duration,
}

impl InvalidationPublisher {
    pub fn new(cache: DynCache, bus: DynBus, operation_timeout: Duration) -> Self {
        Self {
            cache,
            bus,
            operation_timeout,
        }
    }

    /// Invalidates every snapshot of `project_id`, across all environments.
    ///
    /// Must only be called once the triggering write has committed.
    pub async fn invalidate(&self, project_id: &str) -> InvalidationReport {
        let limit = self.operation_timeout;
        let prefix = project_prefix(project_id);
        let mut report = InvalidationReport {
            project_id: project_id.to_string(),
            ..Default::default()
        };

        match with_timeout(limit, self.cache.scan_prefix(&prefix)).await {
            Ok(keys) => {
                for key in keys {
                    match with_timeout(limit, self.cache.delete(&key)).await {
                        Ok(()) => report.keys_deleted.push(key),
                        Err(e) => {
                            tracing::warn!(key = %key, error = %e, "failed to delete cached snapshot");
                            report.delete_failures.push((key, e));
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(project_id = %project_id, error = %e, "failed to scan cached snapshots");
                report.scan_failure = Some(e);
            }
        }

        let published = match tokio::time::timeout(limit, self.bus.publish(project_id)).await {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout(limit)),
        };
        if let Err(e) = published {
            tracing::warn!(project_id = %project_id, error = %e, "failed to publish invalidation");
            report.publish_failure = Some(e);
        }
        crate::metrics::record_invalidation_published(report.published());

        tracing::debug!(
            project_id = %project_id,
            deleted = report.keys_deleted.len(),
            clean = report.is_clean(),
            "invalidation finished"
        );

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::{CacheStore, LocalCache};
    use crate::cache::pubsub::{InvalidationBus, LocalBus};
    use futures_util::StreamExt;
    use std::sync::Arc;

    #[tokio::test]
    async fn deletes_all_environments_then_publishes() {
        let local = LocalCache::new();
        let ttl = Duration::from_secs(60);
        for key in ["flags:proj1:prod", "flags:proj1:dev", "flags:proj2:prod"] {
            local.set(key, Vec::new(), ttl).await.unwrap();
        }
        let bus = LocalBus::default();
        let mut sub = bus.subscribe().await.unwrap();

        let publisher = InvalidationPublisher::new(
            Arc::new(local.clone()),
            Arc::new(bus),
            Duration::from_secs(1),
        );
        let report = publisher.invalidate("proj1").await;

        assert!(report.is_clean());
        assert_eq!(report.keys_deleted.len(), 2);
        assert!(!local.contains("flags:proj1:prod"));
        assert!(!local.contains("flags:proj1:dev"));
        assert!(local.contains("flags:proj2:prod"));
        assert_eq!(sub.next().await.unwrap().unwrap(), "proj1");
    }

    #[tokio::test]
    async fn nothing_cached_still_publishes() {
        let bus = LocalBus::default();
        let mut sub = bus.subscribe().await.unwrap();
        let publisher = InvalidationPublisher::new(
            Arc::new(LocalCache::new()),
            Arc::new(bus),
            Duration::from_secs(1),
        );

        let report = publisher.invalidate("proj1").await;
        assert!(report.keys_deleted.is_empty());
        assert!(report.published());
        assert_eq!(sub.next().await.unwrap().unwrap(), "proj1");
    }
}
