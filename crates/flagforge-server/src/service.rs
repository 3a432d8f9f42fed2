//! Write path: commit a flag, then invalidate the project's snapshots.

use std::sync::Arc;
use std::time::Duration;

use flagforge_storage::{AuditLog, DynStorage, Flag, NewFlag, StorageError};

use crate::cache::InvalidationPublisher;

/// When invalidation runs relative to the write's response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationMode {
    /// Spawned after the commit; the write returns immediately.
    Detached,
    /// Awaited before the write returns.
    Awaited,
}

impl InvalidationMode {
    pub fn from_await_flag(await_before_response: bool) -> Self {
        if await_before_response {
            Self::Awaited
        } else {
            Self::Detached
        }
    }
}

/// Flag writes and audit reads.
#[derive(Clone)]
pub struct FlagService {
    store: DynStorage,
    publisher: Arc<InvalidationPublisher>,
    mode: InvalidationMode,
    operation_timeout: Duration,
}

impl FlagService {
    pub fn new(
        store: DynStorage,
        publisher: Arc<InvalidationPublisher>,
        mode: InvalidationMode,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            store,
            publisher,
            mode,
            operation_timeout,
        }
    }

    /// Commits `new_flag` and invalidates its project.
    ///
    /// Only a store failure fails the call. Invalidation starts strictly after
    /// the commit returns and its outcome never changes the result.
    pub async fn create_flag(&self, new_flag: NewFlag) -> Result<Flag, StorageError> {
        new_flag.validate()?;

        let flag = match tokio::time::timeout(
            self.operation_timeout,
            self.store.commit_flag(&new_flag),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(StorageError::timeout("commit_flag")),
        };

        tracing::info!(
            flag_id = %flag.id,
            project_id = %flag.project_id,
            key = %flag.key,
            "flag created"
        );

        match self.mode {
            InvalidationMode::Awaited => {
                self.publisher.invalidate(&flag.project_id).await;
            }
            InvalidationMode::Detached => {
                let publisher = Arc::clone(&self.publisher);
                let project_id = flag.project_id.clone();
                tokio::spawn(async move {
                    publisher.invalidate(&project_id).await;
                });
            }
        }

        Ok(flag)
    }

    /// Audit history of a flag, newest first.
    pub async fn audit_logs(&self, flag_id: &str) -> Result<Vec<AuditLog>, StorageError> {
        match tokio::time::timeout(self.operation_timeout, self.store.list_audit_logs(flag_id)).await
        {
            Ok(result) => result,
            Err(_) => Err(StorageError::timeout("list_audit_logs")),
        }
    }

    /// Store liveness, bounded by the operation timeout.
    pub async fn ping(&self) -> Result<(), StorageError> {
        match tokio::time::timeout(self.operation_timeout, self.store.ping()).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::timeout("ping")),
        }
    }
}
