//! The authoritative store contract.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::types::{AuditLog, Flag, FlagValue, NewFlag};

/// The durable source of truth for flags and flag versions.
///
/// Implementations must be thread-safe (`Send + Sync`); the cache layer calls
/// them concurrently from many request tasks without any coordination.
///
/// # Example
///
/// ```ignore
/// use flagforge_storage::{FlagStorage, StorageError};
///
/// async fn keys(store: &dyn FlagStorage) -> Result<Vec<String>, StorageError> {
///     let flags = store.current_snapshot("proj1", "prod").await?;
///     Ok(flags.into_iter().map(|f| f.key).collect())
/// }
/// ```
#[async_trait]
pub trait FlagStorage: Send + Sync {
    /// Returns the current value of every flag in a project for the
    /// environment with the given key, ordered by flag key ascending.
    ///
    /// The current value is the version with the greatest creation time;
    /// exact timestamp collisions resolve to the lowest version id.
    /// An unknown project or environment yields an empty snapshot.
    async fn current_snapshot(
        &self,
        project_id: &str,
        environment_key: &str,
    ) -> Result<Vec<FlagValue>, StorageError>;

    /// Inserts a flag, one seed version per environment and an audit row,
    /// all in a single transaction.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidInput` for empty value maps or unknown
    /// environment ids, and `StorageError::AlreadyExists` when the project
    /// already has a flag with the same key. Nothing is persisted on error.
    async fn commit_flag(&self, new_flag: &NewFlag) -> Result<Flag, StorageError>;

    /// Lists audit rows for an entity, newest first, at most 100.
    async fn list_audit_logs(&self, entity_id: &str) -> Result<Vec<AuditLog>, StorageError>;

    /// Cheap liveness probe used by readiness checks.
    async fn ping(&self) -> Result<(), StorageError>;
}
