//! PostgreSQL implementation of the FlagStorage trait.

use async_trait::async_trait;
use sqlx_postgres::PgPool;

use flagforge_storage::{AuditLog, Environment, Flag, FlagStorage, FlagValue, NewFlag, StorageError};

use crate::config::PostgresConfig;
use crate::migrations;
use crate::pool;
use crate::queries;

/// PostgreSQL flag store.
#[derive(Debug, Clone)]
pub struct PostgresFlagStorage {
    pool: PgPool,
}

impl PostgresFlagStorage {
    /// Creates a new `PostgresFlagStorage` with the given configuration.
    ///
    /// This will:
    /// 1. Connect, retrying while the database comes up
    /// 2. Run migrations (if configured)
    ///
    /// # Errors
    ///
    /// Returns an error if no connection could be established
    /// or if migrations fail.
    pub async fn new(config: PostgresConfig) -> Result<Self, StorageError> {
        let pool = pool::connect_with_retry(&config).await?;

        if config.run_migrations {
            migrations::run(&pool).await?;
        }

        Ok(Self { pool })
    }

    /// Creates a new `PostgresFlagStorage` from an existing connection pool.
    ///
    /// Migrations are not run automatically when using this constructor.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Registers an environment for a project.
    pub async fn create_environment(&self, env: &Environment) -> Result<(), StorageError> {
        queries::flags::insert_environment(&self.pool, env).await
    }
}

#[async_trait]
impl FlagStorage for PostgresFlagStorage {
    async fn current_snapshot(
        &self,
        project_id: &str,
        environment_key: &str,
    ) -> Result<Vec<FlagValue>, StorageError> {
        queries::flags::current_snapshot(&self.pool, project_id, environment_key).await
    }

    async fn commit_flag(&self, new_flag: &NewFlag) -> Result<Flag, StorageError> {
        queries::flags::commit_flag(&self.pool, new_flag).await
    }

    async fn list_audit_logs(&self, entity_id: &str) -> Result<Vec<AuditLog>, StorageError> {
        queries::audit::list_for_entity(&self.pool, entity_id).await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        pool::test_connection(&self.pool).await.map_err(StorageError::from)
    }
}
