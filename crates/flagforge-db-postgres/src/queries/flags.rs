//! Flag snapshot and flag commit queries.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use sqlx_core::query_scalar::query_scalar;
use sqlx_postgres::{PgPool, PgTransaction};

use flagforge_storage::{AuditLog, DEFAULT_ROLLOUT, Environment, Flag, FlagValue, NewFlag, StorageError};

use crate::error::{PG_FOREIGN_KEY_VIOLATION, PG_UNIQUE_VIOLATION, has_pg_error_code, query_error};

type FlagValueRow = (
    String,
    String,
    String,
    String,
    Value,
    i32,
    Value,
    DateTime<Utc>,
    String,
);

/// Latest version per flag, then ordered by key. `COLLATE "C"` keeps both
/// the key order and the version-id tie-break bytewise and locale-independent.
const CURRENT_SNAPSHOT_SQL: &str = r#"
SELECT cur.flag_id, cur.environment_id, cur.key, cur.type, cur.value_json,
       cur.rollout, cur.rules_json, cur.created_at, cur.created_by
FROM (
    SELECT DISTINCT ON (f.id)
        f.id AS flag_id, fv.environment_id, f.key, f.type, fv.value_json,
        fv.rollout, fv.rules_json, fv.created_at, fv.created_by
    FROM flags f
    JOIN flag_versions fv ON fv.flag_id = f.id
    JOIN environments e ON e.id = fv.environment_id
    WHERE f.project_id = $1 AND e.project_id = $1 AND e.key = $2
    ORDER BY f.id, fv.created_at DESC, fv.id COLLATE "C" ASC
) cur
ORDER BY cur.key COLLATE "C", cur.flag_id COLLATE "C"
"#;

/// Reads the current snapshot for a project/environment pair.
pub async fn current_snapshot(
    pool: &PgPool,
    project_id: &str,
    environment_key: &str,
) -> Result<Vec<FlagValue>, StorageError> {
    let rows: Vec<FlagValueRow> = query_as(CURRENT_SNAPSHOT_SQL)
        .bind(project_id)
        .bind(environment_key)
        .fetch_all(pool)
        .await
        .map_err(|e| query_error("current_snapshot", e))?;

    Ok(rows
        .into_iter()
        .map(
            |(flag_id, environment_id, key, flag_type, value_json, rollout, rules_json, updated_at, updated_by)| {
                FlagValue {
                    flag_id,
                    environment_id,
                    key,
                    flag_type,
                    value_json,
                    rollout,
                    rules_json,
                    updated_at,
                    updated_by,
                }
            },
        )
        .collect())
}

/// Inserts a flag, its seed versions and an audit row in one transaction.
pub async fn commit_flag(pool: &PgPool, new_flag: &NewFlag) -> Result<Flag, StorageError> {
    new_flag.validate()?;
    let flag = &new_flag.flag;

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| StorageError::transaction_error(format!("Failed to begin transaction: {e}")))?;

    ensure_environments(&mut tx, new_flag).await?;
    insert_flag(&mut tx, flag).await?;

    for (environment_id, value) in &new_flag.values {
        query(
            r#"INSERT INTO flag_versions
                   (id, flag_id, environment_id, value_json, rollout, rules_json, created_at, created_by)
               VALUES ($1, $2, $3, $4, $5, '{}'::jsonb, $6, $7)"#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&flag.id)
        .bind(environment_id)
        .bind(value)
        .bind(DEFAULT_ROLLOUT)
        .bind(flag.created_at)
        .bind(&flag.created_by)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if has_pg_error_code(&e, PG_FOREIGN_KEY_VIOLATION) {
                StorageError::invalid_input(format!("unknown environment: {environment_id}"))
            } else {
                query_error("insert flag_version", e)
            }
        })?;
    }

    let audit = AuditLog::flag_created(flag, &new_flag.values);
    super::audit::insert_with_tx(&mut tx, &audit).await?;

    tx.commit()
        .await
        .map_err(|e| StorageError::transaction_error(format!("Failed to commit transaction: {e}")))?;

    tracing::debug!(
        flag_id = %flag.id,
        project_id = %flag.project_id,
        key = %flag.key,
        environments = new_flag.values.len(),
        "flag committed"
    );

    Ok(flag.clone())
}

async fn insert_flag(tx: &mut PgTransaction<'static>, flag: &Flag) -> Result<(), StorageError> {
    query(
        r#"INSERT INTO flags (id, project_id, key, type, description, created_by, created_at)
           VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
    )
    .bind(&flag.id)
    .bind(&flag.project_id)
    .bind(&flag.key)
    .bind(&flag.flag_type)
    .bind(&flag.description)
    .bind(&flag.created_by)
    .bind(flag.created_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        if has_pg_error_code(&e, PG_UNIQUE_VIOLATION) {
            StorageError::already_exists("flag", format!("{}/{}", flag.project_id, flag.key))
        } else {
            query_error("insert flag", e)
        }
    })?;
    Ok(())
}

/// Every seed environment must exist and belong to the flag's project.
async fn ensure_environments(
    tx: &mut PgTransaction<'static>,
    new_flag: &NewFlag,
) -> Result<(), StorageError> {
    let ids: Vec<String> = new_flag.values.keys().cloned().collect();
    let known: Vec<String> =
        query_scalar("SELECT id FROM environments WHERE project_id = $1 AND id = ANY($2)")
            .bind(&new_flag.flag.project_id)
            .bind(&ids)
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| query_error("check environments", e))?;

    if let Some(missing) = ids.iter().find(|id| !known.contains(id)) {
        return Err(StorageError::invalid_input(format!(
            "unknown environment: {missing}"
        )));
    }
    Ok(())
}

/// Registers an environment.
pub async fn insert_environment(pool: &PgPool, env: &Environment) -> Result<(), StorageError> {
    query("INSERT INTO environments (id, project_id, key) VALUES ($1, $2, $3)")
        .bind(&env.id)
        .bind(&env.project_id)
        .bind(&env.key)
        .execute(pool)
        .await
        .map_err(|e| {
            if has_pg_error_code(&e, PG_UNIQUE_VIOLATION) {
                StorageError::already_exists("environment", format!("{}/{}", env.project_id, env.key))
            } else {
                query_error("insert environment", e)
            }
        })?;
    Ok(())
}
