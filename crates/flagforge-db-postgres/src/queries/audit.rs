//! Audit log queries.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use sqlx_postgres::{PgPool, PgTransaction};

use flagforge_storage::{AUDIT_LOG_LIMIT, AuditLog, StorageError};

use crate::error::query_error;

type AuditRow = (String, String, String, String, String, String, Value, DateTime<Utc>);

/// Lists audit rows for an entity, newest first.
pub async fn list_for_entity(pool: &PgPool, entity_id: &str) -> Result<Vec<AuditLog>, StorageError> {
    let rows: Vec<AuditRow> = query_as(
        r#"SELECT id, actor_id, org_id, entity_type, entity_id, action, diff_json, ts
           FROM audit_logs
           WHERE entity_id = $1
           ORDER BY ts DESC
           LIMIT $2"#,
    )
    .bind(entity_id)
    .bind(AUDIT_LOG_LIMIT as i64)
    .fetch_all(pool)
    .await
    .map_err(|e| query_error("list audit logs", e))?;

    Ok(rows
        .into_iter()
        .map(
            |(id, actor_id, org_id, entity_type, entity_id, action, diff_json, ts)| AuditLog {
                id,
                actor_id,
                org_id,
                entity_type,
                entity_id,
                action,
                diff_json,
                ts,
            },
        )
        .collect())
}

/// Writes an audit row inside an open transaction.
pub async fn insert_with_tx(
    tx: &mut PgTransaction<'static>,
    log: &AuditLog,
) -> Result<(), StorageError> {
    query(
        r#"INSERT INTO audit_logs (id, actor_id, org_id, entity_type, entity_id, action, diff_json, ts)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
    )
    .bind(&log.id)
    .bind(&log.actor_id)
    .bind(&log.org_id)
    .bind(&log.entity_type)
    .bind(&log.entity_id)
    .bind(&log.action)
    .bind(&log.diff_json)
    .bind(log.ts)
    .execute(&mut **tx)
    .await
    .map_err(|e| query_error("insert audit log", e))?;
    Ok(())
}
