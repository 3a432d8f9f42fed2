//! Domain types shared by every store backend and by the cache layer.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StorageError;

/// Rollout percentage given to every seed version.
pub const DEFAULT_ROLLOUT: i32 = 100;

/// Actor recorded when no authenticated user is attached to a write.
pub const SYSTEM_ACTOR: &str = "system";

/// A feature flag definition. Immutable once committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flag {
    pub id: String,
    pub project_id: String,
    pub key: String,
    #[serde(rename = "type")]
    pub flag_type: String,
    pub description: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// One point-in-time value of a flag in one environment.
///
/// Versions are append-only; the current one is the row with the greatest
/// `created_at` for its `(flag_id, environment_id)` pair, lowest `id` on ties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagVersion {
    pub id: String,
    pub flag_id: String,
    pub environment_id: String,
    pub value_json: Value,
    pub rollout: i32,
    pub rules_json: Value,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

/// The current value of a flag in an environment, as served to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagValue {
    pub flag_id: String,
    pub environment_id: String,
    pub key: String,
    #[serde(rename = "type")]
    pub flag_type: String,
    pub value_json: Value,
    pub rollout: i32,
    pub rules_json: Value,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
}

/// Every current flag value for one project/environment pair, ordered by key.
pub type FlagSnapshot = Vec<FlagValue>;

/// A deployment environment belonging to a project (e.g. `prod`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub id: String,
    pub project_id: String,
    pub key: String,
}

/// A flag plus its seed value per environment, committed atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFlag {
    pub flag: Flag,
    /// Seed values keyed by environment id.
    pub values: BTreeMap<String, Value>,
}

impl NewFlag {
    /// Starts a new flag with a fresh id, created now by the system actor.
    pub fn new(
        project_id: impl Into<String>,
        key: impl Into<String>,
        flag_type: impl Into<String>,
    ) -> Self {
        Self {
            flag: Flag {
                id: uuid::Uuid::new_v4().to_string(),
                project_id: project_id.into(),
                key: key.into(),
                flag_type: flag_type.into(),
                description: String::new(),
                created_by: SYSTEM_ACTOR.to_string(),
                created_at: Utc::now(),
            },
            values: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.flag.description = description.into();
        self
    }

    #[must_use]
    pub fn with_created_by(mut self, actor: impl Into<String>) -> Self {
        self.flag.created_by = actor.into();
        self
    }

    /// Adds the seed value for one environment.
    #[must_use]
    pub fn with_value(mut self, environment_id: impl Into<String>, value: Value) -> Self {
        self.values.insert(environment_id.into(), value);
        self
    }

    /// Checks the invariants every backend relies on before opening a transaction.
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.flag.project_id.trim().is_empty() {
            return Err(StorageError::invalid_input("project_id cannot be empty"));
        }
        if self.flag.key.trim().is_empty() {
            return Err(StorageError::invalid_input("key cannot be empty"));
        }
        if self.flag.flag_type.trim().is_empty() {
            return Err(StorageError::invalid_input("type cannot be empty"));
        }
        if self.values.is_empty() {
            return Err(StorageError::invalid_input("values cannot be empty"));
        }
        if self.values.keys().any(|env| env.trim().is_empty()) {
            return Err(StorageError::invalid_input("environment id cannot be empty"));
        }
        Ok(())
    }
}

/// A change record for an entity in the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: String,
    pub actor_id: String,
    pub org_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub diff_json: Value,
    pub ts: DateTime<Utc>,
}

impl AuditLog {
    /// Audit row written alongside a flag commit.
    pub fn flag_created(flag: &Flag, values: &BTreeMap<String, Value>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            actor_id: flag.created_by.clone(),
            org_id: String::new(),
            entity_type: "flag".to_string(),
            entity_id: flag.id.clone(),
            action: "flag.created".to_string(),
            diff_json: serde_json::json!({
                "key": flag.key,
                "type": flag.flag_type,
                "values": values,
            }),
            ts: flag.created_at,
        }
    }
}
