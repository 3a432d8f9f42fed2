use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use flagforge_storage::{
    AUDIT_LOG_LIMIT, AuditLog, DEFAULT_ROLLOUT, Environment, Flag, FlagStorage, FlagValue,
    FlagVersion, NewFlag, StorageError,
};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct State {
    environments: HashMap<String, Environment>,
    flags: HashMap<String, Flag>,
    versions: Vec<FlagVersion>,
    audit_logs: Vec<AuditLog>,
}

/// In-memory flag store.
///
/// All tables sit behind a single lock so a commit is all-or-nothing.
/// Clones share the same underlying state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFlagStorage {
    state: Arc<RwLock<State>>,
    snapshot_queries: Arc<AtomicU64>,
}

impl InMemoryFlagStorage {
    /// Creates an empty store with no environments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an environment at construction time.
    #[must_use]
    pub fn with_environment(
        self,
        project_id: impl Into<String>,
        environment_id: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        let env = Environment {
            id: environment_id.into(),
            project_id: project_id.into(),
            key: key.into(),
        };
        // Construction happens before the store is shared, so the lock is free.
        if let Ok(mut state) = self.state.try_write() {
            state.environments.insert(env.id.clone(), env);
        }
        self
    }

    /// Registers an environment on a store that may already be shared.
    pub async fn add_environment(&self, env: Environment) {
        let mut state = self.state.write().await;
        state.environments.insert(env.id.clone(), env);
    }

    /// Appends a version to an existing flag, as an update would.
    pub async fn append_version(&self, version: FlagVersion) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        if !state.flags.contains_key(&version.flag_id) {
            return Err(StorageError::not_found("flag", &version.flag_id));
        }
        if !state.environments.contains_key(&version.environment_id) {
            return Err(StorageError::invalid_input(format!(
                "unknown environment: {}",
                version.environment_id
            )));
        }
        state.versions.push(version);
        Ok(())
    }

    /// Number of snapshot queries served so far.
    pub fn snapshot_queries(&self) -> u64 {
        self.snapshot_queries.load(Ordering::SeqCst)
    }
}

/// Newest first; equal timestamps resolve to the lowest version id.
fn version_precedence(a: &FlagVersion, b: &FlagVersion) -> CmpOrdering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| b.id.cmp(&a.id))
}

#[async_trait]
impl FlagStorage for InMemoryFlagStorage {
    async fn current_snapshot(
        &self,
        project_id: &str,
        environment_key: &str,
    ) -> Result<Vec<FlagValue>, StorageError> {
        self.snapshot_queries.fetch_add(1, Ordering::SeqCst);
        let state = self.state.read().await;

        let Some(env) = state
            .environments
            .values()
            .find(|e| e.project_id == project_id && e.key == environment_key)
        else {
            return Ok(Vec::new());
        };

        let mut values: Vec<FlagValue> = state
            .flags
            .values()
            .filter(|f| f.project_id == project_id)
            .filter_map(|flag| {
                let current = state
                    .versions
                    .iter()
                    .filter(|v| v.flag_id == flag.id && v.environment_id == env.id)
                    .max_by(|a, b| version_precedence(a, b))?;
                Some(FlagValue {
                    flag_id: flag.id.clone(),
                    environment_id: current.environment_id.clone(),
                    key: flag.key.clone(),
                    flag_type: flag.flag_type.clone(),
                    value_json: current.value_json.clone(),
                    rollout: current.rollout,
                    rules_json: current.rules_json.clone(),
                    updated_at: current.created_at,
                    updated_by: current.created_by.clone(),
                })
            })
            .collect();

        values.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.flag_id.cmp(&b.flag_id)));
        Ok(values)
    }

    async fn commit_flag(&self, new_flag: &NewFlag) -> Result<Flag, StorageError> {
        new_flag.validate()?;
        let flag = &new_flag.flag;

        let mut state = self.state.write().await;

        if state
            .flags
            .values()
            .any(|f| f.project_id == flag.project_id && f.key == flag.key)
        {
            return Err(StorageError::already_exists(
                "flag",
                format!("{}/{}", flag.project_id, flag.key),
            ));
        }
        if state.flags.contains_key(&flag.id) {
            return Err(StorageError::already_exists("flag", &flag.id));
        }
        for env_id in new_flag.values.keys() {
            match state.environments.get(env_id) {
                Some(env) if env.project_id == flag.project_id => {}
                _ => {
                    return Err(StorageError::invalid_input(format!(
                        "unknown environment: {env_id}"
                    )));
                }
            }
        }

        // Validation passed; nothing below can fail.
        state.flags.insert(flag.id.clone(), flag.clone());
        for (env_id, value) in &new_flag.values {
            state.versions.push(FlagVersion {
                id: uuid::Uuid::new_v4().to_string(),
                flag_id: flag.id.clone(),
                environment_id: env_id.clone(),
                value_json: value.clone(),
                rollout: DEFAULT_ROLLOUT,
                rules_json: serde_json::json!({}),
                created_at: flag.created_at,
                created_by: flag.created_by.clone(),
            });
        }
        state
            .audit_logs
            .push(AuditLog::flag_created(flag, &new_flag.values));

        tracing::debug!(
            flag_id = %flag.id,
            project_id = %flag.project_id,
            key = %flag.key,
            environments = new_flag.values.len(),
            "flag committed (memory)"
        );

        Ok(flag.clone())
    }

    async fn list_audit_logs(&self, entity_id: &str) -> Result<Vec<AuditLog>, StorageError> {
        let state = self.state.read().await;
        let mut logs: Vec<AuditLog> = state
            .audit_logs
            .iter()
            .filter(|log| log.entity_id == entity_id)
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.ts.cmp(&a.ts));
        logs.truncate(AUDIT_LOG_LIMIT);
        Ok(logs)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn store() -> InMemoryFlagStorage {
        InMemoryFlagStorage::new()
            .with_environment("proj1", "env-prod", "prod")
            .with_environment("proj1", "env-dev", "dev")
            .with_environment("proj2", "env-prod-2", "prod")
    }

    #[tokio::test]
    async fn commit_then_snapshot() {
        let store = store();
        let flag = store
            .commit_flag(
                &NewFlag::new("proj1", "dark_mode", "boolean")
                    .with_value("env-prod", json!(true))
                    .with_value("env-dev", json!(false)),
            )
            .await
            .unwrap();

        let prod = store.current_snapshot("proj1", "prod").await.unwrap();
        assert_eq!(prod.len(), 1);
        assert_eq!(prod[0].flag_id, flag.id);
        assert_eq!(prod[0].key, "dark_mode");
        assert_eq!(prod[0].value_json, json!(true));
        assert_eq!(prod[0].rollout, DEFAULT_ROLLOUT);
        assert_eq!(prod[0].rules_json, json!({}));

        let dev = store.current_snapshot("proj1", "dev").await.unwrap();
        assert_eq!(dev[0].value_json, json!(false));

        assert!(store.current_snapshot("proj2", "prod").await.unwrap().is_empty());
        assert!(store.current_snapshot("nope", "prod").await.unwrap().is_empty());
        assert_eq!(store.snapshot_queries(), 4);
    }

    #[tokio::test]
    async fn snapshot_is_ordered_by_key() {
        let store = store();
        for key in ["zeta", "alpha", "mid"] {
            store
                .commit_flag(&NewFlag::new("proj1", key, "boolean").with_value("env-prod", json!(1)))
                .await
                .unwrap();
        }
        let keys: Vec<_> = store
            .current_snapshot("proj1", "prod")
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.key)
            .collect();
        assert_eq!(keys, vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn latest_version_wins_and_ties_pick_lowest_id() {
        let store = store();
        let flag = store
            .commit_flag(&NewFlag::new("proj1", "limit", "number").with_value("env-prod", json!(1)))
            .await
            .unwrap();

        let later = flag.created_at + Duration::seconds(10);
        for (id, value) in [("b-version", 3), ("a-version", 2)] {
            store
                .append_version(FlagVersion {
                    id: id.into(),
                    flag_id: flag.id.clone(),
                    environment_id: "env-prod".into(),
                    value_json: json!(value),
                    rollout: 50,
                    rules_json: json!({}),
                    created_at: later,
                    created_by: "bob".into(),
                })
                .await
                .unwrap();
        }

        let snapshot = store.current_snapshot("proj1", "prod").await.unwrap();
        assert_eq!(snapshot[0].value_json, json!(2));
        assert_eq!(snapshot[0].rollout, 50);
        assert_eq!(snapshot[0].updated_by, "bob");
    }

    #[tokio::test]
    async fn failed_commit_persists_nothing() {
        let store = store();
        let err = store
            .commit_flag(
                &NewFlag::new("proj1", "dark_mode", "boolean")
                    .with_value("env-prod", json!(true))
                    .with_value("env-missing", json!(true)),
            )
            .await
            .unwrap_err();
        assert!(err.is_invalid_input());
        assert!(store.current_snapshot("proj1", "prod").await.unwrap().is_empty());

        // Environment of another project is rejected too.
        let err = store
            .commit_flag(&NewFlag::new("proj1", "x", "boolean").with_value("env-prod-2", json!(1)))
            .await
            .unwrap_err();
        assert!(err.is_invalid_input());
    }

    #[tokio::test]
    async fn duplicate_key_is_rejected() {
        let store = store();
        let new_flag = NewFlag::new("proj1", "dark_mode", "boolean").with_value("env-prod", json!(true));
        store.commit_flag(&new_flag).await.unwrap();

        let again = NewFlag::new("proj1", "dark_mode", "boolean").with_value("env-prod", json!(false));
        assert!(store.commit_flag(&again).await.unwrap_err().is_already_exists());

        // Same key in another project is fine.
        let other = NewFlag::new("proj2", "dark_mode", "boolean").with_value("env-prod-2", json!(false));
        assert!(store.commit_flag(&other).await.is_ok());
    }

    #[tokio::test]
    async fn audit_logs_are_newest_first() {
        let store = store();
        let flag = store
            .commit_flag(&NewFlag::new("proj1", "dark_mode", "boolean").with_value("env-prod", json!(true)))
            .await
            .unwrap();

        let logs = store.list_audit_logs(&flag.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].action, "flag.created");
        assert!(logs[0].ts <= Utc::now());
        assert!(store.list_audit_logs("unknown").await.unwrap().is_empty());
    }
}
