//! Cache key scheme for flag snapshots.
//!
//! Keys look like `flags:{project}:{environment}` with both components
//! percent-encoded. Encoding removes `:` and glob metacharacters from the
//! components, so the scan prefix of one project can never match keys that
//! belong to another.

use urlencoding::encode;

/// Namespace shared by every snapshot key.
pub const KEY_NAMESPACE: &str = "flags";

/// Key under which the snapshot for a project/environment pair is cached.
pub fn snapshot_key(project_id: &str, environment_key: &str) -> String {
    format!(
        "{KEY_NAMESPACE}:{}:{}",
        encode(project_id),
        encode(environment_key)
    )
}

/// Prefix matching every snapshot key of a project, across all environments.
pub fn project_prefix(project_id: &str) -> String {
    format!("{KEY_NAMESPACE}:{}:", encode(project_id))
}
