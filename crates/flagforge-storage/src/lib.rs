//! # flagforge-storage
//!
//! Authoritative store abstraction for the FlagForge flag service.
//!
//! This crate defines the types and the [`FlagStorage`] trait that every
//! store backend implements. Implementations live in separate crates
//! (`flagforge-db-postgres`, `flagforge-db-memory`).
//!
//! ## Data model
//!
//! - [`Flag`]: immutable identity and declaration (project, key, type)
//! - [`FlagVersion`]: append-only value per (flag, environment)
//! - [`FlagValue`]: the current version of a flag as served to readers
//! - [`AuditLog`]: change history rows

mod error;
mod traits;
mod types;

pub use error::{ErrorCategory, StorageError};
pub use traits::FlagStorage;
pub use types::{
    AuditLog, DEFAULT_ROLLOUT, Environment, Flag, FlagSnapshot, FlagValue, FlagVersion, NewFlag,
    SYSTEM_ACTOR,
};

/// Type alias for a shared storage trait object.
pub type DynStorage = std::sync::Arc<dyn FlagStorage>;

/// Maximum number of audit rows returned by [`FlagStorage::list_audit_logs`].
pub const AUDIT_LOG_LIMIT: usize = 100;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use flagforge_storage::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{ErrorCategory, StorageError};
    pub use crate::traits::FlagStorage;
    pub use crate::types::{AuditLog, Environment, Flag, FlagSnapshot, FlagValue, FlagVersion, NewFlag};
    pub use crate::DynStorage;
}
