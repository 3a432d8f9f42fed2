//! In-memory flag store for development mode and tests.
//!
//! Mirrors the PostgreSQL backend's semantics: atomic commits, derived
//! "current" versions with a deterministic tie-break, key-ordered snapshots.

mod storage;

pub use storage::InMemoryFlagStorage;
