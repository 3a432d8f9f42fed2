//! SQL query implementations.

pub mod audit;
pub mod flags;
