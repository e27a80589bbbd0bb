//! Database module: batch/item store on SQLite.
//!
//! - `model`: view models and write payloads returned or consumed by repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! Callers import from `mid_onboard::db`; the repository API is re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{BatchSummary, ItemClaim, ItemError, ItemFilter, ItemResult};
