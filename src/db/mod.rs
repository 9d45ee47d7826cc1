//! Database module: view models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: slices returned by repository queries for a specific caller.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! Callers import from `tgcloud_scanner::db`; the repository API is
//! re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::ResolvedAccount;
