//! Database module: entity models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: joined rows returned by the pending request queries.
//! - `repo`: SQL-only functions over pods, videos and pending requests.
//!
//! External modules import from `pod_request_scheduler::db`; the repository
//! API is re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::QaduRequestRow;
