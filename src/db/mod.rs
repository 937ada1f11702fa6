//! Database module.
//!
//! SQLite storage for services, checks, metric buckets, incidents and
//! subscribers, with embedded migrations.

mod models;
mod store;

pub use models::*;
pub use store::*;
