//! SQLite warehouse for the roomnight pipeline.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. The OLTP source tables, the raw, staging
//! and mart relations, and the run log all live in one database file.

mod encode;
mod loader;
mod materialize;
mod runlog;
mod schema;
mod store;

pub mod error;
pub mod models;

pub use error::{Error, Result};
pub use models::{CalendarRange, catalog};
pub use schema::load_plan;
pub use store::SqliteWarehouse;
