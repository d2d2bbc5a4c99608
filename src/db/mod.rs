//! Database module for the availability log.
//!
//! Provides SQLite storage with an embedded schema.

mod models;
mod store;

pub use models::*;
pub use store::*;
