//! Database module for the probing agent.
//!
//! Provides SQLite storage for the durable node identity record.

mod models;
mod store;

pub use models::*;
pub use store::*;
