//! Data layer module
//!
//! Handles all data persistence:
//! - Time-ordered entity IDs
//! - SQLite database operations
//! - Models for actors, statuses, relationships and delivery requests

mod database;
mod id;
mod models;

pub use database::{Database, is_unique_violation};
pub use models::*;
