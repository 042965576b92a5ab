//! Database module for Sitewatch.
//!
//! Provides SQLite storage for sites, monitors and check history.

mod history;
mod models;
mod store;

pub use history::*;
pub use models::*;
pub use store::*;
