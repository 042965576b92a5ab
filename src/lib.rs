//! Sitewatch - endpoint health monitoring.
//!
//! Runs periodic HTTP and TCP port checks per monitor, keeps a bounded
//! history of results in SQLite and derives monitor and site status from it.

pub mod config;
pub mod db;
pub mod probe;
pub mod scheduler;
pub mod service;
pub mod status;
