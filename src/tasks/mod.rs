//! Background Tasks Module
//!
//! Periodic maintenance over every cache in a registry.
//!
//! # Tasks
//! - TTL Cleanup: purges expired local entries at configured intervals
//! - Stats Report: logs each cache's counters

mod cleanup;
mod stats_report;

pub use cleanup::spawn_cleanup_task;
pub use stats_report::spawn_stats_reporter;
