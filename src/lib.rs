//! pgwarden - PostgreSQL workload analysis, index advice and health monitoring.
//!
//! The library is shared by the `pgwardend` daemon and any outer admin API:
//! - [`analysis`] folds statement statistics into per-pattern profiles and reports
//! - [`optimizer`] keeps the index catalog and index recommendations
//! - [`health`] grades the database on eight axes and remediates
//! - [`engine`] wires them to a [`provider::StatisticsProvider`] on schedules

pub mod analysis;
pub mod config;
pub mod engine;
pub mod health;
pub mod optimizer;
pub mod provider;
pub mod scheduler;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
