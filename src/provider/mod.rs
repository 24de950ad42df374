//! Statistics provider abstraction.
//!
//! The engine never talks to a database directly. Everything it knows about
//! the workload, the index set and the host comes through the
//! [`StatisticsProvider`] trait, and every mutating action goes back through it:
//! - [`PostgresProvider`]: pg_stat_statements, pg_stat_user_indexes, pg_stat_database
//! - [`MockProvider`]: deterministic in-memory fake used by tests and demos
//!
//! The trait is object-safe and designed to be shared as `Arc<dyn StatisticsProvider>`.

pub mod mock;
mod postgres;
mod queries;

pub use mock::MockProvider;
pub use postgres::PostgresProvider;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by a statistics provider.
///
/// All of them are transient from the engine's point of view: a failed
/// capture or check is logged and retried on the next tick.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    /// Connection could not be established or was lost.
    #[error("connection error: {0}")]
    Connection(String),
    /// Query or statement execution failed.
    #[error("query error: {0}")]
    Query(String),
    /// The call exceeded the configured timeout.
    #[error("timed out after {0} ms")]
    Timeout(u64),
    /// The provider cannot perform this operation.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// One raw execution sample for a query text.
///
/// Whether counters are lifetime totals or per-interval deltas depends on the
/// provider; see `EngineConfig::cumulative_statistics`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryStatRecord {
    /// Provider-side query identifier (pg_stat_statements.queryid), if any.
    pub query_id: Option<i64>,
    pub query_text: String,
    pub calls: u64,
    pub total_time_ms: f64,
    pub mean_time_ms: f64,
    pub min_time_ms: f64,
    pub max_time_ms: f64,
    pub rows: u64,
    pub blocks_read: u64,
    pub blocks_hit: u64,
}

/// Index metadata as reported by the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub name: String,
    pub table: String,
    /// Full index definition, e.g. `CREATE INDEX idx ON users USING btree (email)`.
    pub definition: String,
    pub is_primary: bool,
    pub is_unique: bool,
    pub size_bytes: u64,
    /// Cumulative number of index scans.
    pub scan_count: u64,
}

/// Host and database level counters for the health checks.
///
/// Every field is `None` when the provider cannot supply it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub cpu_pct: Option<f64>,
    pub memory_pct: Option<f64>,
    pub disk_pct: Option<f64>,
    pub disk_iops: Option<f64>,
    /// Replication lag in seconds; `None` when no replication is configured.
    pub replication_lag_secs: Option<f64>,
    pub avg_query_time_ms: Option<f64>,
    /// Buffer cache hit ratio, 0..1.
    pub cache_hit_ratio: Option<f64>,
    /// Fraction of rolled back transactions, 0..1.
    pub error_rate: Option<f64>,
    pub active_connections: Option<u64>,
    pub max_connections: Option<u64>,
    pub live_tuples: Option<u64>,
    pub dead_tuples: Option<u64>,
    /// Failed authentication attempts since the previous call.
    pub failed_logins: Option<u64>,
    /// Estimated storage fragmentation, 0..100.
    pub fragmentation_pct: Option<f64>,
}

impl ResourceMetrics {
    /// Connection pool utilization in percent, if both counters are known.
    pub fn connection_utilization_pct(&self) -> Option<f64> {
        match (self.active_connections, self.max_connections) {
            (Some(active), Some(max)) if max > 0 => Some(active as f64 * 100.0 / max as f64),
            _ => None,
        }
    }

    /// Dead tuples as a fraction of all tuples, if both counters are known.
    pub fn dead_tuple_ratio(&self) -> Option<f64> {
        match (self.live_tuples, self.dead_tuples) {
            (Some(live), Some(dead)) if live + dead > 0 => Some(dead as f64 / (live + dead) as f64),
            _ => None,
        }
    }
}

/// Generic maintenance actions used by auto-remediation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceAction {
    /// Reclaim dead tuples and refresh planner statistics.
    Vacuum,
    /// Request a higher connection limit (may need a restart to take effect).
    RaiseConnectionLimit { target: u64 },
    /// Enlarge the buffer cache.
    TuneCache,
}

impl MaintenanceAction {
    pub fn name(&self) -> &'static str {
        match self {
            MaintenanceAction::Vacuum => "vacuum",
            MaintenanceAction::RaiseConnectionLimit { .. } => "raise_connection_limit",
            MaintenanceAction::TuneCache => "tune_cache",
        }
    }
}

/// Source of workload statistics and sink for DDL/maintenance actions.
///
/// Implementations must bound every call by their own timeout and return
/// [`ProviderError::Timeout`] instead of blocking indefinitely.
pub trait StatisticsProvider: Send + Sync {
    /// Returns up to `limit` query statistics rows.
    fn get_query_statistics(&self, limit: usize) -> Result<Vec<QueryStatRecord>, ProviderError>;

    /// Returns metadata for all user indexes.
    fn get_index_metadata(&self) -> Result<Vec<IndexMetadata>, ProviderError>;

    /// Returns current resource counters.
    fn get_resource_metrics(&self) -> Result<ResourceMetrics, ProviderError>;

    /// Executes a DDL statement (index creation or removal).
    fn execute_ddl(&self, statement: &str) -> Result<(), ProviderError>;

    /// Cheap round-trip probe used by the connectivity check.
    fn ping(&self) -> Result<(), ProviderError>;

    /// Runs a maintenance action on behalf of auto-remediation.
    fn run_maintenance(&self, action: &MaintenanceAction) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported(action.name().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_utilization_requires_both_counters() {
        let mut m = ResourceMetrics {
            active_connections: Some(45),
            ..Default::default()
        };
        assert_eq!(m.connection_utilization_pct(), None);
        m.max_connections = Some(50);
        assert_eq!(m.connection_utilization_pct(), Some(90.0));
        m.max_connections = Some(0);
        assert_eq!(m.connection_utilization_pct(), None);
    }

    #[test]
    fn dead_tuple_ratio() {
        let m = ResourceMetrics {
            live_tuples: Some(750),
            dead_tuples: Some(250),
            ..Default::default()
        };
        assert_eq!(m.dead_tuple_ratio(), Some(0.25));
        assert_eq!(ResourceMetrics::default().dead_tuple_ratio(), None);
    }

    #[test]
    fn default_maintenance_is_unsupported() {
        struct Bare;
        impl StatisticsProvider for Bare {
            fn get_query_statistics(&self, _: usize) -> Result<Vec<QueryStatRecord>, ProviderError> {
                Ok(Vec::new())
            }
            fn get_index_metadata(&self) -> Result<Vec<IndexMetadata>, ProviderError> {
                Ok(Vec::new())
            }
            fn get_resource_metrics(&self) -> Result<ResourceMetrics, ProviderError> {
                Ok(ResourceMetrics::default())
            }
            fn execute_ddl(&self, _: &str) -> Result<(), ProviderError> {
                Ok(())
            }
            fn ping(&self) -> Result<(), ProviderError> {
                Ok(())
            }
        }
        let err = Bare.run_maintenance(&MaintenanceAction::Vacuum).unwrap_err();
        assert_eq!(err, ProviderError::Unsupported("vacuum".to_string()));
    }
}
