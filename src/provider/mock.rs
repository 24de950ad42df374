//! Deterministic in-memory statistics provider.
//!
//! `MockProvider` serves canned query statistics, index metadata and resource
//! metrics, and records every DDL statement and maintenance action it is asked
//! to run. Tests and demos use it instead of a live database.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{
    IndexMetadata, MaintenanceAction, ProviderError, QueryStatRecord, ResourceMetrics,
    StatisticsProvider,
};

#[derive(Debug, Default)]
struct MockState {
    query_stats: Vec<QueryStatRecord>,
    indexes: Vec<IndexMetadata>,
    metrics: ResourceMetrics,
    unreachable: bool,
    ping_delay: Duration,
    read_error: Option<ProviderError>,
    /// Statements containing any of these substrings fail.
    failing_ddl: HashSet<String>,
    fail_maintenance: bool,
    executed_ddl: Vec<String>,
    maintenance: Vec<MaintenanceAction>,
    /// Number of `get_query_statistics` calls served in cumulative mode.
    polls: u64,
}

/// In-memory [`StatisticsProvider`].
///
/// In cumulative mode every `get_query_statistics` call returns the configured
/// records multiplied by the number of calls so far, the way
/// `pg_stat_statements` counters grow under a steady workload.
#[derive(Debug, Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
    cumulative: bool,
}

impl MockProvider {
    /// Creates an empty provider: no queries, no indexes, no metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Switches query statistics to growing lifetime counters.
    pub fn with_cumulative_counters(mut self) -> Self {
        self.cumulative = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_query_statistics(&self, records: Vec<QueryStatRecord>) {
        let mut state = self.lock();
        state.query_stats = records;
        state.polls = 0;
    }

    pub fn push_query_statistic(&self, record: QueryStatRecord) {
        self.lock().query_stats.push(record);
    }

    pub fn set_index_metadata(&self, indexes: Vec<IndexMetadata>) {
        self.lock().indexes = indexes;
    }

    pub fn add_index(&self, index: IndexMetadata) {
        self.lock().indexes.push(index);
    }

    /// Sets the scan counter of an existing index.
    pub fn set_index_scans(&self, name: &str, scans: u64) {
        if let Some(idx) = self.lock().indexes.iter_mut().find(|i| i.name == name) {
            idx.scan_count = scans;
        }
    }

    pub fn set_resource_metrics(&self, metrics: ResourceMetrics) {
        self.lock().metrics = metrics;
    }

    /// Makes `ping` and every read fail with a connection error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Makes every `ping` take at least `delay`.
    pub fn set_ping_delay(&self, delay: Duration) {
        self.lock().ping_delay = delay;
    }

    /// Makes reads (not `ping`) fail with `error`.
    pub fn set_read_error(&self, error: Option<ProviderError>) {
        self.lock().read_error = error;
    }

    /// DDL statements containing `pattern` will fail.
    pub fn fail_ddl_matching(&self, pattern: impl Into<String>) {
        self.lock().failing_ddl.insert(pattern.into());
    }

    pub fn set_fail_maintenance(&self, fail: bool) {
        self.lock().fail_maintenance = fail;
    }

    /// All DDL statements executed so far, in order.
    pub fn executed_ddl(&self) -> Vec<String> {
        self.lock().executed_ddl.clone()
    }

    /// All maintenance actions executed so far, in order.
    pub fn maintenance_log(&self) -> Vec<MaintenanceAction> {
        self.lock().maintenance.clone()
    }

    fn check_read(state: &MockState) -> Result<(), ProviderError> {
        if state.unreachable {
            return Err(ProviderError::Connection("connection refused".to_string()));
        }
        match &state.read_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// A steady OLTP workload on users/orders/sessions with a healthy host.
    pub fn typical_workload() -> Self {
        let provider = Self::new();
        provider.set_query_statistics(vec![
            stat(
                1,
                "SELECT * FROM users WHERE email = 'alice@example.com'",
                5_000,
                120.0,
                5_000,
                200,
            ),
            stat(
                2,
                "SELECT id, total FROM orders WHERE user_id = 42 ORDER BY created_at DESC LIMIT 10",
                20_000,
                15.0,
                200_000,
                50,
            ),
            stat(
                3,
                "UPDATE sessions SET last_seen = now() WHERE token = $1",
                80_000,
                0.8,
                80_000,
                0,
            ),
            stat(4, "SELECT count(*) FROM events", 10, 2_500.0, 10, 40_000),
            stat(
                5,
                "SELECT * FROM products WHERE name LIKE '%phone%'",
                300,
                1_800.0,
                1_500_000,
                90_000,
            ),
        ]);
        provider.set_index_metadata(vec![
            index("users_pkey", "users", "id", true, 2_097_152, 900_000),
            index("idx_users_created_at", "users", "created_at", false, 1_048_576, 1_200),
            index("orders_pkey", "orders", "id", true, 8_388_608, 2_000_000),
            index("idx_orders_user_id", "orders", "user_id", false, 4_194_304, 150_000),
            index("orders_user_id_idx", "orders", "user_id", false, 4_194_304, 12),
            index("sessions_pkey", "sessions", "id", true, 524_288, 10_000),
        ]);
        provider.set_resource_metrics(ResourceMetrics {
            cpu_pct: Some(35.0),
            memory_pct: Some(60.0),
            disk_pct: Some(55.0),
            disk_iops: Some(850.0),
            replication_lag_secs: None,
            avg_query_time_ms: Some(45.0),
            cache_hit_ratio: Some(0.98),
            error_rate: Some(0.01),
            active_connections: Some(40),
            max_connections: Some(100),
            live_tuples: Some(1_000_000),
            dead_tuples: Some(20_000),
            failed_logins: Some(0),
            fragmentation_pct: Some(12.0),
        });
        provider
    }

    /// The typical workload on a host that is out of headroom on every axis.
    pub fn overloaded() -> Self {
        let provider = Self::typical_workload();
        provider.set_resource_metrics(ResourceMetrics {
            cpu_pct: Some(97.0),
            memory_pct: Some(96.0),
            disk_pct: Some(92.0),
            disk_iops: Some(12_000.0),
            replication_lag_secs: Some(75.0),
            avg_query_time_ms: Some(2_500.0),
            cache_hit_ratio: Some(0.7),
            error_rate: Some(0.12),
            active_connections: Some(98),
            max_connections: Some(100),
            live_tuples: Some(200_000),
            dead_tuples: Some(150_000),
            failed_logins: Some(60),
            fragmentation_pct: Some(55.0),
        });
        provider
    }
}

impl StatisticsProvider for MockProvider {
    fn get_query_statistics(&self, limit: usize) -> Result<Vec<QueryStatRecord>, ProviderError> {
        let mut state = self.lock();
        Self::check_read(&state)?;
        if !self.cumulative {
            return Ok(state.query_stats.iter().take(limit).cloned().collect());
        }
        state.polls += 1;
        let n = state.polls;
        Ok(state
            .query_stats
            .iter()
            .take(limit)
            .map(|r| QueryStatRecord {
                calls: r.calls * n,
                total_time_ms: r.total_time_ms * n as f64,
                rows: r.rows * n,
                blocks_read: r.blocks_read * n,
                blocks_hit: r.blocks_hit * n,
                ..r.clone()
            })
            .collect())
    }

    fn get_index_metadata(&self) -> Result<Vec<IndexMetadata>, ProviderError> {
        let state = self.lock();
        Self::check_read(&state)?;
        Ok(state.indexes.clone())
    }

    fn get_resource_metrics(&self) -> Result<ResourceMetrics, ProviderError> {
        let state = self.lock();
        Self::check_read(&state)?;
        Ok(state.metrics.clone())
    }

    fn execute_ddl(&self, statement: &str) -> Result<(), ProviderError> {
        let mut state = self.lock();
        if state.unreachable {
            return Err(ProviderError::Connection("connection refused".to_string()));
        }
        if let Some(p) = state.failing_ddl.iter().find(|p| statement.contains(p.as_str())) {
            return Err(ProviderError::Query(format!("ERROR: statement rejected ({p})")));
        }
        state.executed_ddl.push(statement.to_string());
        apply_ddl(&mut state.indexes, statement);
        Ok(())
    }

    fn ping(&self) -> Result<(), ProviderError> {
        let (unreachable, delay) = {
            let state = self.lock();
            (state.unreachable, state.ping_delay)
        };
        if unreachable {
            return Err(ProviderError::Connection("connection refused".to_string()));
        }
        std::thread::sleep(delay);
        Ok(())
    }

    fn run_maintenance(&self, action: &MaintenanceAction) -> Result<(), ProviderError> {
        let mut state = self.lock();
        if state.fail_maintenance {
            return Err(ProviderError::Query(format!("{} failed", action.name())));
        }
        state.maintenance.push(action.clone());
        Ok(())
    }
}

/// Mirrors `CREATE INDEX ... name ON table (cols)` / `DROP INDEX ... name`
/// into the index list so a later discovery pass sees the change.
fn apply_ddl(indexes: &mut Vec<IndexMetadata>, statement: &str) {
    let words: Vec<&str> = statement.split_whitespace().collect();
    let upper: Vec<String> = words.iter().map(|w| w.to_ascii_uppercase()).collect();

    if upper.first().map(String::as_str) == Some("DROP") {
        if let Some(name) = words.last() {
            let name = name.trim_end_matches(';');
            indexes.retain(|i| i.name != name);
        }
        return;
    }

    let Some(on) = upper.iter().position(|w| w == "ON") else {
        return;
    };
    let (Some(name), Some(table)) = (words.get(on.wrapping_sub(1)), words.get(on + 1)) else {
        return;
    };
    if indexes.iter().any(|i| i.name == *name) {
        return;
    }
    let columns = statement
        .find('(')
        .zip(statement.rfind(')'))
        .filter(|(a, b)| a < b)
        .map(|(a, b)| statement[a + 1..b].to_string())
        .unwrap_or_default();
    indexes.push(IndexMetadata {
        name: name.to_string(),
        table: table.to_string(),
        definition: format!("CREATE INDEX {name} ON {table} USING btree ({columns})"),
        ..Default::default()
    });
}

fn stat(
    id: i64,
    text: &str,
    calls: u64,
    mean_ms: f64,
    rows: u64,
    blocks_read: u64,
) -> QueryStatRecord {
    QueryStatRecord {
        query_id: Some(id),
        query_text: text.to_string(),
        calls,
        total_time_ms: calls as f64 * mean_ms,
        mean_time_ms: mean_ms,
        min_time_ms: mean_ms * 0.5,
        max_time_ms: mean_ms * 4.0,
        rows,
        blocks_read,
        blocks_hit: blocks_read * 20,
    }
}

fn index(
    name: &str,
    table: &str,
    columns: &str,
    is_primary: bool,
    size_bytes: u64,
    scan_count: u64,
) -> IndexMetadata {
    let kind = if is_primary { "UNIQUE INDEX" } else { "INDEX" };
    IndexMetadata {
        name: name.to_string(),
        table: table.to_string(),
        definition: format!("CREATE {kind} {name} ON public.{table} USING btree ({columns})"),
        is_primary,
        is_unique: is_primary,
        size_bytes,
        scan_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cumulative_mode_grows_counters() {
        let provider = MockProvider::typical_workload().with_cumulative_counters();
        let first = provider.get_query_statistics(10).unwrap();
        let second = provider.get_query_statistics(10).unwrap();
        assert_eq!(first[0].calls, 5_000);
        assert_eq!(second[0].calls, 10_000);
        assert_eq!(second[0].mean_time_ms, first[0].mean_time_ms);
    }

    #[test]
    fn limit_is_respected() {
        let provider = MockProvider::typical_workload();
        assert_eq!(provider.get_query_statistics(2).unwrap().len(), 2);
    }

    #[test]
    fn unreachable_fails_reads_and_ping() {
        let provider = MockProvider::typical_workload();
        provider.set_unreachable(true);
        assert!(provider.ping().is_err());
        assert!(matches!(
            provider.get_resource_metrics(),
            Err(ProviderError::Connection(_))
        ));
    }

    #[test]
    fn ddl_is_recorded_and_mirrored() {
        let provider = MockProvider::new();
        provider
            .execute_ddl("CREATE INDEX CONCURRENTLY IF NOT EXISTS idx_a ON users (email)")
            .unwrap();
        let indexes = provider.get_index_metadata().unwrap();
        assert_eq!(indexes.len(), 1);
        assert_eq!(indexes[0].table, "users");
        assert!(indexes[0].definition.ends_with("(email)"));

        provider.execute_ddl("DROP INDEX CONCURRENTLY IF EXISTS idx_a").unwrap();
        assert!(provider.get_index_metadata().unwrap().is_empty());
        assert_eq!(provider.executed_ddl().len(), 2);
    }

    #[test]
    fn failing_ddl_is_not_recorded() {
        let provider = MockProvider::new();
        provider.fail_ddl_matching("orders");
        assert!(provider.execute_ddl("DROP INDEX orders_idx").is_err());
        assert!(provider.executed_ddl().is_empty());
    }

    #[test]
    fn maintenance_log() {
        let provider = MockProvider::new();
        provider.run_maintenance(&MaintenanceAction::Vacuum).unwrap();
        provider.set_fail_maintenance(true);
        assert!(provider.run_maintenance(&MaintenanceAction::TuneCache).is_err());
        assert_eq!(provider.maintenance_log(), vec![MaintenanceAction::Vacuum]);
    }
}
