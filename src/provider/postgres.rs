//! PostgreSQL statistics provider.
//!
//! Reads the workload from `pg_stat_statements`, indexes from
//! `pg_stat_user_indexes` + `pg_index`, and database counters from
//! `pg_stat_database`. Host CPU and memory come from `/proc` when the
//! engine runs on the database host.
//!
//! Every statement runs under `statement_timeout`, so a stuck call fails with
//! [`ProviderError::Timeout`] instead of blocking the scheduler. Reads share
//! one session; DDL and maintenance each open a short-lived connection so a
//! long `CREATE INDEX CONCURRENTLY` or `VACUUM` never holds the session.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use postgres::error::SqlState;
use postgres::{Client, Config, NoTls};
use tracing::{debug, info, warn};

use super::queries::{
    STATEMENTS_EXTENSION_QUERY, SHARED_BUFFERS_QUERY, build_avg_query_time_query,
    build_connections_query, build_database_counters_query, build_index_metadata_query,
    build_replication_lag_query, build_stat_statements_query, build_table_health_query,
};
use super::{
    IndexMetadata, MaintenanceAction, ProviderError, QueryStatRecord, ResourceMetrics,
    StatisticsProvider,
};

/// DDL and maintenance statements get this multiple of the regular timeout.
const DDL_TIMEOUT_FACTOR: u32 = 30;

/// An open connection and what we learned about the server on connect.
struct Session {
    client: Client,
    server_version_num: Option<i32>,
    statements_available: bool,
}

/// Cumulative counters from the previous metrics call, for deltas.
#[derive(Clone, Copy, Default)]
struct DbCounters {
    xact_commit: i64,
    xact_rollback: i64,
    blks_read: i64,
    blks_hit: i64,
    sessions_fatal: Option<i64>,
}

#[derive(Clone, Copy)]
struct CpuTicks {
    total: u64,
    idle: u64,
}

#[derive(Default)]
struct ConnState {
    session: Option<Session>,
    prev_db: Option<DbCounters>,
    prev_cpu: Option<CpuTicks>,
    last_error: Option<String>,
}

/// PostgreSQL-backed [`StatisticsProvider`].
///
/// Connects using standard environment variables:
/// - PGHOST (default: localhost)
/// - PGPORT (default: 5432)
/// - PGUSER (default: $USER)
/// - PGPASSWORD (default: empty)
/// - PGDATABASE (default: same as PGUSER)
pub struct PostgresProvider {
    connection_string: String,
    timeout: Duration,
    proc_path: String,
    state: Mutex<ConnState>,
}

impl PostgresProvider {
    /// Creates a provider from environment variables.
    pub fn from_env(timeout: Duration) -> Result<Self, ProviderError> {
        let user = std::env::var("PGUSER")
            .or_else(|_| std::env::var("USER"))
            .map_err(|_| ProviderError::Connection("PGUSER or USER not set".to_string()))?;

        let host = std::env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
        let port = std::env::var("PGPORT").unwrap_or_else(|_| "5432".to_string());
        let password = std::env::var("PGPASSWORD").unwrap_or_default();
        let database = std::env::var("PGDATABASE").unwrap_or_else(|_| user.clone());

        let connection_string = if password.is_empty() {
            format!("host={host} port={port} user={user} dbname={database}")
        } else {
            format!("host={host} port={port} user={user} password={password} dbname={database}")
        };

        Ok(Self::with_connection_string(connection_string, timeout))
    }

    /// Creates a provider with an explicit libpq-style connection string.
    pub fn with_connection_string(connection_string: String, timeout: Duration) -> Self {
        Self {
            connection_string,
            timeout,
            proc_path: "/proc".to_string(),
            state: Mutex::new(ConnState::default()),
        }
    }

    /// Overrides the `/proc` mount used for host CPU/memory.
    pub fn with_proc_path(mut self, proc_path: impl Into<String>) -> Self {
        self.proc_path = proc_path.into();
        self
    }

    /// Attempts to connect; useful as a startup check.
    pub fn try_connect(&self) -> Result<(), ProviderError> {
        let mut state = self.lock()?;
        self.ensure_connected(&mut state).map(|_| ())
    }

    /// Returns the last error message, if any.
    pub fn last_error(&self) -> Option<String> {
        self.state.lock().ok().and_then(|s| s.last_error.clone())
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }

    fn lock(&self) -> Result<MutexGuard<'_, ConnState>, ProviderError> {
        self.state
            .lock()
            .map_err(|_| ProviderError::Connection("provider state poisoned".to_string()))
    }

    /// Connection settings with the given `statement_timeout`.
    fn config(&self, statement_timeout_ms: u64) -> Result<Config, ProviderError> {
        let mut config: Config = self
            .connection_string
            .parse()
            .map_err(|e: postgres::Error| ProviderError::Connection(format_postgres_error(&e)))?;
        config.connect_timeout(self.timeout);
        config.options(&format!("-c statement_timeout={statement_timeout_ms}"));
        Ok(config)
    }

    fn ensure_connected<'a>(&self, state: &'a mut ConnState) -> Result<&'a mut Session, ProviderError> {
        if state.session.is_none() {
            let config = self.config(self.timeout_ms())?;
            match config.connect(NoTls) {
                Ok(mut client) => {
                    let server_version_num = client
                        .query_one("SHOW server_version_num", &[])
                        .ok()
                        .and_then(|row| row.try_get::<_, String>(0).ok())
                        .and_then(|v| v.parse::<i32>().ok());
                    let statements_available = matches!(
                        client.query_opt(STATEMENTS_EXTENSION_QUERY, &[]),
                        Ok(Some(_))
                    );
                    if !statements_available {
                        warn!("pg_stat_statements extension is not installed; query statistics disabled");
                    }
                    info!(server_version_num = ?server_version_num, "connected to PostgreSQL");
                    state.prev_db = None;
                    state.last_error = None;
                    state.session = Some(Session {
                        client,
                        server_version_num,
                        statements_available,
                    });
                }
                Err(e) => {
                    let msg = format_postgres_error(&e);
                    state.last_error = Some(msg.clone());
                    return Err(ProviderError::Connection(msg));
                }
            }
        }
        state
            .session
            .as_mut()
            .ok_or_else(|| ProviderError::Connection("not connected".to_string()))
    }

    /// Runs `op` on a live session. Drops the session if the connection broke.
    fn run<T>(
        &self,
        op: impl FnOnce(&mut Session) -> Result<T, postgres::Error>,
    ) -> Result<T, ProviderError> {
        let mut state = self.lock()?;
        let session = self.ensure_connected(&mut state)?;
        match op(session) {
            Ok(v) => Ok(v),
            Err(e) => {
                let err = self.map_error(&e);
                let closed = session.client.is_closed();
                state.last_error = Some(err.to_string());
                if closed {
                    debug!("connection closed, will reconnect on next call");
                    state.session = None;
                }
                Err(err)
            }
        }
    }

    fn map_error(&self, e: &postgres::Error) -> ProviderError {
        map_postgres_error(e, self.timeout_ms())
    }

    /// Executes a utility statement on a dedicated connection with the
    /// extended DDL timeout. The shared session stays free for reads.
    fn execute_long(&self, statement: &str) -> Result<(), ProviderError> {
        let ddl_ms = self.timeout_ms().saturating_mul(u64::from(DDL_TIMEOUT_FACTOR));
        let mut client = self
            .config(ddl_ms)?
            .connect(NoTls)
            .map_err(|e| ProviderError::Connection(format_postgres_error(&e)))?;
        client
            .batch_execute(statement)
            .map_err(|e| map_postgres_error(&e, ddl_ms))
    }

    fn host_metrics(&self, prev_cpu: Option<CpuTicks>) -> (Option<f64>, Option<f64>, Option<CpuTicks>) {
        let cpu_now = std::fs::read_to_string(format!("{}/stat", self.proc_path))
            .ok()
            .and_then(|s| parse_cpu_ticks(&s));
        let cpu_pct = match (prev_cpu, cpu_now) {
            (Some(prev), Some(now)) => cpu_usage_pct(prev, now),
            _ => None,
        };
        let mem_pct = std::fs::read_to_string(format!("{}/meminfo", self.proc_path))
            .ok()
            .and_then(|s| parse_memory_used_pct(&s));
        (cpu_pct, mem_pct, cpu_now)
    }
}

impl StatisticsProvider for PostgresProvider {
    fn get_query_statistics(&self, limit: usize) -> Result<Vec<QueryStatRecord>, ProviderError> {
        self.run(|session| {
            if !session.statements_available {
                return Ok(Vec::new());
            }
            let query = build_stat_statements_query(session.server_version_num);
            let rows = session.client.query(&query, &[&(limit as i64)])?;
            Ok(rows
                .iter()
                .map(|row| QueryStatRecord {
                    query_id: row.try_get("queryid").ok(),
                    query_text: row.try_get("query").unwrap_or_default(),
                    calls: row.try_get::<_, i64>("calls").unwrap_or(0).max(0) as u64,
                    total_time_ms: row.try_get("total_time").unwrap_or(0.0),
                    mean_time_ms: row.try_get("mean_time").unwrap_or(0.0),
                    min_time_ms: row.try_get("min_time").unwrap_or(0.0),
                    max_time_ms: row.try_get("max_time").unwrap_or(0.0),
                    rows: row.try_get::<_, i64>("rows").unwrap_or(0).max(0) as u64,
                    blocks_read: row.try_get::<_, i64>("blks_read").unwrap_or(0).max(0) as u64,
                    blocks_hit: row.try_get::<_, i64>("blks_hit").unwrap_or(0).max(0) as u64,
                })
                .collect())
        })
    }

    fn get_index_metadata(&self) -> Result<Vec<IndexMetadata>, ProviderError> {
        self.run(|session| {
            let rows = session.client.query(build_index_metadata_query(), &[])?;
            Ok(rows
                .iter()
                .map(|row| IndexMetadata {
                    name: row.try_get("index_name").unwrap_or_default(),
                    table: row.try_get("table_name").unwrap_or_default(),
                    definition: row.try_get("definition").unwrap_or_default(),
                    is_primary: row.try_get("is_primary").unwrap_or(false),
                    is_unique: row.try_get("is_unique").unwrap_or(false),
                    size_bytes: row.try_get::<_, i64>("size_bytes").unwrap_or(0).max(0) as u64,
                    scan_count: row.try_get::<_, i64>("idx_scan").unwrap_or(0).max(0) as u64,
                })
                .collect())
        })
    }

    fn get_resource_metrics(&self) -> Result<ResourceMetrics, ProviderError> {
        let prev = self.lock()?.prev_db;

        let (counters, connections, tables, avg_ms, lag) = self.run(|session| {
            let version = session.server_version_num;
            let db = session
                .client
                .query_opt(&build_database_counters_query(version), &[])?
                .map(|row| DbCounters {
                    xact_commit: row.try_get("xact_commit").unwrap_or(0),
                    xact_rollback: row.try_get("xact_rollback").unwrap_or(0),
                    blks_read: row.try_get("blks_read").unwrap_or(0),
                    blks_hit: row.try_get("blks_hit").unwrap_or(0),
                    sessions_fatal: row
                        .try_get::<_, Option<i64>>("sessions_fatal")
                        .ok()
                        .flatten(),
                });
            let conn = session.client.query_one(build_connections_query(), &[])?;
            let connections = (
                conn.try_get::<_, i64>("active").unwrap_or(0).max(0) as u64,
                conn.try_get::<_, i64>("max_connections").unwrap_or(0).max(0) as u64,
            );
            let t = session.client.query_one(build_table_health_query(), &[])?;
            let tables = (
                t.try_get::<_, i64>("live").unwrap_or(0).max(0) as u64,
                t.try_get::<_, i64>("dead").unwrap_or(0).max(0) as u64,
                t.try_get::<_, i64>("pages").unwrap_or(0).max(0) as u64,
                t.try_get::<_, i64>("all_visible").unwrap_or(0).max(0) as u64,
            );
            let avg_ms = if session.statements_available {
                session
                    .client
                    .query_one(&build_avg_query_time_query(version), &[])?
                    .try_get::<_, Option<f64>>("avg_ms")
                    .ok()
                    .flatten()
            } else {
                None
            };
            let lag = session
                .client
                .query_one(build_replication_lag_query(), &[])?
                .try_get::<_, Option<f64>>("lag_secs")
                .ok()
                .flatten();
            Ok((db, connections, tables, avg_ms, lag))
        })?;

        let mut state = self.lock()?;
        let (cpu_pct, memory_pct, cpu_now) = self.host_metrics(state.prev_cpu);
        state.prev_cpu = cpu_now;
        state.prev_db = counters;

        let mut metrics = ResourceMetrics {
            cpu_pct,
            memory_pct,
            replication_lag_secs: lag,
            avg_query_time_ms: avg_ms,
            active_connections: Some(connections.0),
            max_connections: Some(connections.1),
            live_tuples: Some(tables.0),
            dead_tuples: Some(tables.1),
            fragmentation_pct: (tables.2 > 0)
                .then(|| (1.0 - tables.3 as f64 / tables.2 as f64).clamp(0.0, 1.0) * 100.0),
            ..Default::default()
        };

        if let Some(curr) = counters {
            let base = prev.unwrap_or_default();
            let commits = (curr.xact_commit - base.xact_commit).max(0);
            let rollbacks = (curr.xact_rollback - base.xact_rollback).max(0);
            if commits + rollbacks > 0 {
                metrics.error_rate = Some(rollbacks as f64 / (commits + rollbacks) as f64);
            }
            let reads = (curr.blks_read - base.blks_read).max(0);
            let hits = (curr.blks_hit - base.blks_hit).max(0);
            if reads + hits > 0 {
                metrics.cache_hit_ratio = Some(hits as f64 / (reads + hits) as f64);
            }
            metrics.failed_logins = match (curr.sessions_fatal, prev.and_then(|p| p.sessions_fatal)) {
                (Some(now), Some(before)) => Some((now - before).max(0) as u64),
                (Some(_), None) => Some(0),
                _ => None,
            };
        }

        Ok(metrics)
    }

    fn execute_ddl(&self, statement: &str) -> Result<(), ProviderError> {
        info!(statement, "executing DDL");
        self.execute_long(statement)
    }

    fn ping(&self) -> Result<(), ProviderError> {
        self.run(|session| session.client.simple_query("SELECT 1").map(|_| ()))
    }

    fn run_maintenance(&self, action: &MaintenanceAction) -> Result<(), ProviderError> {
        match action {
            MaintenanceAction::Vacuum => self.execute_long("VACUUM (ANALYZE)"),
            MaintenanceAction::RaiseConnectionLimit { target } => {
                self.execute_long(&format!("ALTER SYSTEM SET max_connections = {target}"))?;
                self.execute_long("SELECT pg_reload_conf()")
            }
            MaintenanceAction::TuneCache => {
                let pages: i64 = self.run(|session| {
                    session
                        .client
                        .query_one(SHARED_BUFFERS_QUERY, &[])
                        .and_then(|row| row.try_get(0))
                })?;
                let target_kb = shared_buffers_target_kb(pages);
                self.execute_long(&format!("ALTER SYSTEM SET shared_buffers = '{target_kb}kB'"))?;
                self.execute_long("SELECT pg_reload_conf()")
            }
        }
    }
}

/// Doubled `shared_buffers` in kB. The setting is reported in 8 kB pages.
fn shared_buffers_target_kb(pages: i64) -> i64 {
    pages.max(0).saturating_mul(2).saturating_mul(8)
}

/// Parses aggregate `cpu` line of `/proc/stat`.
fn parse_cpu_ticks(stat: &str) -> Option<CpuTicks> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if values.len() < 4 {
        return None;
    }
    // user nice system idle iowait irq softirq steal
    let total = values.iter().take(8).sum();
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some(CpuTicks { total, idle })
}

fn cpu_usage_pct(prev: CpuTicks, now: CpuTicks) -> Option<f64> {
    let dt = now.total.saturating_sub(prev.total);
    if dt == 0 {
        return None;
    }
    let idle = now.idle.saturating_sub(prev.idle);
    Some((1.0 - idle as f64 / dt as f64).clamp(0.0, 1.0) * 100.0)
}

/// Memory used % from `/proc/meminfo` (1 - MemAvailable / MemTotal).
fn parse_memory_used_pct(meminfo: &str) -> Option<f64> {
    let field = |name: &str| -> Option<u64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total == 0 {
        return None;
    }
    Some((1.0 - available as f64 / total as f64) * 100.0)
}

/// Formats PostgreSQL error message for display.
fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!("{}: {}", db_error.severity(), db_error.message())
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if msg.contains("password authentication failed") {
            "password authentication failed".to_string()
        } else {
            msg
        }
    }
}

fn map_postgres_error(e: &postgres::Error, timeout_ms: u64) -> ProviderError {
    if e.code() == Some(&SqlState::QUERY_CANCELED) {
        ProviderError::Timeout(timeout_ms)
    } else if e.as_db_error().is_some() {
        ProviderError::Query(format_postgres_error(e))
    } else {
        ProviderError::Connection(format_postgres_error(e))
    }
}
