//! SQL query builders for PostgreSQL statistics views.

/// Builds version-aware query for pg_stat_statements.
///
/// PostgreSQL 13 renamed `total_time`/`mean_time`/... to `*_exec_time`.
pub(super) fn build_stat_statements_query(server_version_num: Option<i32>) -> String {
    let v = server_version_num.unwrap_or(0);
    let (total_expr, mean_expr, min_expr, max_expr) = if v >= 130000 {
        (
            "s.total_exec_time",
            "s.mean_exec_time",
            "s.min_exec_time",
            "s.max_exec_time",
        )
    } else {
        ("s.total_time", "s.mean_time", "s.min_time", "s.max_time")
    };

    format!(
        r#"
            SELECT
                s.queryid::bigint as queryid,
                COALESCE(s.query, '') as query,
                s.calls::bigint as calls,
                {total_expr}::double precision as total_time,
                {mean_expr}::double precision as mean_time,
                {min_expr}::double precision as min_time,
                {max_expr}::double precision as max_time,
                s.rows::bigint as rows,
                s.shared_blks_read::bigint as blks_read,
                s.shared_blks_hit::bigint as blks_hit
            FROM pg_stat_statements s
            JOIN pg_database d ON d.oid = s.dbid
            WHERE d.datname = current_database()
            ORDER BY {total_expr} DESC
            LIMIT $1
        "#
    )
}

pub(super) const STATEMENTS_EXTENSION_QUERY: &str =
    "SELECT extversion FROM pg_extension WHERE extname = 'pg_stat_statements'";

/// Index metadata with scan counters and on-disk size.
pub(super) fn build_index_metadata_query() -> &'static str {
    r#"
        SELECT
            i.indexrelname as index_name,
            CASE WHEN i.schemaname = 'public' THEN i.relname
                 ELSE i.schemaname || '.' || i.relname END as table_name,
            pg_get_indexdef(i.indexrelid) as definition,
            x.indisprimary as is_primary,
            x.indisunique as is_unique,
            COALESCE(pg_relation_size(i.indexrelid), 0)::bigint as size_bytes,
            COALESCE(i.idx_scan, 0)::bigint as idx_scan
        FROM pg_stat_user_indexes i
        JOIN pg_index x ON x.indexrelid = i.indexrelid
        ORDER BY i.relname, i.indexrelname
    "#
}

/// Builds version-aware query for current-database counters.
///
/// `sessions_fatal` (PostgreSQL 14+) is used as the failed-login counter.
pub(super) fn build_database_counters_query(server_version_num: Option<i32>) -> String {
    let sessions_fatal_expr = if server_version_num.unwrap_or(0) >= 140000 {
        "COALESCE(sessions_fatal, 0)::bigint"
    } else {
        "NULL::bigint"
    };

    format!(
        r#"
            SELECT
                COALESCE(xact_commit, 0)::bigint as xact_commit,
                COALESCE(xact_rollback, 0)::bigint as xact_rollback,
                COALESCE(blks_read, 0)::bigint as blks_read,
                COALESCE(blks_hit, 0)::bigint as blks_hit,
                {sessions_fatal_expr} as sessions_fatal
            FROM pg_stat_database
            WHERE datname = current_database()
        "#
    )
}

pub(super) fn build_connections_query() -> &'static str {
    r#"
        SELECT
            (SELECT count(*) FROM pg_stat_activity WHERE backend_type = 'client backend')::bigint
                as active,
            current_setting('max_connections')::bigint as max_connections
    "#
}

/// Live/dead tuples and all-visible page share over user tables.
pub(super) fn build_table_health_query() -> &'static str {
    r#"
        SELECT
            COALESCE(sum(t.n_live_tup), 0)::bigint as live,
            COALESCE(sum(t.n_dead_tup), 0)::bigint as dead,
            COALESCE(sum(c.relpages), 0)::bigint as pages,
            COALESCE(sum(c.relallvisible), 0)::bigint as all_visible
        FROM pg_stat_user_tables t
        JOIN pg_class c ON c.oid = t.relid
    "#
}

/// Average statement time across pg_stat_statements for the current database.
pub(super) fn build_avg_query_time_query(server_version_num: Option<i32>) -> String {
    let total_expr = if server_version_num.unwrap_or(0) >= 130000 {
        "total_exec_time"
    } else {
        "total_time"
    };
    format!(
        r#"
            SELECT
                CASE WHEN sum(s.calls) > 0
                     THEN (sum(s.{total_expr}) / sum(s.calls))::double precision
                     ELSE NULL END as avg_ms
            FROM pg_stat_statements s
            JOIN pg_database d ON d.oid = s.dbid
            WHERE d.datname = current_database()
        "#
    )
}

/// Replay lag on a standby, max replica lag on a primary. NULL if neither.
pub(super) fn build_replication_lag_query() -> &'static str {
    r#"
        SELECT CASE
            WHEN pg_is_in_recovery()
                THEN EXTRACT(EPOCH FROM (now() - pg_last_xact_replay_timestamp()))::double precision
            ELSE (SELECT max(EXTRACT(EPOCH FROM replay_lag))::double precision
                  FROM pg_stat_replication)
        END as lag_secs
    "#
}

pub(super) const SHARED_BUFFERS_QUERY: &str =
    "SELECT setting::bigint FROM pg_settings WHERE name = 'shared_buffers'";
