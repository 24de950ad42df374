//! The eight health checks.
//!
//! Checks are pure: they grade data already fetched by the monitor (one ping,
//! one metrics call per pass). A metric the provider did not supply makes the
//! affected axis `Unknown` rather than healthy.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::HealthSettings;
use crate::provider::{ProviderError, ResourceMetrics};

/// Dead tuple ratio (percent) thresholds.
pub const DEAD_TUPLE_WARNING_PCT: f64 = 20.0;
pub const DEAD_TUPLE_CRITICAL_PCT: f64 = 50.0;
/// Failed logins per check interval.
pub const FAILED_LOGINS_WARNING: f64 = 10.0;
pub const FAILED_LOGINS_CRITICAL: f64 = 50.0;
/// Replication lag in seconds.
pub const REPLICATION_LAG_WARNING_SECS: f64 = 10.0;
pub const REPLICATION_LAG_CRITICAL_SECS: f64 = 60.0;
/// Storage fragmentation percent.
pub const FRAGMENTATION_WARNING_PCT: f64 = 30.0;
pub const FRAGMENTATION_CRITICAL_PCT: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    Connectivity,
    Performance,
    Resources,
    Connections,
    Integrity,
    Security,
    Replication,
    Storage,
}

impl Axis {
    pub fn as_str(&self) -> &'static str {
        match self {
            Axis::Connectivity => "connectivity",
            Axis::Performance => "performance",
            Axis::Resources => "resources",
            Axis::Connections => "connections",
            Axis::Integrity => "integrity",
            Axis::Security => "security",
            Axis::Replication => "replication",
            Axis::Storage => "storage",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Unknown,
}

impl HealthStatus {
    /// Severity rank used for "worst of": unknown sorts below healthy.
    fn rank(self) -> u8 {
        match self {
            HealthStatus::Unknown => 0,
            HealthStatus::Healthy => 1,
            HealthStatus::Warning => 2,
            HealthStatus::Critical => 3,
        }
    }

    pub fn worst(self, other: HealthStatus) -> HealthStatus {
        if other.rank() > self.rank() { other } else { self }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
            HealthStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub axis: Axis,
    pub status: HealthStatus,
    pub message: String,
    pub metrics: BTreeMap<String, f64>,
}

impl HealthCheckResult {
    pub fn new(axis: Axis, status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            axis,
            status,
            message: message.into(),
            metrics: BTreeMap::new(),
        }
    }

    fn metric(mut self, name: &str, value: f64) -> Self {
        self.metrics.insert(name.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CheckError {
    #[error("probe failed: {0}")]
    Probe(ProviderError),
    #[error("metrics unavailable: {0}")]
    Metrics(ProviderError),
}

/// Data gathered once per pass and shared by all checks.
pub struct CheckContext<'a> {
    pub ping: &'a Result<Duration, ProviderError>,
    pub metrics: &'a Result<ResourceMetrics, ProviderError>,
    pub settings: &'a HealthSettings,
}

impl CheckContext<'_> {
    fn metrics(&self) -> Result<&ResourceMetrics, CheckError> {
        self.metrics
            .as_ref()
            .map_err(|e| CheckError::Metrics(e.clone()))
    }
}

pub trait HealthCheck: Send + Sync {
    fn axis(&self) -> Axis;
    fn evaluate(&self, ctx: &CheckContext) -> Result<HealthCheckResult, CheckError>;
}

pub fn all_checks() -> Vec<Box<dyn HealthCheck>> {
    vec![
        Box::new(ConnectivityCheck),
        Box::new(PerformanceCheck),
        Box::new(ResourcesCheck),
        Box::new(ConnectionsCheck),
        Box::new(IntegrityCheck),
        Box::new(SecurityCheck),
        Box::new(ReplicationCheck),
        Box::new(StorageCheck),
    ]
}

/// Grades a value where higher is worse. Critical overrides warning.
pub fn grade(value: f64, warning: f64, critical: f64) -> HealthStatus {
    if value >= critical {
        HealthStatus::Critical
    } else if value >= warning {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    }
}

/// Grades a value where lower is worse.
pub fn grade_below(value: f64, warning: f64, critical: f64) -> HealthStatus {
    if value < critical {
        HealthStatus::Critical
    } else if value < warning {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    }
}

/// Accumulates graded components into one axis result.
struct Findings {
    axis: Axis,
    status: HealthStatus,
    problems: Vec<String>,
    metrics: BTreeMap<String, f64>,
}

impl Findings {
    fn new(axis: Axis) -> Self {
        Self {
            axis,
            status: HealthStatus::Unknown,
            problems: Vec::new(),
            metrics: BTreeMap::new(),
        }
    }

    fn add(&mut self, name: &str, value: f64, status: HealthStatus, problem: impl FnOnce() -> String) {
        self.metrics.insert(name.to_string(), value);
        self.status = self.status.worst(status);
        if matches!(status, HealthStatus::Warning | HealthStatus::Critical) {
            self.problems.push(problem());
        }
    }

    fn finish(self, ok: &str, no_data: &str) -> HealthCheckResult {
        let message = match self.status {
            HealthStatus::Unknown => no_data.to_string(),
            HealthStatus::Healthy => ok.to_string(),
            _ => self.problems.join("; "),
        };
        HealthCheckResult {
            axis: self.axis,
            status: self.status,
            message,
            metrics: self.metrics,
        }
    }
}

// ============================================================
// Connectivity
// ============================================================

pub struct ConnectivityCheck;

impl HealthCheck for ConnectivityCheck {
    fn axis(&self) -> Axis {
        Axis::Connectivity
    }

    fn evaluate(&self, ctx: &CheckContext) -> Result<HealthCheckResult, CheckError> {
        let elapsed = ctx.ping.as_ref().map_err(|e| CheckError::Probe(e.clone()))?;
        let ms = elapsed.as_secs_f64() * 1000.0;
        let status = grade(
            ms,
            ctx.settings.warning.response_time_ms,
            ctx.settings.critical.response_time_ms,
        );
        let message = match status {
            HealthStatus::Healthy => format!("Database reachable in {ms:.0} ms"),
            _ => format!("Slow database response: {ms:.0} ms"),
        };
        Ok(HealthCheckResult::new(self.axis(), status, message).metric("response_time_ms", ms))
    }
}

// ============================================================
// Performance
// ============================================================

pub struct PerformanceCheck;

impl HealthCheck for PerformanceCheck {
    fn axis(&self) -> Axis {
        Axis::Performance
    }

    fn evaluate(&self, ctx: &CheckContext) -> Result<HealthCheckResult, CheckError> {
        let m = ctx.metrics()?;
        let perf = &ctx.settings.performance;
        let mut f = Findings::new(self.axis());

        if let Some(avg) = m.avg_query_time_ms {
            let s = grade(avg, perf.avg_query_warning_ms, perf.avg_query_critical_ms);
            f.add("avg_query_time_ms", avg, s, || format!("Slow queries: {avg:.0} ms average"));
        }
        if let Some(ratio) = m.cache_hit_ratio {
            let s = grade_below(ratio, perf.cache_hit_warning, perf.cache_hit_critical);
            f.add("cache_hit_ratio", ratio, s, || {
                format!("Low cache hit ratio: {:.1}%", ratio * 100.0)
            });
        }
        if let Some(rate) = m.error_rate {
            let s = grade(
                rate,
                ctx.settings.warning.error_rate,
                ctx.settings.critical.error_rate,
            );
            f.add("error_rate", rate, s, || {
                format!("High error rate: {:.1}%", rate * 100.0)
            });
        }
        Ok(f.finish("Query performance is normal", "No performance data"))
    }
}

// ============================================================
// Resources
// ============================================================

pub struct ResourcesCheck;

impl HealthCheck for ResourcesCheck {
    fn axis(&self) -> Axis {
        Axis::Resources
    }

    fn evaluate(&self, ctx: &CheckContext) -> Result<HealthCheckResult, CheckError> {
        let m = ctx.metrics()?;
        let (w, c) = (&ctx.settings.warning, &ctx.settings.critical);
        let mut f = Findings::new(self.axis());

        let resources = [
            ("cpu_pct", "CPU", m.cpu_pct, w.cpu, c.cpu),
            ("memory_pct", "memory", m.memory_pct, w.memory, c.memory),
            ("disk_pct", "disk", m.disk_pct, w.disk, c.disk),
        ];
        for (metric, label, value, warning, critical) in resources {
            if let Some(v) = value {
                let s = grade(v, warning, critical);
                f.add(metric, v, s, || format!("High {label} usage: {v:.1}%"));
            }
        }
        if let Some(iops) = m.disk_iops {
            f.metrics.insert("disk_iops".to_string(), iops);
        }
        Ok(f.finish("Resource usage is normal", "No host resource data"))
    }
}

// ============================================================
// Connections
// ============================================================

pub struct ConnectionsCheck;

impl HealthCheck for ConnectionsCheck {
    fn axis(&self) -> Axis {
        Axis::Connections
    }

    fn evaluate(&self, ctx: &CheckContext) -> Result<HealthCheckResult, CheckError> {
        let m = ctx.metrics()?;
        let mut f = Findings::new(self.axis());
        if let Some(pct) = m.connection_utilization_pct() {
            let s = grade(
                pct,
                ctx.settings.warning.connections,
                ctx.settings.critical.connections,
            );
            f.add("utilization_pct", pct, s, || {
                format!("Connection pool {pct:.0}% utilized")
            });
            if let (Some(active), Some(max)) = (m.active_connections, m.max_connections) {
                f.metrics.insert("active".to_string(), active as f64);
                f.metrics.insert("max".to_string(), max as f64);
            }
        }
        Ok(f.finish("Connection pool has headroom", "No connection data"))
    }
}

// ============================================================
// Integrity
// ============================================================

pub struct IntegrityCheck;

impl HealthCheck for IntegrityCheck {
    fn axis(&self) -> Axis {
        Axis::Integrity
    }

    fn evaluate(&self, ctx: &CheckContext) -> Result<HealthCheckResult, CheckError> {
        let m = ctx.metrics()?;
        let mut f = Findings::new(self.axis());
        if let Some(ratio) = m.dead_tuple_ratio() {
            let pct = ratio * 100.0;
            let s = grade(pct, DEAD_TUPLE_WARNING_PCT, DEAD_TUPLE_CRITICAL_PCT);
            f.add("dead_tuple_pct", pct, s, || {
                format!("{pct:.0}% dead tuples; vacuum is falling behind")
            });
        }
        Ok(f.finish("Dead tuples under control", "No tuple statistics"))
    }
}

// ============================================================
// Security
// ============================================================

pub struct SecurityCheck;

impl HealthCheck for SecurityCheck {
    fn axis(&self) -> Axis {
        Axis::Security
    }

    fn evaluate(&self, ctx: &CheckContext) -> Result<HealthCheckResult, CheckError> {
        let m = ctx.metrics()?;
        let mut f = Findings::new(self.axis());
        if let Some(n) = m.failed_logins {
            let n = n as f64;
            let s = grade(n, FAILED_LOGINS_WARNING, FAILED_LOGINS_CRITICAL);
            f.add("failed_logins", n, s, || format!("{n:.0} failed logins since last check"));
        }
        Ok(f.finish("No suspicious login activity", "No authentication data"))
    }
}

// ============================================================
// Replication
// ============================================================

pub struct ReplicationCheck;

impl HealthCheck for ReplicationCheck {
    fn axis(&self) -> Axis {
        Axis::Replication
    }

    fn evaluate(&self, ctx: &CheckContext) -> Result<HealthCheckResult, CheckError> {
        let m = ctx.metrics()?;
        let Some(lag) = m.replication_lag_secs else {
            return Ok(HealthCheckResult::new(
                self.axis(),
                HealthStatus::Healthy,
                "Replication not configured",
            ));
        };
        let mut f = Findings::new(self.axis());
        let s = grade(lag, REPLICATION_LAG_WARNING_SECS, REPLICATION_LAG_CRITICAL_SECS);
        f.add("lag_secs", lag, s, || format!("Replication lag {lag:.0} s"));
        Ok(f.finish("Replicas are in sync", "No replication data"))
    }
}

// ============================================================
// Storage
// ============================================================

pub struct StorageCheck;

impl HealthCheck for StorageCheck {
    fn axis(&self) -> Axis {
        Axis::Storage
    }

    fn evaluate(&self, ctx: &CheckContext) -> Result<HealthCheckResult, CheckError> {
        let m = ctx.metrics()?;
        let mut f = Findings::new(self.axis());
        if let Some(pct) = m.fragmentation_pct {
            let s = grade(pct, FRAGMENTATION_WARNING_PCT, FRAGMENTATION_CRITICAL_PCT);
            f.add("fragmentation_pct", pct, s, || {
                format!("Storage {pct:.0}% fragmented")
            });
        }
        Ok(f.finish("Storage layout is compact", "No storage data"))
    }
}
