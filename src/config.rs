//! Engine configuration.
//!
//! All options have defaults; a TOML file may override any subset of them.
//! [`EngineConfig::validate`] must succeed before an engine is built, so
//! inconsistent thresholds are rejected at startup rather than mid-run.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid config: {field} {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.into(),
        reason: reason.into(),
    }
}

/// One tier of resource thresholds (warning or critical).
///
/// Percentages are 0..=100, `response_time_ms` is a round-trip probe latency,
/// `error_rate` is a fraction of rolled back transactions (0..=1).
/// A tier given in a config file must list every key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
    pub connections: f64,
    pub response_time_ms: f64,
    pub error_rate: f64,
}

impl Thresholds {
    pub fn warning_defaults() -> Self {
        Self {
            cpu: 70.0,
            memory: 80.0,
            disk: 80.0,
            connections: 80.0,
            response_time_ms: 1000.0,
            error_rate: 0.05,
        }
    }

    pub fn critical_defaults() -> Self {
        Self {
            cpu: 90.0,
            memory: 95.0,
            disk: 90.0,
            connections: 95.0,
            response_time_ms: 5000.0,
            error_rate: 0.10,
        }
    }

    fn validate(&self, tier: &str) -> Result<(), ConfigError> {
        for (name, value) in [
            ("cpu", self.cpu),
            ("memory", self.memory),
            ("disk", self.disk),
            ("connections", self.connections),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(invalid(
                    format!("{tier}.{name}"),
                    format!("must be in (0, 100], got {value}"),
                ));
            }
        }
        if !(self.response_time_ms > 0.0 && self.response_time_ms.is_finite()) {
            return Err(invalid(
                format!("{tier}.response_time_ms"),
                "must be positive",
            ));
        }
        if !(self.error_rate > 0.0 && self.error_rate <= 1.0) {
            return Err(invalid(
                format!("{tier}.error_rate"),
                format!("must be in (0, 1], got {}", self.error_rate),
            ));
        }
        Ok(())
    }
}

/// Two-tier thresholds for the performance axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceThresholds {
    pub avg_query_warning_ms: f64,
    pub avg_query_critical_ms: f64,
    /// Cache hit ratio (0..1) below which the axis is warning.
    pub cache_hit_warning: f64,
    /// Cache hit ratio (0..1) below which the axis is critical.
    pub cache_hit_critical: f64,
}

impl Default for PerformanceThresholds {
    fn default() -> Self {
        Self {
            avg_query_warning_ms: 500.0,
            avg_query_critical_ms: 2000.0,
            cache_hit_warning: 0.90,
            cache_hit_critical: 0.80,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub check_interval_ms: u64,
    pub capture_interval_ms: u64,
    pub analysis_interval_ms: u64,
    pub timeout_ms: u64,
    pub health_thresholds: Thresholds,
    pub critical_thresholds: Thresholds,
    pub performance_thresholds: PerformanceThresholds,
    pub enable_auto_remediation: bool,
    pub slow_query_threshold_ms: f64,
    pub high_frequency_calls_per_hour: f64,
    pub analysis_window_ms: u64,
    pub max_queries_tracked: usize,
    /// Row limit passed to the provider on each capture.
    pub statistics_limit: usize,
    /// Provider counters are lifetime totals (pg_stat_statements style) and
    /// must be converted to per-interval deltas before folding.
    pub cumulative_statistics: bool,
    /// Index pairs whose column-set similarity is strictly above this are
    /// redundant. Must be below 1.0 so identical column sets always qualify.
    pub duplicate_index_similarity_threshold: f64,
    pub unused_index_days: u32,
    pub auto_create_indexes: bool,
    pub history_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 30_000,
            capture_interval_ms: 30_000,
            analysis_interval_ms: 300_000,
            timeout_ms: 10_000,
            health_thresholds: Thresholds::warning_defaults(),
            critical_thresholds: Thresholds::critical_defaults(),
            performance_thresholds: PerformanceThresholds::default(),
            enable_auto_remediation: false,
            slow_query_threshold_ms: 1000.0,
            high_frequency_calls_per_hour: 1000.0,
            analysis_window_ms: 24 * 60 * 60 * 1000,
            max_queries_tracked: 1000,
            statistics_limit: 500,
            cumulative_statistics: true,
            duplicate_index_similarity_threshold: 0.8,
            unused_index_days: 30,
            auto_create_indexes: false,
            history_capacity: 100,
        }
    }
}

impl EngineConfig {
    /// Loads a TOML file; missing keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("check_interval_ms", self.check_interval_ms),
            ("capture_interval_ms", self.capture_interval_ms),
            ("analysis_interval_ms", self.analysis_interval_ms),
            ("timeout_ms", self.timeout_ms),
            ("analysis_window_ms", self.analysis_window_ms),
        ] {
            if value == 0 {
                return Err(invalid(name, "must be greater than zero"));
            }
        }
        for (name, value) in [
            ("max_queries_tracked", self.max_queries_tracked),
            ("statistics_limit", self.statistics_limit),
            ("history_capacity", self.history_capacity),
        ] {
            if value == 0 {
                return Err(invalid(name, "must be greater than zero"));
            }
        }
        if self.unused_index_days == 0 {
            return Err(invalid("unused_index_days", "must be greater than zero"));
        }

        self.health_thresholds.validate("health_thresholds")?;
        self.critical_thresholds.validate("critical_thresholds")?;
        let w = &self.health_thresholds;
        let c = &self.critical_thresholds;
        for (name, warn, crit) in [
            ("cpu", w.cpu, c.cpu),
            ("memory", w.memory, c.memory),
            ("disk", w.disk, c.disk),
            ("connections", w.connections, c.connections),
            ("response_time_ms", w.response_time_ms, c.response_time_ms),
            ("error_rate", w.error_rate, c.error_rate),
        ] {
            if warn >= crit {
                return Err(invalid(
                    format!("health_thresholds.{name}"),
                    format!("warning ({warn}) must be below critical ({crit})"),
                ));
            }
        }

        let p = &self.performance_thresholds;
        if !(p.avg_query_warning_ms > 0.0 && p.avg_query_warning_ms < p.avg_query_critical_ms) {
            return Err(invalid(
                "performance_thresholds.avg_query_warning_ms",
                "must be positive and below avg_query_critical_ms",
            ));
        }
        if !(p.cache_hit_critical > 0.0
            && p.cache_hit_critical < p.cache_hit_warning
            && p.cache_hit_warning <= 1.0)
        {
            return Err(invalid(
                "performance_thresholds.cache_hit_critical",
                "must satisfy 0 < critical < warning <= 1",
            ));
        }

        if !(self.slow_query_threshold_ms > 0.0 && self.slow_query_threshold_ms.is_finite()) {
            return Err(invalid("slow_query_threshold_ms", "must be positive"));
        }
        if !(self.high_frequency_calls_per_hour > 0.0) {
            return Err(invalid("high_frequency_calls_per_hour", "must be positive"));
        }
        let sim = self.duplicate_index_similarity_threshold;
        if !(sim >= 0.0 && sim < 1.0) {
            return Err(invalid(
                "duplicate_index_similarity_threshold",
                format!("must be in [0, 1), got {sim}"),
            ));
        }
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.capture_interval_ms)
    }

    pub fn analysis_interval(&self) -> Duration {
        Duration::from_millis(self.analysis_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Analysis window in whole seconds (timestamps are epoch seconds).
    pub fn analysis_window_secs(&self) -> i64 {
        (self.analysis_window_ms / 1000).max(1) as i64
    }

    pub fn unused_index_secs(&self) -> i64 {
        i64::from(self.unused_index_days) * 86_400
    }
}
