//! Health monitoring across eight axes.
//!
//! A pass pings the provider once (timed), fetches resource metrics once, and
//! grades them with every [`HealthCheck`]. The aggregated snapshot goes into a
//! bounded history; critical passes may trigger remediation. Every pass is
//! announced on the [`EventBus`].

pub mod checks;
pub mod events;
pub mod history;
pub mod remediation;

pub use checks::{Axis, HealthCheck, HealthCheckResult, HealthStatus};
pub use events::{EventBus, HealthEvent};
pub use history::{HealthHistory, HealthTrends, HistoryError};
pub use remediation::{RemediationAction, RemediationError, RemediationOutcome, RemediationRule};

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, PerformanceThresholds, Thresholds};
use crate::optimizer::Optimizer;
use crate::provider::StatisticsProvider;
use checks::{CheckContext, CheckError};
use remediation::{RemediationContext, RemediationLog};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum HealthError {
    #[error("a health check is already running")]
    CheckInProgress,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthSettings {
    pub warning: Thresholds,
    pub critical: Thresholds,
    pub performance: PerformanceThresholds,
    pub history_capacity: usize,
    pub enable_auto_remediation: bool,
    pub auto_create_indexes: bool,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for HealthSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            warning: config.health_thresholds,
            critical: config.critical_thresholds,
            performance: config.performance_thresholds,
            history_capacity: config.history_capacity,
            enable_auto_remediation: config.enable_auto_remediation,
            auto_create_indexes: config.auto_create_indexes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub overall_status: HealthStatus,
    /// Epoch seconds.
    pub timestamp: i64,
    pub results: Vec<HealthCheckResult>,
    pub duration_ms: u64,
    /// Set when the database answered but its metrics could not be read. The
    /// metric axes are then unknown and do not lower the overall status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_error: Option<String>,
}

impl HealthSnapshot {
    pub fn result(&self, axis: Axis) -> Option<&HealthCheckResult> {
        self.results.iter().find(|r| r.axis == axis)
    }
}

/// Worst status across the results. Unknown never raises the status; if
/// nothing is known the result is unknown.
pub fn aggregate(results: &[HealthCheckResult]) -> HealthStatus {
    results
        .iter()
        .fold(HealthStatus::Unknown, |acc, r| acc.worst(r.status))
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the busy flag when a pass ends, including by panic.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct HealthMonitor {
    settings: HealthSettings,
    checks: Vec<Box<dyn HealthCheck>>,
    rules: Vec<Box<dyn RemediationRule>>,
    history: Mutex<HealthHistory>,
    remediation_log: Mutex<RemediationLog>,
    busy: AtomicBool,
    events: EventBus,
}

impl HealthMonitor {
    pub fn new(settings: HealthSettings) -> Self {
        Self::with_rules(settings, remediation::all_remediation_rules())
    }

    /// Monitor with a custom remediation rule list.
    pub fn with_rules(settings: HealthSettings, rules: Vec<Box<dyn RemediationRule>>) -> Self {
        let history = HealthHistory::new(settings.history_capacity);
        Self {
            settings,
            checks: checks::all_checks(),
            rules,
            history: Mutex::new(history),
            remediation_log: Mutex::new(RemediationLog::default()),
            busy: AtomicBool::new(false),
            events: EventBus::default(),
        }
    }

    pub fn settings(&self) -> &HealthSettings {
        &self.settings
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn run_check(
        &self,
        provider: &dyn StatisticsProvider,
        optimizer: &Optimizer,
    ) -> Result<Arc<HealthSnapshot>, HealthError> {
        self.run_check_at(provider, optimizer, chrono::Utc::now().timestamp())
    }

    /// Runs one pass. Returns [`HealthError::CheckInProgress`] if another pass
    /// is already running.
    pub fn run_check_at(
        &self,
        provider: &dyn StatisticsProvider,
        optimizer: &Optimizer,
        now: i64,
    ) -> Result<Arc<HealthSnapshot>, HealthError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(HealthError::CheckInProgress);
        }
        let _busy = BusyGuard(&self.busy);
        let started = Instant::now();

        let ping_started = Instant::now();
        let ping = provider.ping().map(|()| ping_started.elapsed());
        let metrics = match &ping {
            Ok(_) => provider.get_resource_metrics(),
            // skip the second round trip to a database that did not answer
            Err(e) => Err(e.clone()),
        };

        let ctx = CheckContext {
            ping: &ping,
            metrics: &metrics,
            settings: &self.settings,
        };
        let results: Vec<HealthCheckResult> = self
            .checks
            .iter()
            .map(|check| match check.evaluate(&ctx) {
                Ok(r) => r,
                Err(e) => degraded(check.axis(), &e),
            })
            .collect();

        let metrics_error = match (&ping, &metrics) {
            (Ok(_), Err(e)) => {
                warn!(error = %e, "database reachable but metrics unavailable");
                Some(e.to_string())
            }
            _ => None,
        };

        let overall_status = aggregate(&results);
        let snapshot = Arc::new(HealthSnapshot {
            overall_status,
            timestamp: now,
            results,
            duration_ms: started.elapsed().as_millis() as u64,
            metrics_error,
        });

        let previous = {
            let mut history = guard(&self.history);
            let previous = history.latest().map(|s| s.overall_status);
            history.push(snapshot.as_ref().clone());
            previous
        };

        debug!(
            status = %overall_status,
            duration_ms = snapshot.duration_ms,
            "health check completed"
        );
        self.events.publish(HealthEvent::CheckCompleted(snapshot.clone()));
        if let Some(previous) = previous.filter(|p| *p != overall_status) {
            info!(from = %previous, to = %overall_status, "health status changed");
            self.events.publish(HealthEvent::StatusChanged {
                previous,
                current: overall_status,
                timestamp: now,
            });
        }

        if self.settings.enable_auto_remediation && overall_status == HealthStatus::Critical {
            match &metrics {
                Ok(m) => self.remediate(m, provider, optimizer, now),
                Err(e) => warn!(error = %e, "skipping remediation without metrics"),
            }
        }

        Ok(snapshot)
    }

    fn remediate(
        &self,
        metrics: &crate::provider::ResourceMetrics,
        provider: &dyn StatisticsProvider,
        optimizer: &Optimizer,
        now: i64,
    ) {
        let ctx = RemediationContext {
            metrics,
            provider,
            optimizer,
            settings: &self.settings,
        };
        let actions = remediation::remediate(&self.rules, &ctx, now);
        for a in &actions {
            self.events.publish(HealthEvent::Remediation(a.clone()));
        }
        guard(&self.remediation_log).extend(actions);
    }

    pub fn latest_snapshot(&self) -> Option<HealthSnapshot> {
        guard(&self.history).latest().cloned()
    }

    /// Up to `limit` most recent snapshots, oldest first.
    pub fn history(&self, limit: usize) -> Vec<HealthSnapshot> {
        guard(&self.history).recent(limit)
    }

    pub fn history_len(&self) -> usize {
        guard(&self.history).len()
    }

    pub fn trends(&self) -> HealthTrends {
        guard(&self.history).trends()
    }

    pub fn remediation_log(&self) -> Vec<RemediationAction> {
        guard(&self.remediation_log).entries()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    pub fn save_history(&self, path: &Path) -> Result<(), HistoryError> {
        let history = guard(&self.history).clone();
        history.save(path)
    }

    /// Replaces the in-memory history with the file's content. Returns the
    /// number of snapshots restored.
    pub fn restore_history(&self, path: &Path) -> Result<usize, HistoryError> {
        let loaded = HealthHistory::load(path, self.settings.history_capacity)?;
        let n = loaded.len();
        *guard(&self.history) = loaded;
        Ok(n)
    }
}

fn degraded(axis: Axis, error: &CheckError) -> HealthCheckResult {
    let status = match axis {
        Axis::Connectivity => HealthStatus::Critical,
        _ => HealthStatus::Unknown,
    };
    HealthCheckResult::new(axis, status, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::OptimizerSettings;
    use crate::provider::ResourceMetrics;
    use crate::provider::mock::MockProvider;
    use std::time::Duration;

    fn optimizer() -> Optimizer {
        Optimizer::new(OptimizerSettings::default())
    }

    fn result(axis: Axis, status: HealthStatus) -> HealthCheckResult {
        HealthCheckResult::new(axis, status, "")
    }

    #[test]
    fn aggregation_precedence() {
        use HealthStatus::*;
        let r = |s: &[HealthStatus]| {
            aggregate(&s.iter().map(|s| result(Axis::Storage, *s)).collect::<Vec<_>>())
        };
        assert_eq!(r(&[Warning, Critical]), Critical);
        assert_eq!(r(&[Healthy, Warning]), Warning);
        assert_eq!(r(&[Healthy, Unknown]), Healthy);
        assert_eq!(r(&[Unknown, Unknown]), Unknown);
        assert_eq!(r(&[]), Unknown);
    }

    #[test]
    fn typical_workload_is_healthy() {
        let monitor = HealthMonitor::new(HealthSettings::default());
        let provider = MockProvider::typical_workload();
        let snap = monitor.run_check_at(&provider, &optimizer(), 100).unwrap();
        assert_eq!(snap.overall_status, HealthStatus::Healthy);
        assert_eq!(snap.results.len(), 8);
        assert_eq!(snap.timestamp, 100);
        assert_eq!(monitor.history_len(), 1);
    }

    #[test]
    fn overloaded_cpu_is_critical() {
        let mut settings = HealthSettings::default();
        settings.critical.cpu = 95.0;
        let monitor = HealthMonitor::new(settings);
        let provider = MockProvider::overloaded();
        let snap = monitor.run_check_at(&provider, &optimizer(), 100).unwrap();
        let resources = snap.result(Axis::Resources).unwrap();
        assert_eq!(resources.status, HealthStatus::Critical);
        assert!(resources.message.contains("CPU"));
        assert_eq!(snap.overall_status, HealthStatus::Critical);
    }

    #[test]
    fn unreachable_database() {
        let monitor = HealthMonitor::new(HealthSettings::default());
        let provider = MockProvider::typical_workload();
        provider.set_unreachable(true);
        let snap = monitor.run_check_at(&provider, &optimizer(), 100).unwrap();
        assert_eq!(snap.overall_status, HealthStatus::Critical);
        assert_eq!(
            snap.result(Axis::Connectivity).unwrap().status,
            HealthStatus::Critical
        );
        for r in snap.results.iter().filter(|r| r.axis != Axis::Connectivity) {
            assert_eq!(r.status, HealthStatus::Unknown, "{:?}", r.axis);
        }
    }

    #[test]
    fn metrics_failure_leaves_axes_unknown() {
        let monitor = HealthMonitor::new(HealthSettings::default());
        let provider = MockProvider::typical_workload();
        provider.set_read_error(Some(crate::provider::ProviderError::Timeout(10)));
        let snap = monitor.run_check_at(&provider, &optimizer(), 100).unwrap();
        assert_eq!(
            snap.result(Axis::Connectivity).unwrap().status,
            HealthStatus::Healthy
        );
        assert_eq!(snap.overall_status, HealthStatus::Healthy);
        assert_eq!(
            snap.result(Axis::Storage).unwrap().status,
            HealthStatus::Unknown
        );
        assert_eq!(snap.metrics_error.as_deref(), Some("timed out after 10 ms"));

        provider.set_read_error(None);
        let snap = monitor.run_check_at(&provider, &optimizer(), 200).unwrap();
        assert!(snap.metrics_error.is_none());
    }

    #[test]
    fn slow_ping_and_critical_resources_are_critical() {
        let mut settings = HealthSettings::default();
        settings.warning.response_time_ms = 1.0;
        settings.critical.response_time_ms = 10_000.0;
        let monitor = HealthMonitor::new(settings);
        let provider = MockProvider::new();
        provider.set_ping_delay(Duration::from_millis(5));
        provider.set_resource_metrics(ResourceMetrics {
            cpu_pct: Some(97.0),
            ..Default::default()
        });

        let snap = monitor.run_check_at(&provider, &optimizer(), 100).unwrap();
        assert_eq!(
            snap.result(Axis::Connectivity).unwrap().status,
            HealthStatus::Warning
        );
        assert_eq!(
            snap.result(Axis::Resources).unwrap().status,
            HealthStatus::Critical
        );
        assert_eq!(snap.overall_status, HealthStatus::Critical);
    }

    #[test]
    fn unknown_axes_never_outrank_healthy_or_warning() {
        let monitor = HealthMonitor::new(HealthSettings::default());
        // no metrics at all: only connectivity and replication can be graded
        let provider = MockProvider::new();
        let snap = monitor.run_check_at(&provider, &optimizer(), 100).unwrap();
        assert!(
            snap.results
                .iter()
                .any(|r| r.axis != Axis::Connectivity && r.status == HealthStatus::Unknown)
        );
        assert_eq!(
            snap.result(Axis::Connectivity).unwrap().status,
            HealthStatus::Healthy
        );
        assert_eq!(snap.overall_status, HealthStatus::Healthy);

        provider.set_resource_metrics(ResourceMetrics {
            cpu_pct: Some(75.0),
            ..Default::default()
        });
        let snap = monitor.run_check_at(&provider, &optimizer(), 200).unwrap();
        assert_eq!(
            snap.result(Axis::Resources).unwrap().status,
            HealthStatus::Warning
        );
        assert_eq!(snap.overall_status, HealthStatus::Warning);
    }

    #[test]
    fn busy_monitor_rejects_second_pass() {
        let monitor = HealthMonitor::new(HealthSettings::default());
        monitor.busy.store(true, Ordering::Release);
        let provider = MockProvider::typical_workload();
        assert_eq!(
            monitor.run_check_at(&provider, &optimizer(), 1).unwrap_err(),
            HealthError::CheckInProgress
        );
        monitor.busy.store(false, Ordering::Release);
        assert!(monitor.run_check_at(&provider, &optimizer(), 2).is_ok());
        assert!(!monitor.is_busy());
    }

    #[test]
    fn remediation_only_when_enabled_and_critical() {
        let provider = MockProvider::overloaded();
        let monitor = HealthMonitor::new(HealthSettings::default());
        monitor.run_check_at(&provider, &optimizer(), 1).unwrap();
        assert!(monitor.remediation_log().is_empty());

        let settings = HealthSettings {
            enable_auto_remediation: true,
            ..Default::default()
        };
        let monitor = HealthMonitor::new(settings);
        let healthy = MockProvider::typical_workload();
        monitor.run_check_at(&healthy, &optimizer(), 1).unwrap();
        assert!(monitor.remediation_log().is_empty());

        monitor.run_check_at(&provider, &optimizer(), 2).unwrap();
        let log = monitor.remediation_log();
        assert_eq!(log.len(), 4);
        assert!(log.iter().all(|a| a.timestamp == 2));
        assert!(!provider.maintenance_log().is_empty());
    }

    #[test]
    fn events_follow_status_changes() {
        let monitor = HealthMonitor::new(HealthSettings::default());
        let mut rx = monitor.subscribe();
        let provider = MockProvider::typical_workload();
        monitor.run_check_at(&provider, &optimizer(), 1).unwrap();
        provider.set_resource_metrics(ResourceMetrics {
            cpu_pct: Some(99.0),
            ..Default::default()
        });
        monitor.run_check_at(&provider, &optimizer(), 2).unwrap();

        let mut completed = 0;
        let mut changes = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                HealthEvent::CheckCompleted(_) => completed += 1,
                HealthEvent::StatusChanged { previous, current, .. } => {
                    changes.push((previous, current))
                }
                HealthEvent::Remediation(_) => {}
            }
        }
        assert_eq!(completed, 2);
        assert_eq!(changes, vec![(HealthStatus::Healthy, HealthStatus::Critical)]);
    }

    #[test]
    fn history_is_bounded_and_persisted() {
        let settings = HealthSettings {
            history_capacity: 5,
            ..Default::default()
        };
        let monitor = HealthMonitor::new(settings.clone());
        let provider = MockProvider::typical_workload();
        for i in 0..8 {
            monitor.run_check_at(&provider, &optimizer(), i).unwrap();
        }
        assert_eq!(monitor.history_len(), 5);
        assert_eq!(monitor.history(2).iter().map(|s| s.timestamp).collect::<Vec<_>>(), vec![6, 7]);
        assert_eq!(monitor.trends().uptime_pct, 100.0);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("health.json");
        monitor.save_history(&path).unwrap();
        let restored = HealthMonitor::new(settings);
        assert_eq!(restored.restore_history(&path).unwrap(), 5);
        assert_eq!(restored.latest_snapshot().unwrap().timestamp, 7);
    }
}
