//! The engine: analyzer, optimizer and health monitor sharing one provider,
//! driven by three periodic tasks (capture, analysis, health).
//!
//! Every administrative operation is a plain method here; errors carry an
//! [`ErrorKind`] so an outer API can map them to client or server failures.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::analysis::{
    AnalysisError, AnalysisReport, Analyzer, AnalyzerSettings, CaptureSummary,
    PerformanceSummary, Recommendation, SlowQuery,
};
use crate::config::{ConfigError, EngineConfig};
use crate::health::{
    HealthError, HealthEvent, HealthMonitor, HealthSettings, HealthSnapshot, HealthTrends,
    HistoryError, RemediationAction,
};
use crate::optimizer::{
    DdlActionError, IndexActionResult, IndexDescriptor, IndexRecommendation, IndexStatistics,
    OptimizationResult, Optimizer, OptimizerSettings, RedundancyReport,
};
use crate::provider::{ProviderError, StatisticsProvider};
use crate::scheduler::{PeriodicTask, SchedulerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input or a request that conflicts with current state.
    Client,
    /// The engine or the database failed.
    Server,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    #[error(transparent)]
    Action(#[from] DdlActionError),
    #[error(transparent)]
    Health(#[from] HealthError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    History(#[from] HistoryError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Config(_) | EngineError::Health(HealthError::CheckInProgress) => {
                ErrorKind::Client
            }
            EngineError::Action(e) if e.is_client_error() => ErrorKind::Client,
            _ => ErrorKind::Server,
        }
    }
}

/// Components shared with the background tasks.
struct Core {
    provider: Arc<dyn StatisticsProvider>,
    analyzer: Analyzer,
    optimizer: Optimizer,
    monitor: HealthMonitor,
}

impl Core {
    fn capture(&self) -> Result<CaptureSummary, AnalysisError> {
        self.analyzer.capture(self.provider.as_ref())
    }

    /// Refreshes the index catalog, analyzes profiles and rebuilds the
    /// index recommendation set.
    fn analyze(&self) -> Result<Arc<AnalysisReport>, AnalysisError> {
        if let Err(e) = self.optimizer.discover(self.provider.as_ref()) {
            warn!(error = %e, "index discovery failed, using previous catalog");
        }
        let report = self.analyzer.analyze(&self.optimizer)?;
        let profiles = self.analyzer.profiles()?;
        self.optimizer.refresh_recommendations(&profiles);
        Ok(report)
    }

    fn check_health(&self) -> Result<Arc<HealthSnapshot>, HealthError> {
        self.monitor.run_check(self.provider.as_ref(), &self.optimizer)
    }
}

pub struct Engine {
    config: EngineConfig,
    core: Arc<Core>,
    capture_task: PeriodicTask,
    analysis_task: PeriodicTask,
    health_task: PeriodicTask,
}

impl Engine {
    /// Builds an engine. Fails if the configuration is invalid.
    pub fn new(config: EngineConfig, provider: Arc<dyn StatisticsProvider>) -> Result<Self, EngineError> {
        config.validate()?;
        let timeout = config.timeout();
        let core = Arc::new(Core {
            provider,
            analyzer: Analyzer::new(AnalyzerSettings::from(&config)),
            optimizer: Optimizer::new(OptimizerSettings::from(&config)),
            monitor: HealthMonitor::new(HealthSettings::from(&config)),
        });
        Ok(Self {
            capture_task: PeriodicTask::new("capture", config.capture_interval(), timeout),
            // discovery plus analysis may issue several queries
            analysis_task: PeriodicTask::new("analysis", config.analysis_interval(), timeout * 3),
            health_task: PeriodicTask::new("health", config.check_interval(), timeout * 2),
            core,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn analyzer(&self) -> &Analyzer {
        &self.core.analyzer
    }

    pub fn optimizer(&self) -> &Optimizer {
        &self.core.optimizer
    }

    pub fn monitor(&self) -> &HealthMonitor {
        &self.core.monitor
    }

    // ============================================================
    // Lifecycle
    // ============================================================

    /// Starts the capture, analysis and health schedules. Must be called from
    /// within a tokio runtime. Starting a running engine is a no-op.
    pub fn start(&self) -> Result<(), EngineError> {
        let core = Arc::clone(&self.core);
        self.capture_task.start(Arc::new(move || match core.capture() {
            Ok(s) => debug!(fetched = s.fetched, recorded = s.recorded, "capture pass"),
            Err(e) => warn!(error = %e, "capture pass failed"),
        }))?;

        let core = Arc::clone(&self.core);
        self.analysis_task.start(Arc::new(move || match core.analyze() {
            Ok(r) => info!(
                profiles = r.profile_count,
                slow = r.slow_queries.len(),
                recommendations = r.recommendations.len(),
                "analysis pass"
            ),
            Err(e) => warn!(error = %e, "analysis pass failed"),
        }))?;

        let core = Arc::clone(&self.core);
        self.health_task.start(Arc::new(move || {
            if let Err(e) = core.check_health() {
                debug!(error = %e, "health pass skipped");
            }
        }))?;

        info!("engine started");
        Ok(())
    }

    /// Stops all schedules. Stopping a stopped engine is a no-op.
    pub fn stop(&self) {
        let stopped = [&self.capture_task, &self.analysis_task, &self.health_task]
            .into_iter()
            .filter(|t| t.stop())
            .count();
        if stopped > 0 {
            info!("engine stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.capture_task.is_running()
            || self.analysis_task.is_running()
            || self.health_task.is_running()
    }

    // ============================================================
    // Health
    // ============================================================

    pub fn health_snapshot(&self) -> Option<HealthSnapshot> {
        self.core.monitor.latest_snapshot()
    }

    pub fn health_history(&self, limit: usize) -> Vec<HealthSnapshot> {
        self.core.monitor.history(limit)
    }

    pub fn health_trends(&self) -> HealthTrends {
        self.core.monitor.trends()
    }

    pub fn run_health_check(&self) -> Result<Arc<HealthSnapshot>, EngineError> {
        Ok(self.core.check_health()?)
    }

    pub fn remediation_log(&self) -> Vec<RemediationAction> {
        self.core.monitor.remediation_log()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.core.monitor.subscribe()
    }

    pub fn save_health_history(&self, path: &Path) -> Result<(), EngineError> {
        Ok(self.core.monitor.save_history(path)?)
    }

    pub fn restore_health_history(&self, path: &Path) -> Result<usize, EngineError> {
        Ok(self.core.monitor.restore_history(path)?)
    }

    // ============================================================
    // Recommendations
    // ============================================================

    /// Query-level recommendations from the last analysis pass.
    pub fn query_recommendations(&self) -> Vec<Recommendation> {
        self.core
            .analyzer
            .last_report()
            .map(|r| r.recommendations.clone())
            .unwrap_or_default()
    }

    pub fn index_recommendations(&self) -> Arc<Vec<IndexRecommendation>> {
        self.core.optimizer.recommendations()
    }

    pub fn apply_recommendations(
        &self,
        ids: &[String],
        dry_run: bool,
    ) -> Result<Vec<IndexActionResult>, EngineError> {
        Ok(self
            .core
            .optimizer
            .apply_recommendations(self.core.provider.as_ref(), ids, dry_run)?)
    }

    // ============================================================
    // Indexes
    // ============================================================

    pub fn index_statistics(&self) -> IndexStatistics {
        self.core
            .optimizer
            .index_statistics(chrono::Utc::now().timestamp())
    }

    pub fn redundant_indexes(&self) -> Vec<RedundancyReport> {
        self.core.optimizer.find_redundant_indexes()
    }

    pub fn unused_indexes(&self) -> Vec<IndexDescriptor> {
        self.core
            .optimizer
            .find_unused_indexes(chrono::Utc::now().timestamp())
    }

    pub fn optimize(&self, limit: usize, dry_run: bool) -> OptimizationResult {
        self.core
            .optimizer
            .optimize(self.core.provider.as_ref(), limit, dry_run)
    }

    pub fn create_index(
        &self,
        table: &str,
        columns: &[String],
        dry_run: bool,
    ) -> Result<IndexActionResult, EngineError> {
        Ok(self
            .core
            .optimizer
            .create_index(self.core.provider.as_ref(), table, columns, dry_run)?)
    }

    pub fn drop_index(&self, name: &str, dry_run: bool) -> Result<IndexActionResult, EngineError> {
        Ok(self
            .core
            .optimizer
            .drop_index(self.core.provider.as_ref(), name, dry_run)?)
    }

    // ============================================================
    // Analysis
    // ============================================================

    pub fn analysis_summary(&self) -> Result<PerformanceSummary, EngineError> {
        Ok(self.core.analyzer.performance_summary()?)
    }

    pub fn slow_queries(&self) -> Vec<SlowQuery> {
        self.core.analyzer.slow_queries()
    }

    pub fn capture_now(&self) -> Result<CaptureSummary, EngineError> {
        Ok(self.core.capture()?)
    }

    pub fn run_analysis(&self) -> Result<Arc<AnalysisReport>, EngineError> {
        Ok(self.core.analyze()?)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::health::HealthStatus;
    use crate::optimizer::{ActionOutcome, Priority};
    use crate::provider::MockProvider;

    fn config() -> EngineConfig {
        EngineConfig {
            cumulative_statistics: false,
            ..Default::default()
        }
    }

    fn engine(provider: &Arc<MockProvider>) -> Engine {
        Engine::new(config(), provider.clone()).unwrap()
    }

    #[test]
    fn invalid_config_rejected() {
        let bad = EngineConfig {
            check_interval_ms: 0,
            ..Default::default()
        };
        let err = Engine::new(bad, Arc::new(MockProvider::new())).err().unwrap();
        assert!(matches!(err, EngineError::Config(_)));
        assert_eq!(err.kind(), ErrorKind::Client);
    }

    #[test]
    fn analysis_produces_index_recommendations() {
        let provider = Arc::new(MockProvider::typical_workload());
        let engine = engine(&provider);
        let captured = engine.capture_now().unwrap();
        assert_eq!(captured.recorded, 5);

        let report = engine.run_analysis().unwrap();
        assert_eq!(report.profile_count, 5);
        assert_eq!(engine.index_statistics().total_indexes, 6);

        let recs = engine.index_recommendations();
        let email = recs
            .iter()
            .find(|r| r.table == "users" && r.columns == ["email"])
            .expect("users(email) recommended");
        assert_eq!(email.priority, Priority::High);
        assert!(!engine.query_recommendations().is_empty());
        assert_eq!(engine.analysis_summary().unwrap().total_queries, 5);
    }

    #[test]
    fn apply_dry_run_then_for_real() {
        let provider = Arc::new(MockProvider::typical_workload());
        let engine = engine(&provider);
        engine.capture_now().unwrap();
        engine.run_analysis().unwrap();
        let id = engine
            .index_recommendations()
            .iter()
            .find(|r| r.table == "users")
            .map(|r| r.id.clone())
            .unwrap();

        let dry = engine.apply_recommendations(&[id.clone()], true).unwrap();
        assert_eq!(dry[0].outcome, ActionOutcome::DryRun);
        assert!(provider.executed_ddl().is_empty());

        let applied = engine.apply_recommendations(&[id.clone()], false).unwrap();
        assert_eq!(applied[0].outcome, ActionOutcome::Applied);
        assert_eq!(provider.executed_ddl().len(), 1);
        assert!(engine.index_recommendations().iter().all(|r| r.id != id));

        let err = engine
            .apply_recommendations(&["missing".to_string()], false)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Client);
    }

    #[test]
    fn ddl_failure_is_a_server_error() {
        let provider = Arc::new(MockProvider::typical_workload());
        provider.fail_ddl_matching("CREATE INDEX");
        let engine = engine(&provider);
        let err = engine
            .create_index("users", &["email".to_string()], false)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Server);
        assert!(engine.create_index("users", &["email".to_string()], true).is_ok());
    }

    #[test]
    fn optimize_drops_redundant_index() {
        let provider = Arc::new(MockProvider::typical_workload());
        let engine = engine(&provider);
        engine.run_analysis().unwrap();
        assert_eq!(engine.redundant_indexes().len(), 1);

        let result = engine.optimize(5, false);
        assert_eq!(result.dropped.len(), 1);
        assert_eq!(result.dropped[0].index_name, "orders_user_id_idx");
        assert!(engine.redundant_indexes().is_empty());
        assert!(engine.drop_index("users_pkey", false).is_err());
    }

    #[test]
    fn health_checks_through_engine() {
        let provider = Arc::new(MockProvider::overloaded());
        let engine = engine(&provider);
        assert!(engine.health_snapshot().is_none());
        let snap = engine.run_health_check().unwrap();
        assert_eq!(snap.overall_status, HealthStatus::Critical);
        assert_eq!(engine.health_history(10).len(), 1);
        assert_eq!(engine.health_trends().critical, 1);
        // remediation is off by default
        assert!(engine.remediation_log().is_empty());
    }

    #[test]
    fn start_requires_runtime() {
        let engine = engine(&Arc::new(MockProvider::new()));
        let err = engine.start().unwrap_err();
        assert!(matches!(err, EngineError::Scheduler(SchedulerError::NoRuntime)));
        assert_eq!(err.kind(), ErrorKind::Server);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scheduled_passes_run() {
        let provider = Arc::new(MockProvider::typical_workload());
        let engine = Engine::new(
            EngineConfig {
                check_interval_ms: 20,
                capture_interval_ms: 20,
                analysis_interval_ms: 20,
                timeout_ms: 1_000,
                cumulative_statistics: false,
                ..Default::default()
            },
            provider.clone(),
        )
        .unwrap();
        let mut events = engine.subscribe();

        engine.start().unwrap();
        engine.start().unwrap();
        assert!(engine.is_running());

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, HealthEvent::CheckCompleted(_)));

        tokio::time::sleep(Duration::from_millis(200)).await;
        engine.stop();
        engine.stop();
        assert!(!engine.is_running());

        assert!(engine.health_history(100).len() >= 2);
        assert!(!engine.analyzer().is_empty());
        assert!(engine.analyzer().last_report().is_some());
    }
}
