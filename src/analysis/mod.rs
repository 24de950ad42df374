//! Query performance aggregation and workload analysis.
//!
//! The [`Analyzer`] folds raw statement samples into per-pattern
//! [`QueryPerformanceProfile`]s keyed by [`normalize`]d text, and on demand
//! produces an [`AnalysisReport`]: slow, high-frequency and inefficient
//! queries, workload bottlenecks and recommendations.

pub mod advisor;
pub mod bottlenecks;
pub mod delta;
pub mod normalize;
mod profile;
pub mod report;

pub use delta::DeltaTracker;
pub use normalize::normalize;
pub use profile::QueryPerformanceProfile;
pub use report::{
    AnalysisReport, Bottleneck, BottleneckKind, FrequentQuery, InefficientQuery,
    PerformanceSummary, QueryIssue, Recommendation, RecommendationKind, Severity, SlowQuery,
};

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::optimizer::Optimizer;
use crate::provider::{ProviderError, QueryStatRecord, StatisticsProvider};
use advisor::{AdviceContext, all_advisors};
use bottlenecks::all_bottleneck_rules;

/// Slow queries that get lexical advice.
const ADVISED_SLOW_QUERIES: usize = 5;
/// High-frequency queries that get a caching hint.
const ADVISED_FREQUENT_QUERIES: usize = 3;
const INEFFICIENCY_THRESHOLD: f64 = 0.5;
const HIGH_IO_BLOCKS_PER_CALL: f64 = 1000.0;
const LOW_SELECTIVITY_ROWS_PER_CALL: f64 = 1000.0;
const HIGH_VARIANCE_FACTOR: f64 = 10.0;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("profile store lock poisoned")]
    StorePoisoned,
    #[error("sample for {key:?} has a non-finite execution time")]
    InvalidSample { key: String },
    #[error("aggregate for {key:?} is not finite")]
    NonFinite { key: String },
}

impl<T> From<PoisonError<T>> for AnalysisError {
    fn from(_: PoisonError<T>) -> Self {
        AnalysisError::StorePoisoned
    }
}

/// Analyzer knobs, taken from [`EngineConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerSettings {
    pub slow_query_threshold_ms: f64,
    pub high_frequency_calls_per_hour: f64,
    pub analysis_window_secs: i64,
    pub max_queries_tracked: usize,
    pub statistics_limit: usize,
    pub cumulative_statistics: bool,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for AnalyzerSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            slow_query_threshold_ms: config.slow_query_threshold_ms,
            high_frequency_calls_per_hour: config.high_frequency_calls_per_hour,
            analysis_window_secs: config.analysis_window_secs(),
            max_queries_tracked: config.max_queries_tracked,
            statistics_limit: config.statistics_limit,
            cumulative_statistics: config.cumulative_statistics,
        }
    }
}

/// What one capture tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    pub fetched: usize,
    pub recorded: usize,
    pub evicted: usize,
}

/// Per-pattern profile store plus the latest report.
pub struct Analyzer {
    settings: AnalyzerSettings,
    profiles: Mutex<HashMap<String, QueryPerformanceProfile>>,
    deltas: Mutex<DeltaTracker>,
    last_report: Mutex<Option<Arc<AnalysisReport>>>,
}

impl Analyzer {
    pub fn new(settings: AnalyzerSettings) -> Self {
        Self {
            settings,
            profiles: Mutex::new(HashMap::new()),
            deltas: Mutex::new(DeltaTracker::new()),
            last_report: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &AnalyzerSettings {
        &self.settings
    }

    fn store(&self) -> Result<MutexGuard<'_, HashMap<String, QueryPerformanceProfile>>, AnalysisError> {
        Ok(self.profiles.lock()?)
    }

    /// Folds one per-interval sample, timestamped now.
    pub fn record_sample(&self, stat: &QueryStatRecord) -> Result<(), AnalysisError> {
        self.record_sample_at(stat, chrono::Utc::now().timestamp())
    }

    /// Folds one per-interval sample into its profile.
    ///
    /// Samples with zero calls are ignored. When the store is full, the least
    /// recently seen profile is evicted to admit a new pattern.
    pub fn record_sample_at(&self, stat: &QueryStatRecord, now: i64) -> Result<(), AnalysisError> {
        if stat.calls == 0 {
            return Ok(());
        }
        let key = normalize(&stat.query_text);
        if !stat.total_time_ms.is_finite() || stat.total_time_ms < 0.0 {
            return Err(AnalysisError::InvalidSample { key });
        }

        let mut profiles = self.store()?;
        if let Some(profile) = profiles.get_mut(&key) {
            profile.fold(stat, now);
            return Ok(());
        }

        if self.settings.max_queries_tracked > 0 && profiles.len() >= self.settings.max_queries_tracked {
            let victim = profiles
                .values()
                .min_by(|a, b| a.last_seen.cmp(&b.last_seen).then_with(|| a.key.cmp(&b.key)))
                .map(|p| p.key.clone());
            if let Some(victim) = victim {
                debug!(key = %victim, "profile store full, evicting least recently seen");
                profiles.remove(&victim);
            }
        }
        profiles.insert(key.clone(), QueryPerformanceProfile::new(key, stat, now));
        Ok(())
    }

    /// Drops profiles whose `last_seen` left the analysis window.
    pub fn evict_expired(&self, now: i64) -> Result<usize, AnalysisError> {
        let mut profiles = self.store()?;
        let before = profiles.len();
        let cutoff = now - self.settings.analysis_window_secs;
        profiles.retain(|_, p| p.last_seen >= cutoff);
        Ok(before - profiles.len())
    }

    /// One capture tick: fetch, diff cumulative counters, fold, evict.
    pub fn capture(&self, provider: &dyn StatisticsProvider) -> Result<CaptureSummary, AnalysisError> {
        self.capture_at(provider, chrono::Utc::now().timestamp())
    }

    pub fn capture_at(
        &self,
        provider: &dyn StatisticsProvider,
        now: i64,
    ) -> Result<CaptureSummary, AnalysisError> {
        let records = provider.get_query_statistics(self.settings.statistics_limit)?;
        let fetched = records.len();

        let samples = if self.settings.cumulative_statistics {
            self.deltas.lock()?.observe(records, now)
        } else {
            records
        };

        let mut recorded = 0;
        for stat in &samples {
            match self.record_sample_at(stat, now) {
                Ok(()) => recorded += 1,
                Err(AnalysisError::InvalidSample { key }) => {
                    warn!(key = %key, "skipping sample with invalid execution time");
                }
                Err(e) => return Err(e),
            }
        }
        let evicted = self.evict_expired(now)?;

        debug!(fetched, recorded, evicted, "statistics captured");
        Ok(CaptureSummary {
            fetched,
            recorded,
            evicted,
        })
    }

    /// Snapshot of all profiles, ordered by key.
    pub fn profiles(&self) -> Result<Vec<QueryPerformanceProfile>, AnalysisError> {
        let mut out: Vec<_> = self.store()?.values().cloned().collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    pub fn profile(&self, key: &str) -> Result<Option<QueryPerformanceProfile>, AnalysisError> {
        Ok(self.store()?.get(key).cloned())
    }

    pub fn len(&self) -> usize {
        self.profiles.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs a full analysis pass over the current profiles.
    pub fn analyze(&self, optimizer: &Optimizer) -> Result<Arc<AnalysisReport>, AnalysisError> {
        self.analyze_at(optimizer, chrono::Utc::now().timestamp())
    }

    /// Runs a full analysis pass; the result replaces [`last_report`](Self::last_report).
    ///
    /// Works on a copy of the store, so profiles are never touched by a
    /// failed pass.
    pub fn analyze_at(
        &self,
        optimizer: &Optimizer,
        now: i64,
    ) -> Result<Arc<AnalysisReport>, AnalysisError> {
        let profiles = self.profiles()?;
        if let Some(bad) = profiles
            .iter()
            .find(|p| !p.total_time_ms.is_finite() || !p.mean_time_ms.is_finite())
        {
            return Err(AnalysisError::NonFinite {
                key: bad.key.clone(),
            });
        }

        let threshold = self.settings.slow_query_threshold_ms;

        let mut slow: Vec<&QueryPerformanceProfile> =
            profiles.iter().filter(|p| p.mean_time_ms > threshold).collect();
        slow.sort_by(|a, b| desc(a.impact_score(), b.impact_score()));

        let mut frequent: Vec<(&QueryPerformanceProfile, f64)> = profiles
            .iter()
            .map(|p| (p, p.calls_per_hour(now)))
            .filter(|(_, rate)| *rate > self.settings.high_frequency_calls_per_hour)
            .collect();
        frequent.sort_by(|a, b| desc(a.1, b.1));

        let mut inefficient: Vec<InefficientQuery> = profiles
            .iter()
            .filter(|p| p.efficiency() < INEFFICIENCY_THRESHOLD)
            .map(|p| InefficientQuery {
                key: p.key.clone(),
                efficiency: p.efficiency(),
                issues: issues(p, threshold),
            })
            .collect();
        inefficient.sort_by(|a, b| a.efficiency.total_cmp(&b.efficiency));

        let bottlenecks: Vec<Bottleneck> = all_bottleneck_rules()
            .iter()
            .filter_map(|rule| {
                let found = rule.evaluate(&profiles);
                if let Some(b) = &found {
                    debug!(rule = rule.id(), severity = ?b.severity, "bottleneck detected");
                }
                found
            })
            .collect();

        let recommendations = recommend(&slow, &frequent, optimizer);

        let report = Arc::new(AnalysisReport {
            generated_at: now,
            profile_count: profiles.len(),
            slow_queries: slow
                .iter()
                .map(|p| SlowQuery {
                    key: p.key.clone(),
                    sample_query: p.sample_query.clone(),
                    calls: p.total_calls,
                    mean_time_ms: p.mean_time_ms,
                    max_time_ms: p.max_time_ms,
                    impact_score: p.impact_score(),
                })
                .collect(),
            high_frequency: frequent
                .iter()
                .map(|(p, rate)| FrequentQuery {
                    key: p.key.clone(),
                    calls: p.total_calls,
                    calls_per_hour: *rate,
                })
                .collect(),
            inefficient,
            bottlenecks,
            recommendations,
        });

        info!(
            profiles = report.profile_count,
            slow = report.slow_queries.len(),
            frequent = report.high_frequency.len(),
            inefficient = report.inefficient.len(),
            bottlenecks = report.bottlenecks.len(),
            recommendations = report.recommendations.len(),
            "analysis pass completed"
        );

        *self.last_report.lock()? = Some(Arc::clone(&report));
        Ok(report)
    }

    pub fn last_report(&self) -> Option<Arc<AnalysisReport>> {
        self.last_report.lock().ok().and_then(|r| r.clone())
    }

    /// Slow queries from the last report; empty before the first pass.
    pub fn slow_queries(&self) -> Vec<SlowQuery> {
        self.last_report()
            .map(|r| r.slow_queries.clone())
            .unwrap_or_default()
    }

    pub fn performance_summary(&self) -> Result<PerformanceSummary, AnalysisError> {
        let profiles = self.profiles()?;
        let total_calls: u64 = profiles.iter().map(|p| p.total_calls).sum();
        let total_time: f64 = profiles.iter().map(|p| p.total_time_ms).sum();

        Ok(PerformanceSummary {
            total_queries: profiles.len(),
            total_calls,
            avg_execution_time_ms: if total_calls > 0 {
                total_time / total_calls as f64
            } else {
                0.0
            },
            slow_query_count: profiles
                .iter()
                .filter(|p| p.mean_time_ms > self.settings.slow_query_threshold_ms)
                .count(),
            most_frequent_query: profiles
                .iter()
                .max_by_key(|p| p.total_calls)
                .map(|p| p.key.clone()),
            slowest_query: profiles
                .iter()
                .max_by(|a, b| a.mean_time_ms.total_cmp(&b.mean_time_ms))
                .map(|p| p.key.clone()),
        })
    }

    /// Forgets all profiles, baselines and the last report.
    pub fn reset(&self) -> Result<(), AnalysisError> {
        self.store()?.clear();
        self.deltas.lock()?.reset();
        *self.last_report.lock()? = None;
        Ok(())
    }
}

fn desc(a: f64, b: f64) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

fn issues(p: &QueryPerformanceProfile, slow_threshold_ms: f64) -> Vec<QueryIssue> {
    let mut out = Vec::new();
    if p.mean_time_ms > slow_threshold_ms {
        out.push(QueryIssue::Slow);
    }
    if p.blocks_read_per_call() > HIGH_IO_BLOCKS_PER_CALL {
        out.push(QueryIssue::HighIo);
    }
    if p.rows_per_call() > LOW_SELECTIVITY_ROWS_PER_CALL {
        out.push(QueryIssue::LowSelectivity);
    }
    if p.total_calls > 1 && p.max_time_ms > p.mean_time_ms * HIGH_VARIANCE_FACTOR {
        out.push(QueryIssue::HighVariance);
    }
    out
}

fn recommend(
    slow: &[&QueryPerformanceProfile],
    frequent: &[(&QueryPerformanceProfile, f64)],
    optimizer: &Optimizer,
) -> Vec<Recommendation> {
    let mut out = Vec::new();

    let advisors = all_advisors();
    for profile in slow.iter().take(ADVISED_SLOW_QUERIES) {
        let ctx = AdviceContext {
            profile,
            optimizer,
        };
        for advisor in &advisors {
            let found = advisor.evaluate(&ctx);
            if !found.is_empty() {
                debug!(advisor = advisor.id(), key = %profile.key, count = found.len(), "advice");
            }
            out.extend(found);
        }
    }

    for (profile, rate) in frequent.iter().take(ADVISED_FREQUENT_QUERIES) {
        out.push(Recommendation {
            kind: RecommendationKind::Caching,
            priority: crate::optimizer::Priority::Medium,
            query_key: profile.key.clone(),
            table: None,
            columns: Vec::new(),
            message: format!("Runs {rate:.0} times per hour; cache its results"),
        });
    }

    let candidates = slow.iter().copied().chain(frequent.iter().map(|(p, _)| *p));
    for profile in candidates {
        if let Some(rec) = optimizer.recommend_from_query(profile) {
            out.push(Recommendation {
                kind: RecommendationKind::Index,
                priority: rec.priority,
                query_key: profile.key.clone(),
                message: format!(
                    "Create index on {}({}), estimated improvement {:.0}%",
                    rec.table,
                    rec.columns.join(", "),
                    rec.estimated_improvement_pct
                ),
                table: Some(rec.table),
                columns: rec.columns,
            });
        }
    }

    dedup_index_suggestions(&mut out);
    // stable: equal priorities keep discovery order
    out.sort_by(|a, b| b.priority.cmp(&a.priority));
    out
}

/// Keeps the first index suggestion per (table, column set).
fn dedup_index_suggestions(recs: &mut Vec<Recommendation>) {
    let mut seen = HashSet::new();
    recs.retain(|r| {
        if r.kind != RecommendationKind::Index {
            return true;
        }
        let mut cols = r.columns.clone();
        cols.sort();
        seen.insert((r.table.clone(), cols))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::{OptimizerSettings, Priority};
    use crate::provider::MockProvider;

    fn analyzer() -> Analyzer {
        Analyzer::new(AnalyzerSettings {
            cumulative_statistics: false,
            ..Default::default()
        })
    }

    fn stat(query: &str, calls: u64, total: f64) -> QueryStatRecord {
        QueryStatRecord {
            query_text: query.to_string(),
            calls,
            total_time_ms: total,
            mean_time_ms: total / calls.max(1) as f64,
            max_time_ms: total / calls.max(1) as f64,
            rows: calls,
            ..Default::default()
        }
    }

    #[test]
    fn samples_with_different_literals_fold_together() {
        let a = analyzer();
        a.record_sample_at(&stat("SELECT * FROM users WHERE id = 5", 10, 50.0), 0)
            .unwrap();
        a.record_sample_at(&stat("SELECT * FROM users WHERE id = 42", 20, 100.0), 1)
            .unwrap();
        a.record_sample_at(&stat("select * from users  where id=7", 30, 150.0), 2)
            .unwrap();
        // keyword case differs, so the third is its own pattern
        assert_eq!(a.len(), 2);

        let p = a.profile("SELECT * FROM users WHERE id=?").unwrap().unwrap();
        assert_eq!(p.total_calls, 30);
        assert_eq!(p.total_time_ms, 150.0);
        assert_eq!(p.mean_time_ms, 5.0);
    }

    #[test]
    fn three_samples_aggregate_exactly() {
        let a = analyzer();
        for (calls, total) in [(10, 50.0), (20, 100.0), (30, 150.0)] {
            a.record_sample_at(&stat("SELECT 1 FROM t WHERE x = 1", calls, total), 0)
                .unwrap();
        }
        let p = a.profiles().unwrap().pop().unwrap();
        assert_eq!((p.total_calls, p.total_time_ms, p.mean_time_ms), (60, 300.0, 5.0));
    }

    #[test]
    fn zero_call_samples_are_ignored() {
        let a = analyzer();
        a.record_sample_at(&stat("SELECT 1", 0, 0.0), 0).unwrap();
        assert!(a.is_empty());
    }

    #[test]
    fn non_finite_sample_rejected() {
        let a = analyzer();
        let err = a
            .record_sample_at(&stat("SELECT 1", 1, f64::NAN), 0)
            .unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidSample { .. }));
        assert!(a.is_empty());
    }

    #[test]
    fn capacity_evicts_least_recently_seen() {
        let a = Analyzer::new(AnalyzerSettings {
            max_queries_tracked: 2,
            cumulative_statistics: false,
            ..Default::default()
        });
        a.record_sample_at(&stat("SELECT a FROM t", 1, 1.0), 10).unwrap();
        a.record_sample_at(&stat("SELECT b FROM t", 1, 1.0), 20).unwrap();
        a.record_sample_at(&stat("SELECT a FROM t", 1, 1.0), 30).unwrap();
        a.record_sample_at(&stat("SELECT c FROM t", 1, 1.0), 40).unwrap();

        let keys: Vec<_> = a.profiles().unwrap().into_iter().map(|p| p.key).collect();
        assert_eq!(keys, vec!["SELECT a FROM t", "SELECT c FROM t"]);
    }

    #[test]
    fn window_eviction() {
        let a = Analyzer::new(AnalyzerSettings {
            analysis_window_secs: 100,
            cumulative_statistics: false,
            ..Default::default()
        });
        a.record_sample_at(&stat("SELECT a FROM t", 1, 1.0), 0).unwrap();
        a.record_sample_at(&stat("SELECT b FROM t", 1, 1.0), 150).unwrap();
        assert_eq!(a.evict_expired(200).unwrap(), 1);
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn slow_query_impact_score() {
        let a = analyzer();
        let mut s = stat("SELECT * FROM reports WHERE day = 1", 7, 14_000.0);
        s.max_time_ms = 6000.0;
        a.record_sample_at(&s, 0).unwrap();
        let opt = Optimizer::new(OptimizerSettings::default());
        let report = a.analyze_at(&opt, 3600).unwrap();

        assert_eq!(report.slow_queries.len(), 1);
        let slow = &report.slow_queries[0];
        assert_eq!(slow.mean_time_ms, 2000.0);
        assert_eq!(slow.impact_score, 7.0 * 2000.0 + 6000.0 * 0.1);
        assert_eq!(a.slow_queries(), report.slow_queries);
    }

    #[test]
    fn slow_queries_ranked_by_impact() {
        let a = analyzer();
        a.record_sample_at(&stat("SELECT a FROM t", 2, 4000.0), 0).unwrap();
        a.record_sample_at(&stat("SELECT b FROM t", 100, 300_000.0), 0)
            .unwrap();
        a.record_sample_at(&stat("SELECT c FROM t", 10, 100.0), 0).unwrap();
        let opt = Optimizer::new(OptimizerSettings::default());
        let report = a.analyze_at(&opt, 0).unwrap();
        let keys: Vec<_> = report.slow_queries.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["SELECT b FROM t", "SELECT a FROM t"]);
    }

    #[test]
    fn high_frequency_and_inefficient() {
        let a = analyzer();
        a.record_sample_at(&stat("SELECT a FROM t", 5000, 500.0), 0).unwrap();
        let mut heavy = stat("SELECT b FROM big", 10, 50_000.0);
        heavy.rows = 5;
        heavy.blocks_read = 20_000;
        heavy.max_time_ms = 60_000.0;
        a.record_sample_at(&heavy, 0).unwrap();

        let opt = Optimizer::new(OptimizerSettings::default());
        let report = a.analyze_at(&opt, 3600).unwrap();

        assert_eq!(report.high_frequency.len(), 1);
        assert_eq!(report.high_frequency[0].calls_per_hour, 5000.0);

        assert_eq!(report.inefficient.len(), 1);
        let issues = &report.inefficient[0].issues;
        assert!(issues.contains(&QueryIssue::Slow));
        assert!(issues.contains(&QueryIssue::HighIo));
        assert!(issues.contains(&QueryIssue::HighVariance));
        assert!(!issues.contains(&QueryIssue::LowSelectivity));

        let caching = report
            .recommendations
            .iter()
            .filter(|r| r.kind == RecommendationKind::Caching)
            .count();
        assert_eq!(caching, 1);
    }

    #[test]
    fn recommendations_sorted_and_deduplicated() {
        let a = analyzer();
        // same table/column from two slow patterns
        a.record_sample_at(&stat("SELECT * FROM users WHERE email = 'x'", 2000, 4_000_000.0), 0)
            .unwrap();
        a.record_sample_at(
            &stat("SELECT id FROM users WHERE email = 'x' AND 1 = 1", 2000, 4_000_000.0),
            0,
        )
        .unwrap();
        let opt = Optimizer::new(OptimizerSettings::default());
        let report = a.analyze_at(&opt, 3600).unwrap();

        let index_recs: Vec<_> = report
            .recommendations
            .iter()
            .filter(|r| r.kind == RecommendationKind::Index && r.table.as_deref() == Some("users"))
            .collect();
        assert_eq!(index_recs.len(), 1);
        assert_eq!(index_recs[0].columns, vec!["email".to_string()]);

        let priorities: Vec<Priority> = report.recommendations.iter().map(|r| r.priority).collect();
        let mut sorted = priorities.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(priorities, sorted);
    }

    #[test]
    fn performance_summary() {
        let a = analyzer();
        a.record_sample_at(&stat("SELECT a FROM t", 100, 100.0), 0).unwrap();
        a.record_sample_at(&stat("SELECT b FROM t", 10, 30_000.0), 0).unwrap();
        let s = a.performance_summary().unwrap();
        assert_eq!(s.total_queries, 2);
        assert_eq!(s.total_calls, 110);
        assert_eq!(s.avg_execution_time_ms, 30_100.0 / 110.0);
        assert_eq!(s.slow_query_count, 1);
        assert_eq!(s.most_frequent_query.as_deref(), Some("SELECT a FROM t"));
        assert_eq!(s.slowest_query.as_deref(), Some("SELECT b FROM t"));
    }

    #[test]
    fn capture_with_cumulative_counters() {
        let provider = MockProvider::typical_workload().with_cumulative_counters();
        let a = Analyzer::new(AnalyzerSettings::default());

        let first = a.capture_at(&provider, 0).unwrap();
        assert_eq!(first.fetched, 5);
        assert_eq!(first.recorded, 0);
        assert!(a.is_empty());

        let second = a.capture_at(&provider, 30).unwrap();
        assert_eq!(second.recorded, 5);
        let p = a.profile("UPDATE sessions SET last_seen=now()WHERE token=?").unwrap().unwrap();
        assert_eq!(p.total_calls, 80_000);
    }

    #[test]
    fn capture_provider_error_leaves_profiles() {
        let provider = MockProvider::typical_workload();
        let a = analyzer();
        a.capture_at(&provider, 0).unwrap();
        let before = a.len();
        provider.set_read_error(Some(ProviderError::Timeout(10)));
        assert!(matches!(
            a.capture_at(&provider, 30),
            Err(AnalysisError::Provider(ProviderError::Timeout(10)))
        ));
        assert_eq!(a.len(), before);
    }

    #[test]
    fn last_report_replaced() {
        let a = analyzer();
        let opt = Optimizer::new(OptimizerSettings::default());
        assert!(a.last_report().is_none());
        let r1 = a.analyze_at(&opt, 0).unwrap();
        a.record_sample_at(&stat("SELECT a FROM t", 1, 1.0), 0).unwrap();
        let r2 = a.analyze_at(&opt, 1).unwrap();
        assert_eq!(r1.profile_count, 0);
        assert!(Arc::ptr_eq(&a.last_report().unwrap(), &r2));
    }
}
