//! Result types of one analysis pass.

use serde::{Deserialize, Serialize};

use crate::optimizer::Priority;

/// Bottleneck severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowQuery {
    pub key: String,
    pub sample_query: String,
    pub calls: u64,
    pub mean_time_ms: f64,
    pub max_time_ms: f64,
    pub impact_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequentQuery {
    pub key: String,
    pub calls: u64,
    pub calls_per_hour: f64,
}

/// Issue tags attached to inefficient queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIssue {
    /// Mean time above the slow query threshold.
    Slow,
    /// More than 1000 blocks read from disk per call.
    HighIo,
    /// More than 1000 rows per call.
    LowSelectivity,
    /// Max time more than 10x the mean.
    HighVariance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InefficientQuery {
    pub key: String,
    pub efficiency: f64,
    pub issues: Vec<QueryIssue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BottleneckKind {
    Io,
    Cpu,
    MemoryPressure,
}

/// Workload-wide problem found across all profiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bottleneck {
    pub kind: BottleneckKind,
    pub severity: Severity,
    pub description: String,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    /// Lexical rewrite hint for a slow query.
    QueryRewrite,
    /// Cache results of a high-frequency query.
    Caching,
    /// Create an index.
    Index,
}

/// One actionable item of an analysis report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub priority: Priority,
    /// Normalized key of the query this was derived from.
    pub query_key: String,
    pub table: Option<String>,
    pub columns: Vec<String>,
    pub message: String,
}

/// Output of [`Analyzer::analyze`](super::Analyzer::analyze).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub generated_at: i64,
    pub profile_count: usize,
    /// Descending by impact score.
    pub slow_queries: Vec<SlowQuery>,
    /// Descending by calls per hour.
    pub high_frequency: Vec<FrequentQuery>,
    /// Ascending by efficiency.
    pub inefficient: Vec<InefficientQuery>,
    pub bottlenecks: Vec<Bottleneck>,
    /// Descending by priority.
    pub recommendations: Vec<Recommendation>,
}

/// Aggregate numbers over the current profile set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub total_queries: usize,
    pub total_calls: u64,
    /// Σ time / Σ calls over all profiles.
    pub avg_execution_time_ms: f64,
    pub slow_query_count: usize,
    pub most_frequent_query: Option<String>,
    pub slowest_query: Option<String>,
}
