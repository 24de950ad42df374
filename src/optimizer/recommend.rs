//! Index recommendations derived from query patterns.
//!
//! Column extraction is a text heuristic over the WHERE clause: every
//! `column OP` with OP in `=`, `>`, `<`, `IN`, `LIKE` names a candidate key
//! column. Scores follow
//! `(calls / 100) × (mean_ms / 10) × selectivity × complexity`.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use super::catalog::canonical_table;
use crate::analysis::QueryPerformanceProfile;

/// PostgreSQL's identifier limit (NAMEDATALEN - 1).
pub const MAX_IDENTIFIER_LEN: usize = 63;
/// Recommendations scoring at or below this are discarded.
pub const MIN_BENEFIT_SCORE: f64 = 50.0;

static TABLE_TARGET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:from|update)\s+([a-z_"][\w."$]*)"#).expect("valid regex")
});
static WHERE_KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bwhere\b").expect("valid regex"));
static CLAUSE_END: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:order\s+by|group\s+by|having|limit|offset|returning|union|for\s+update)\b")
        .expect("valid regex")
});
static COLUMN_OP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)([a-z_"][\w."$]*)\s*(?:=|<|>|\s(?:in|like)\b)"#).expect("valid regex")
});

const NOT_COLUMNS: &[&str] = &[
    "and", "or", "not", "where", "is", "null", "true", "false", "exists", "between", "case",
    "when", "then", "else", "end", "select", "from", "on", "as", "in", "like", "ilike", "any",
    "all", "some", "interval",
];

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(format!("unknown priority {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecommendation {
    /// Deterministic index name; doubles as the recommendation id.
    pub id: String,
    pub table: String,
    pub columns: Vec<String>,
    pub benefit_score: f64,
    pub estimated_improvement_pct: f64,
    pub priority: Priority,
    /// Normalized keys of the queries that asked for this index.
    pub source_queries: Vec<String>,
    pub estimated_size_bytes: u64,
}

/// Last path segment, unquoted and lowercased: `"U".Email` → `email`.
pub fn unqualify(name: &str) -> String {
    let name = name.trim().replace('"', "");
    name.rsplit('.').next().unwrap_or(&name).to_ascii_lowercase()
}

/// First `FROM` / `UPDATE` / `DELETE FROM` target, canonicalized.
pub fn extract_table(query: &str) -> Option<String> {
    TABLE_TARGET
        .captures(query)
        .map(|c| canonical_table(&c[1]))
}

/// Distinct columns compared in the WHERE clause, in order of appearance.
pub fn extract_where_columns(query: &str) -> Vec<String> {
    let Some(m) = WHERE_KEYWORD.find(query) else {
        return Vec::new();
    };
    let clause = &query[m.end()..];
    let clause = match CLAUSE_END.find(clause) {
        Some(end) => &clause[..end.start()],
        None => clause,
    };

    let mut columns: Vec<String> = Vec::new();
    for caps in COLUMN_OP.captures_iter(clause) {
        let column = unqualify(&caps[1]);
        if NOT_COLUMNS.contains(&column.as_str()) || columns.contains(&column) {
            continue;
        }
        columns.push(column);
    }
    columns
}

/// Selectivity correction from rows returned per call.
fn selectivity(rows_per_call: f64) -> f64 {
    if rows_per_call > 1000.0 {
        0.5
    } else if rows_per_call > 100.0 {
        0.7
    } else {
        1.0
    }
}

/// Multi-column indexes are discounted: `max(0.5, 1 - (n - 1) × 0.2)`.
fn complexity(columns: usize) -> f64 {
    (1.0 - (columns.saturating_sub(1)) as f64 * 0.2).max(0.5)
}

pub fn benefit_score(profile: &QueryPerformanceProfile, columns: usize) -> f64 {
    (profile.total_calls as f64 / 100.0)
        * (profile.mean_time_ms / 10.0)
        * selectivity(profile.rows_per_call())
        * complexity(columns)
}

pub fn priority_for(score: f64, calls: u64) -> Priority {
    if score > 200.0 && calls > 5000 {
        Priority::Urgent
    } else if score > 100.0 && calls > 1000 {
        Priority::High
    } else if score > 50.0 {
        Priority::Medium
    } else {
        Priority::Low
    }
}

/// `idx_<table>_<cols>_<hash>`, at most 63 bytes, stable for a given
/// table and ordered column list.
pub fn index_name(table: &str, columns: &[String]) -> String {
    let hash = xxh3_64(format!("{table}:{}", columns.join(",")).as_bytes()) as u32;
    let suffix = format!("_{hash:08x}");

    let mut prefix: String = format!("idx_{table}_{}", columns.join("_"))
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    prefix.truncate(MAX_IDENTIFIER_LEN - suffix.len());
    let prefix = prefix.trim_end_matches('_');
    format!("{prefix}{suffix}")
}

/// Rough btree size: 8 bytes of overhead plus 16 per key column per row.
fn estimate_size(profile: &QueryPerformanceProfile, columns: usize) -> u64 {
    let rows = profile.total_rows.max(1000);
    rows.saturating_mul(8 + 16 * columns as u64)
}

/// Builds the recommendation for one profile, without catalog checks.
pub fn recommend(profile: &QueryPerformanceProfile) -> Option<IndexRecommendation> {
    let table = extract_table(&profile.key)?;
    let columns = extract_where_columns(&profile.key);
    if columns.is_empty() {
        return None;
    }

    let score = benefit_score(profile, columns.len());
    if score.is_nan() || score <= MIN_BENEFIT_SCORE {
        return None;
    }

    Some(IndexRecommendation {
        id: index_name(&table, &columns),
        estimated_improvement_pct: (profile.mean_time_ms * score / 10.0).min(90.0),
        priority: priority_for(score, profile.total_calls),
        benefit_score: score,
        source_queries: vec![profile.key.clone()],
        estimated_size_bytes: estimate_size(profile, columns.len()),
        table,
        columns,
    })
}

/// Merges recommendations sharing a (table, sorted column set) key.
///
/// The merged entry keeps the first column order and id, the highest score,
/// improvement, size and priority, and the union of source queries. Output is
/// ordered by descending score, then id.
pub fn consolidate_recommendations(recs: Vec<IndexRecommendation>) -> Vec<IndexRecommendation> {
    let mut groups: BTreeMap<(String, Vec<String>), IndexRecommendation> = BTreeMap::new();

    for rec in recs {
        let mut sorted = rec.columns.clone();
        sorted.sort();
        match groups.get_mut(&(rec.table.clone(), sorted.clone())) {
            Some(merged) => {
                merged.benefit_score = merged.benefit_score.max(rec.benefit_score);
                merged.estimated_improvement_pct = merged
                    .estimated_improvement_pct
                    .max(rec.estimated_improvement_pct);
                merged.estimated_size_bytes = merged.estimated_size_bytes.max(rec.estimated_size_bytes);
                merged.priority = merged.priority.max(rec.priority);
                for q in rec.source_queries {
                    if !merged.source_queries.contains(&q) {
                        merged.source_queries.push(q);
                    }
                }
            }
            None => {
                groups.insert((rec.table.clone(), sorted), rec);
            }
        }
    }

    let mut out: Vec<_> = groups.into_values().collect();
    out.sort_by(|a, b| {
        b.benefit_score
            .total_cmp(&a.benefit_score)
            .then_with(|| a.id.cmp(&b.id))
    });
    out
}
