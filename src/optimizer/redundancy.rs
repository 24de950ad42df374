//! Redundant and unused index detection.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use super::catalog::IndexDescriptor;

/// Why the kept side of a redundant pair was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    /// Used more than 1.5x as often as the other.
    HigherUsage,
    /// Backs the primary key.
    PrimaryKey,
    /// Less than 0.8x the other's size.
    SmallerSize,
    /// No rule decided; the smaller one is kept.
    KeepSmaller,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedundancyReport {
    pub table: String,
    /// Index to keep.
    pub primary: String,
    /// Index that can be dropped.
    pub redundant: String,
    pub similarity: f64,
    pub retention: Retention,
}

/// Jaccard similarity of two column sets. Two empty sets are identical.
pub fn jaccard(a: &[String], b: &[String]) -> f64 {
    let a: HashSet<&str> = a.iter().map(String::as_str).collect();
    let b: HashSet<&str> = b.iter().map(String::as_str).collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

/// Picks the index to keep: returns `(keep, drop, reason)`.
fn retain<'a>(
    a: &'a IndexDescriptor,
    b: &'a IndexDescriptor,
) -> (&'a IndexDescriptor, &'a IndexDescriptor, Retention) {
    let (ua, ub) = (a.usage_count as f64, b.usage_count as f64);
    if ua > ub * 1.5 {
        return (a, b, Retention::HigherUsage);
    }
    if ub > ua * 1.5 {
        return (b, a, Retention::HigherUsage);
    }
    if a.is_primary != b.is_primary {
        return if a.is_primary {
            (a, b, Retention::PrimaryKey)
        } else {
            (b, a, Retention::PrimaryKey)
        };
    }
    let (sa, sb) = (a.size_bytes as f64, b.size_bytes as f64);
    if sa < sb * 0.8 {
        return (a, b, Retention::SmallerSize);
    }
    if sb < sa * 0.8 {
        return (b, a, Retention::SmallerSize);
    }
    if b.size_bytes < a.size_bytes {
        (b, a, Retention::KeepSmaller)
    } else {
        (a, b, Retention::KeepSmaller)
    }
}

/// Pairs of indexes on the same table whose column sets have
/// similarity strictly above `threshold`.
pub fn find_redundant(indexes: &[IndexDescriptor], threshold: f64) -> Vec<RedundancyReport> {
    let mut by_table: BTreeMap<&str, Vec<&IndexDescriptor>> = BTreeMap::new();
    for idx in indexes {
        by_table.entry(idx.table.as_str()).or_default().push(idx);
    }

    let mut out = Vec::new();
    for (table, mut group) in by_table {
        group.sort_by(|a, b| a.name.cmp(&b.name));
        for (i, a) in group.iter().enumerate() {
            for b in &group[i + 1..] {
                let similarity = jaccard(&a.columns, &b.columns);
                if similarity <= threshold {
                    continue;
                }
                let (keep, drop, retention) = retain(a, b);
                out.push(RedundancyReport {
                    table: table.to_string(),
                    primary: keep.name.clone(),
                    redundant: drop.name.clone(),
                    similarity,
                    retention,
                });
            }
        }
    }
    out
}

/// Non-constraint indexes not used within `unused_secs` of `now`.
///
/// An index never seen used is judged by when it was first discovered.
pub fn find_unused(indexes: &[IndexDescriptor], now: i64, unused_secs: i64) -> Vec<IndexDescriptor> {
    indexes
        .iter()
        .filter(|idx| !idx.is_constraint())
        .filter(|idx| now - idx.last_used.unwrap_or(idx.first_seen) > unused_secs)
        .cloned()
        .collect()
}
