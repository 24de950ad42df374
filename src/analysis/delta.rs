//! Conversion of cumulative statement counters into per-interval deltas.
//!
//! `pg_stat_statements` reports lifetime totals. The aggregator folds
//! increments, so each capture is diffed against the previous one:
//! - first observation of a statement is a baseline only
//! - a counter that went backwards means the stats were reset; the current
//!   value is taken as the delta
//! - entries not seen for `MAX_STALE_SECS` are dropped

use std::collections::HashMap;

use crate::provider::QueryStatRecord;

/// Maximum age (seconds) of a baseline that was not refreshed by a capture.
pub const MAX_STALE_SECS: i64 = 3600;

/// Compute u64 delta, returning `None` on counter regression (stats reset).
fn du64(curr: u64, prev: u64) -> Option<u64> {
    (curr >= prev).then_some(curr - prev)
}

/// Compute f64 delta, returning `None` on counter regression (stats reset).
fn df64(curr: f64, prev: f64) -> Option<f64> {
    (curr >= prev).then_some(curr - prev)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum StatKey {
    Id(i64),
    Text(String),
}

impl StatKey {
    fn of(record: &QueryStatRecord) -> Self {
        match record.query_id {
            Some(id) => StatKey::Id(id),
            None => StatKey::Text(record.query_text.clone()),
        }
    }
}

#[derive(Debug)]
struct Baseline {
    record: QueryStatRecord,
    seen_at: i64,
}

/// Previous cumulative sample per statement.
#[derive(Debug, Default)]
pub struct DeltaTracker {
    prev_sample: HashMap<StatKey, Baseline>,
}

impl DeltaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of statements with a stored baseline.
    pub fn len(&self) -> usize {
        self.prev_sample.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prev_sample.is_empty()
    }

    pub fn reset(&mut self) {
        self.prev_sample.clear();
    }

    /// Diffs one capture against the stored baselines.
    ///
    /// Returns only records with new calls since the previous capture.
    pub fn observe(&mut self, records: Vec<QueryStatRecord>, now: i64) -> Vec<QueryStatRecord> {
        let mut deltas = Vec::new();

        for record in records {
            let key = StatKey::of(&record);
            let delta = match self.prev_sample.get(&key) {
                None => None,
                Some(prev) => Some(diff(&record, &prev.record)),
            };
            if let Some(d) = delta.filter(|d| d.calls > 0) {
                deltas.push(d);
            }
            self.prev_sample.insert(
                key,
                Baseline {
                    record,
                    seen_at: now,
                },
            );
        }

        self.prev_sample
            .retain(|_, b| now - b.seen_at <= MAX_STALE_SECS);
        deltas
    }
}

fn diff(curr: &QueryStatRecord, prev: &QueryStatRecord) -> QueryStatRecord {
    let increments = du64(curr.calls, prev.calls).and_then(|calls| {
        Some((
            calls,
            df64(curr.total_time_ms, prev.total_time_ms)?,
            du64(curr.rows, prev.rows)?,
            du64(curr.blocks_read, prev.blocks_read)?,
            du64(curr.blocks_hit, prev.blocks_hit)?,
        ))
    });

    let Some((calls, total_time_ms, rows, blocks_read, blocks_hit)) = increments else {
        // reset between captures
        return curr.clone();
    };

    let mean_time_ms = if calls > 0 {
        total_time_ms / calls as f64
    } else {
        0.0
    };
    QueryStatRecord {
        query_id: curr.query_id,
        query_text: curr.query_text.clone(),
        calls,
        total_time_ms,
        mean_time_ms,
        // lifetime extremes; interval extremes are not observable
        min_time_ms: curr.min_time_ms,
        max_time_ms: curr.max_time_ms,
        rows,
        blocks_read,
        blocks_hit,
    }
}
