use serde::{Deserialize, Serialize};

use crate::provider::QueryStatRecord;

/// Aggregated statistics for one normalized query shape.
///
/// Only [`fold`](Self::fold) mutates the counters; `mean_time_ms` is always
/// `total_time_ms / total_calls`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPerformanceProfile {
    pub key: String,
    /// Raw text of the first sample, literals included.
    pub sample_query: String,
    pub total_calls: u64,
    pub total_time_ms: f64,
    pub mean_time_ms: f64,
    pub min_time_ms: f64,
    pub max_time_ms: f64,
    pub total_rows: u64,
    pub total_blocks_read: u64,
    pub first_seen: i64,
    pub last_seen: i64,
}

impl QueryPerformanceProfile {
    pub fn new(key: String, stat: &QueryStatRecord, now: i64) -> Self {
        let mut profile = Self {
            key,
            sample_query: stat.query_text.clone(),
            total_calls: 0,
            total_time_ms: 0.0,
            mean_time_ms: 0.0,
            min_time_ms: stat.min_time_ms,
            max_time_ms: stat.max_time_ms,
            total_rows: 0,
            total_blocks_read: 0,
            first_seen: now,
            last_seen: now,
        };
        profile.fold(stat, now);
        profile
    }

    /// Adds one sample's increments.
    pub fn fold(&mut self, stat: &QueryStatRecord, now: i64) {
        self.total_calls += stat.calls;
        self.total_time_ms += stat.total_time_ms;
        self.total_rows += stat.rows;
        self.total_blocks_read += stat.blocks_read;
        self.min_time_ms = self.min_time_ms.min(stat.min_time_ms);
        self.max_time_ms = self.max_time_ms.max(stat.max_time_ms);
        if self.total_calls > 0 {
            self.mean_time_ms = self.total_time_ms / self.total_calls as f64;
        }
        self.last_seen = self.last_seen.max(now);
    }

    /// `calls × mean + max × 0.1`
    pub fn impact_score(&self) -> f64 {
        self.total_calls as f64 * self.mean_time_ms + self.max_time_ms * 0.1
    }

    /// Calls per hour since first seen. Elapsed time is floored at one minute.
    pub fn calls_per_hour(&self, now: i64) -> f64 {
        let elapsed_secs = (now - self.first_seen).max(60);
        self.total_calls as f64 * 3600.0 / elapsed_secs as f64
    }

    /// Rows per millisecond scaled into 0..1; 1.0 when no time was recorded.
    pub fn efficiency(&self) -> f64 {
        if self.total_time_ms <= 0.0 {
            return 1.0;
        }
        ((self.total_rows as f64 / self.total_time_ms) / 10.0).min(1.0)
    }

    pub fn rows_per_call(&self) -> f64 {
        per_call(self.total_rows, self.total_calls)
    }

    pub fn blocks_read_per_call(&self) -> f64 {
        per_call(self.total_blocks_read, self.total_calls)
    }
}

fn per_call(total: u64, calls: u64) -> f64 {
    if calls == 0 {
        0.0
    } else {
        total as f64 / calls as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(calls: u64, total: f64) -> QueryStatRecord {
        QueryStatRecord {
            query_text: "SELECT * FROM t WHERE id = 1".to_string(),
            calls,
            total_time_ms: total,
            mean_time_ms: total / calls as f64,
            min_time_ms: 1.0,
            max_time_ms: 9.0,
            rows: calls,
            ..Default::default()
        }
    }

    #[test]
    fn folding_keeps_exact_mean() {
        let mut p = QueryPerformanceProfile::new("k".into(), &sample(10, 50.0), 100);
        p.fold(&sample(20, 100.0), 200);
        p.fold(&sample(30, 150.0), 300);
        assert_eq!(p.total_calls, 60);
        assert_eq!(p.total_time_ms, 300.0);
        assert_eq!(p.mean_time_ms, 5.0);
        assert_eq!(p.first_seen, 100);
        assert_eq!(p.last_seen, 300);
    }

    #[test]
    fn min_max_track_extremes() {
        let mut p = QueryPerformanceProfile::new("k".into(), &sample(1, 5.0), 0);
        let mut s = sample(1, 5.0);
        s.min_time_ms = 0.5;
        s.max_time_ms = 40.0;
        p.fold(&s, 1);
        assert_eq!(p.min_time_ms, 0.5);
        assert_eq!(p.max_time_ms, 40.0);
    }

    #[test]
    fn impact_score_formula() {
        let p = QueryPerformanceProfile {
            key: "k".into(),
            sample_query: String::new(),
            total_calls: 7,
            total_time_ms: 14_000.0,
            mean_time_ms: 2000.0,
            min_time_ms: 100.0,
            max_time_ms: 5000.0,
            total_rows: 0,
            total_blocks_read: 0,
            first_seen: 0,
            last_seen: 0,
        };
        assert_eq!(p.impact_score(), 7.0 * 2000.0 + 500.0);
    }

    #[test]
    fn calls_per_hour_floors_elapsed() {
        let p = QueryPerformanceProfile::new("k".into(), &sample(100, 100.0), 0);
        assert_eq!(p.calls_per_hour(0), 6000.0);
        assert_eq!(p.calls_per_hour(7200), 50.0);
    }

    #[test]
    fn efficiency_is_capped() {
        let p = QueryPerformanceProfile::new("k".into(), &sample(1000, 10.0), 0);
        assert_eq!(p.efficiency(), 1.0);
        let slow = QueryPerformanceProfile::new("k".into(), &sample(10, 10_000.0), 0);
        assert!(slow.efficiency() < 0.5);
    }
}
