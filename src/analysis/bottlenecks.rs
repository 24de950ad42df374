//! Workload-wide bottleneck rules.
//!
//! Rules see every profile at once. Each fires at most one [`Bottleneck`],
//! `Warning` above its threshold and `Critical` at ten times the threshold.

use super::QueryPerformanceProfile;
use super::report::{Bottleneck, BottleneckKind, Severity};

/// Σ blocks read from disk over all profiles.
pub const IO_BLOCKS_READ_THRESHOLD: u64 = 100_000;
/// Σ execution time (ms) over all profiles.
pub const CPU_TOTAL_TIME_THRESHOLD_MS: f64 = 10_000_000.0;
/// Mean time (ms) above which a profile counts toward memory pressure.
pub const MEMORY_SLOW_MEAN_MS: f64 = 2000.0;
/// Count of such profiles that signals memory pressure.
pub const MEMORY_SLOW_COUNT_THRESHOLD: usize = 10;
const MEMORY_SLOW_COUNT_CRITICAL: usize = 50;

pub trait BottleneckRule: Send + Sync {
    fn id(&self) -> &'static str;
    fn evaluate(&self, profiles: &[QueryPerformanceProfile]) -> Option<Bottleneck>;
}

pub fn all_bottleneck_rules() -> Vec<Box<dyn BottleneckRule>> {
    vec![
        Box::new(IoBottleneckRule),
        Box::new(CpuBottleneckRule),
        Box::new(MemoryPressureRule),
    ]
}

pub struct IoBottleneckRule;

impl BottleneckRule for IoBottleneckRule {
    fn id(&self) -> &'static str {
        "io"
    }

    fn evaluate(&self, profiles: &[QueryPerformanceProfile]) -> Option<Bottleneck> {
        let blocks: u64 = profiles.iter().map(|p| p.total_blocks_read).sum();
        if blocks <= IO_BLOCKS_READ_THRESHOLD {
            return None;
        }
        let severity = if blocks > IO_BLOCKS_READ_THRESHOLD * 10 {
            Severity::Critical
        } else {
            Severity::Warning
        };
        Some(Bottleneck {
            kind: BottleneckKind::Io,
            severity,
            description: format!("{blocks} blocks read from disk across the workload"),
            recommendations: vec![
                "Add indexes for sequential scans on large tables".to_string(),
                "Increase shared_buffers so the working set stays cached".to_string(),
            ],
        })
    }
}

pub struct CpuBottleneckRule;

impl BottleneckRule for CpuBottleneckRule {
    fn id(&self) -> &'static str {
        "cpu"
    }

    fn evaluate(&self, profiles: &[QueryPerformanceProfile]) -> Option<Bottleneck> {
        let total: f64 = profiles.iter().map(|p| p.total_time_ms).sum();
        if total <= CPU_TOTAL_TIME_THRESHOLD_MS {
            return None;
        }
        let severity = if total > CPU_TOTAL_TIME_THRESHOLD_MS * 10.0 {
            Severity::Critical
        } else {
            Severity::Warning
        };
        Some(Bottleneck {
            kind: BottleneckKind::Cpu,
            severity,
            description: format!("{:.0} s of total execution time", total / 1000.0),
            recommendations: vec![
                "Optimize the slowest queries first; they dominate execution time".to_string(),
                "Cache results of frequent read-only queries".to_string(),
            ],
        })
    }
}

pub struct MemoryPressureRule;

impl BottleneckRule for MemoryPressureRule {
    fn id(&self) -> &'static str {
        "memory_pressure"
    }

    fn evaluate(&self, profiles: &[QueryPerformanceProfile]) -> Option<Bottleneck> {
        let slow = profiles
            .iter()
            .filter(|p| p.mean_time_ms > MEMORY_SLOW_MEAN_MS)
            .count();
        if slow <= MEMORY_SLOW_COUNT_THRESHOLD {
            return None;
        }
        let severity = if slow > MEMORY_SLOW_COUNT_CRITICAL {
            Severity::Critical
        } else {
            Severity::Warning
        };
        Some(Bottleneck {
            kind: BottleneckKind::MemoryPressure,
            severity,
            description: format!("{slow} query patterns average over {MEMORY_SLOW_MEAN_MS:.0} ms"),
            recommendations: vec![
                "Raise work_mem for sort- and hash-heavy queries".to_string(),
                "Check for spills to temporary files".to_string(),
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::QueryStatRecord;

    fn profile(key: &str, calls: u64, total_ms: f64, blocks: u64) -> QueryPerformanceProfile {
        let stat = QueryStatRecord {
            query_text: key.to_string(),
            calls,
            total_time_ms: total_ms,
            blocks_read: blocks,
            ..Default::default()
        };
        QueryPerformanceProfile::new(key.to_string(), &stat, 0)
    }

    #[test]
    fn io_rule_thresholds() {
        assert!(IoBottleneckRule.evaluate(&[profile("a", 1, 1.0, 100_000)]).is_none());
        let b = IoBottleneckRule
            .evaluate(&[profile("a", 1, 1.0, 60_000), profile("b", 1, 1.0, 60_000)])
            .unwrap();
        assert_eq!(b.severity, Severity::Warning);
        let b = IoBottleneckRule.evaluate(&[profile("a", 1, 1.0, 1_000_001)]).unwrap();
        assert_eq!(b.severity, Severity::Critical);
    }

    #[test]
    fn cpu_rule_thresholds() {
        assert!(CpuBottleneckRule.evaluate(&[profile("a", 1, 9_000_000.0, 0)]).is_none());
        let b = CpuBottleneckRule.evaluate(&[profile("a", 1, 20_000_000.0, 0)]).unwrap();
        assert_eq!(b.kind, BottleneckKind::Cpu);
        assert_eq!(b.severity, Severity::Warning);
    }

    #[test]
    fn memory_pressure_needs_more_than_ten_slow_patterns() {
        let ten: Vec<_> = (0..10).map(|i| profile(&format!("q{i}"), 1, 3000.0, 0)).collect();
        assert!(MemoryPressureRule.evaluate(&ten).is_none());
        let eleven: Vec<_> = (0..11).map(|i| profile(&format!("q{i}"), 1, 3000.0, 0)).collect();
        assert_eq!(
            MemoryPressureRule.evaluate(&eleven).unwrap().severity,
            Severity::Warning
        );
    }
}
