//! Bounded snapshot history and trend computation.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::HealthSnapshot;
use super::checks::HealthStatus;

/// Snapshots considered by [`HealthHistory::trends`].
pub const TREND_WINDOW: usize = 24;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history file I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("history file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthTrends {
    /// Snapshots the figures below were computed over.
    pub samples: usize,
    pub healthy: usize,
    pub warning: usize,
    pub critical: usize,
    pub unknown: usize,
    /// `(healthy + warning) / samples * 100`; zero without samples.
    pub uptime_pct: f64,
}

/// Ring buffer of the most recent snapshots, oldest first.
#[derive(Debug, Clone)]
pub struct HealthHistory {
    capacity: usize,
    entries: VecDeque<HealthSnapshot>,
}

impl HealthHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a snapshot, evicting the oldest when full.
    pub fn push(&mut self, snapshot: HealthSnapshot) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(snapshot);
    }

    pub fn latest(&self) -> Option<&HealthSnapshot> {
        self.entries.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HealthSnapshot> {
        self.entries.iter()
    }

    /// The last `n` snapshots, oldest first.
    pub fn recent(&self, n: usize) -> Vec<HealthSnapshot> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn trends(&self) -> HealthTrends {
        let mut t = HealthTrends::default();
        for s in self.recent(TREND_WINDOW) {
            t.samples += 1;
            match s.overall_status {
                HealthStatus::Healthy => t.healthy += 1,
                HealthStatus::Warning => t.warning += 1,
                HealthStatus::Critical => t.critical += 1,
                HealthStatus::Unknown => t.unknown += 1,
            }
        }
        if t.samples > 0 {
            t.uptime_pct = (t.healthy + t.warning) as f64 / t.samples as f64 * 100.0;
        }
        t
    }

    /// Writes the history as a JSON array. The file is replaced atomically.
    pub fn save(&self, path: &Path) -> Result<(), HistoryError> {
        let tmp_path = path.with_extension("json.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &self.entries)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Loads a history written by [`save`](Self::save). Only the newest
    /// `capacity` snapshots are kept.
    pub fn load(path: &Path, capacity: usize) -> Result<Self, HistoryError> {
        let reader = BufReader::new(File::open(path)?);
        let entries: Vec<HealthSnapshot> = serde_json::from_reader(reader)?;
        let mut history = Self::new(capacity);
        for s in entries {
            history.push(s);
        }
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(ts: i64, status: HealthStatus) -> HealthSnapshot {
        HealthSnapshot {
            overall_status: status,
            timestamp: ts,
            results: Vec::new(),
            duration_ms: 1,
            metrics_error: None,
        }
    }

    #[test]
    fn ring_buffer_keeps_newest() {
        let mut h = HealthHistory::new(100);
        for i in 0..150 {
            h.push(snapshot(i, HealthStatus::Healthy));
        }
        assert_eq!(h.len(), 100);
        assert_eq!(h.iter().next().unwrap().timestamp, 50);
        assert_eq!(h.latest().unwrap().timestamp, 149);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut h = HealthHistory::new(0);
        h.push(snapshot(1, HealthStatus::Healthy));
        h.push(snapshot(2, HealthStatus::Healthy));
        assert_eq!(h.len(), 1);
        assert_eq!(h.latest().unwrap().timestamp, 2);
    }

    #[test]
    fn trends_over_last_window() {
        let mut h = HealthHistory::new(100);
        // 10 old critical snapshots fall outside the window
        for i in 0..10 {
            h.push(snapshot(i, HealthStatus::Critical));
        }
        for i in 10..28 {
            h.push(snapshot(i, HealthStatus::Healthy));
        }
        for i in 28..31 {
            h.push(snapshot(i, HealthStatus::Warning));
        }
        for i in 31..34 {
            h.push(snapshot(i, HealthStatus::Critical));
        }
        let t = h.trends();
        assert_eq!(t.samples, 24);
        assert_eq!((t.healthy, t.warning, t.critical, t.unknown), (18, 3, 3, 0));
        assert!((t.uptime_pct - 87.5).abs() < 1e-9);
    }

    #[test]
    fn trends_empty() {
        let t = HealthHistory::new(10).trends();
        assert_eq!(t.samples, 0);
        assert_eq!(t.uptime_pct, 0.0);
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let mut h = HealthHistory::new(10);
        for i in 0..5 {
            h.push(snapshot(i, HealthStatus::Warning));
        }
        h.save(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = HealthHistory::load(&path, 3).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.iter().next().unwrap().timestamp, 2);
    }

    #[test]
    fn load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        fs::write(&path, b"not json").unwrap();
        assert!(matches!(
            HealthHistory::load(&path, 10),
            Err(HistoryError::Json(_))
        ));
        assert!(matches!(
            HealthHistory::load(&dir.path().join("missing.json"), 10),
            Err(HistoryError::Io(_))
        ));
    }
}
