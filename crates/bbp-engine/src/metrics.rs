//! Per-persist metrics.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Number of recent persist attempts kept.
pub const MAX_RECENT_METRICS: usize = 100;

/// One persist attempt.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PersistenceMetric {
    /// Delta name (`_NNNNN`), or `-` when no delta number was assigned.
    pub name: String,
    pub medium: String,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub bytes: usize,
    pub full: bool,
    pub failure: Option<String>,
}

impl PersistenceMetric {
    pub fn elapsed_millis(&self) -> i64 {
        (self.finished - self.started).num_milliseconds()
    }

    pub fn failed(&self) -> bool {
        self.failure.is_some()
    }
}

impl fmt::Display for PersistenceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} bytes in {} ms on {}",
            if self.full { "full" } else { "delta" },
            self.name,
            self.bytes,
            self.elapsed_millis(),
            self.medium
        )?;
        if let Some(failure) = &self.failure {
            write!(f, " FAILED: {failure}")?;
        }
        Ok(())
    }
}

/// Running totals over every recorded attempt.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetricsTotals {
    pub count: u64,
    pub full_count: u64,
    pub failed_count: u64,
    pub total_bytes: u64,
    pub total_millis: i64,
}

impl MetricsTotals {
    pub fn average_bytes(&self) -> u64 {
        self.total_bytes.checked_div(self.count).unwrap_or(0)
    }
}

/// Serializable view of [`PersistenceMetrics`].
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub recent: Vec<PersistenceMetric>,
    pub totals: MetricsTotals,
}

/// Recent attempts plus totals.
#[derive(Debug, Default)]
pub struct PersistenceMetrics {
    recent: VecDeque<PersistenceMetric>,
    totals: MetricsTotals,
}

impl PersistenceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, metric: PersistenceMetric) {
        self.totals.count += 1;
        if metric.full {
            self.totals.full_count += 1;
        }
        if metric.failed() {
            self.totals.failed_count += 1;
        }
        self.totals.total_bytes += metric.bytes as u64;
        self.totals.total_millis += metric.elapsed_millis();
        if self.recent.len() == MAX_RECENT_METRICS {
            self.recent.pop_front();
        }
        self.recent.push_back(metric);
    }

    /// Oldest first.
    pub fn recent(&self) -> impl Iterator<Item = &PersistenceMetric> {
        self.recent.iter()
    }

    pub fn last(&self) -> Option<&PersistenceMetric> {
        self.recent.back()
    }

    pub fn totals(&self) -> MetricsTotals {
        self.totals
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            recent: self.recent.iter().cloned().collect(),
            totals: self.totals,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(bytes: usize, full: bool, failure: Option<&str>) -> PersistenceMetric {
        let started = Utc::now();
        PersistenceMetric {
            name: "_00001".into(),
            medium: "P".into(),
            started,
            finished: started + chrono::Duration::milliseconds(7),
            bytes,
            full,
            failure: failure.map(str::to_string),
        }
    }

    #[test]
    fn keeps_a_bounded_window_and_full_totals() {
        let mut m = PersistenceMetrics::new();
        for i in 0..(MAX_RECENT_METRICS + 5) {
            m.record(metric(10, i % 2 == 0, None));
        }
        m.record(metric(0, false, Some("disk full")));
        assert_eq!(m.recent().count(), MAX_RECENT_METRICS);
        let t = m.totals();
        assert_eq!(t.count, MAX_RECENT_METRICS as u64 + 6);
        assert_eq!(t.failed_count, 1);
        assert_eq!(t.full_count, 53);
        assert_eq!(t.total_bytes, 1050);
        assert_eq!(t.total_millis, 7 * t.count as i64);
        assert!(m.last().unwrap().failed());
    }

    #[test]
    fn snapshot_serializes() {
        let mut m = PersistenceMetrics::new();
        m.record(metric(42, true, None));
        let json = serde_json::to_value(m.snapshot()).unwrap();
        assert_eq!(json["totals"]["total_bytes"], 42);
        assert_eq!(json["recent"][0]["name"], "_00001");
        assert!(metric(1, true, Some("x")).to_string().ends_with("FAILED: x"));
    }
}
