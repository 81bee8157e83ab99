//! Pipeline counters.
//!
//! Lock-free counters bumped at each stage transition and exposed through
//! `GET /metrics`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Cumulative counters for one pipeline run.
#[derive(Debug)]
pub struct PipelineStats {
    pub events_received: AtomicU64,
    pub duplicates: AtomicU64,
    pub rejected: AtomicU64,
    pub qualified: AtomicU64,
    pub expired: AtomicU64,
    pub requeued: AtomicU64,
    pub analyses_started: AtomicU64,
    pub reports_published: AtomicU64,
    pub degraded_reports: AtomicU64,
    pub publish_failures: AtomicU64,
    pub dedup_evictions: AtomicU64,
    start_time: Instant,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            events_received: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            qualified: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
            analyses_started: AtomicU64::new(0),
            reports_published: AtomicU64::new(0),
            degraded_reports: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            dedup_evictions: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            events_received: load(&self.events_received),
            duplicates: load(&self.duplicates),
            rejected: load(&self.rejected),
            qualified: load(&self.qualified),
            expired: load(&self.expired),
            requeued: load(&self.requeued),
            analyses_started: load(&self.analyses_started),
            reports_published: load(&self.reports_published),
            degraded_reports: load(&self.degraded_reports),
            publish_failures: load(&self.publish_failures),
            dedup_evictions: load(&self.dedup_evictions),
        }
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub events_received: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub qualified: u64,
    pub expired: u64,
    pub requeued: u64,
    pub analyses_started: u64,
    pub reports_published: u64,
    pub degraded_reports: u64,
    pub publish_failures: u64,
    pub dedup_evictions: u64,
}

/// Format uptime as human-readable ("42s", "3m 5s", "2h 0m 7s").
pub fn format_uptime(uptime: u64) -> String {
    if uptime < 60 {
        format!("{}s", uptime)
    } else if uptime < 3600 {
        format!("{}m {}s", uptime / 60, uptime % 60)
    } else {
        format!("{}h {}m {}s", uptime / 3600, (uptime % 3600) / 60, uptime % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = PipelineStats::new();
        PipelineStats::incr(&stats.events_received);
        PipelineStats::incr(&stats.events_received);
        PipelineStats::add(&stats.expired, 3);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.events_received, 2);
        assert_eq!(snapshot.expired, 3);
        assert_eq!(snapshot.reports_published, 0);
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(42), "42s");
        assert_eq!(format_uptime(185), "3m 5s");
        assert_eq!(format_uptime(7207), "2h 0m 7s");
    }
}
