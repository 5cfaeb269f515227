// src/sync/diagnostics.rs
//! Process-lifetime counters for the sync engine.
//!
//! Only totals are stored. Averages are derived in [`Diagnostics::snapshot`]
//! and are `None` (JSON `null`) while their divisor is zero.

use std::sync::Mutex;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::OnceCell;
use serde::Serialize;

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("sync_requests_total", "Requests issued per sync phase.");
        describe_counter!("sync_errors_total", "Failed requests per sync phase.");
        describe_counter!(
            "sync_retries_total",
            "Extra attempts spent on server errors per sync phase."
        );
        describe_histogram!("sync_request_ms", "Request time per sync phase in milliseconds.");
        describe_counter!("sync_postings_upserted_total", "Postings written to the store.");
        describe_counter!("sync_postings_removed_total", "Postings removed from the store.");
        describe_counter!("sync_runs_total", "Sync cycles started.");
        describe_counter!(
            "sync_triggers_skipped_total",
            "Schedule triggers dropped because a cycle was still running."
        );
    });
}

/// The three request phases of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Resolving a cursor from a timestamp.
    Anchors,
    /// Reading a batch from the feed.
    Polling,
    /// Writing to or deleting from the store.
    Postings,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Anchors => "anchors",
            Phase::Polling => "polling",
            Phase::Postings => "postings",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct PhaseCounters {
    requests: u64,
    errors: u64,
    time_ms: u64,
    retries: u64,
}

#[derive(Debug, Default)]
struct Counters {
    anchors: PhaseCounters,
    polling: PhaseCounters,
    postings: PhaseCounters,
    removed: u64,
    upserted: u64,
    dispatch_cycles: u64,
    runs: u64,
    skipped: u64,
}

impl Counters {
    fn phase_mut(&mut self, phase: Phase) -> &mut PhaseCounters {
        match phase {
            Phase::Anchors => &mut self.anchors,
            Phase::Polling => &mut self.polling,
            Phase::Postings => &mut self.postings,
        }
    }
}

/// Per-phase view with the derived average.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseStatus {
    pub total_request_count: u64,
    pub total_error_count: u64,
    pub total_retry_count: u64,
    /// Milliseconds.
    pub total_request_time: u64,
    pub average_request_time: Option<f64>,
}

impl From<PhaseCounters> for PhaseStatus {
    fn from(c: PhaseCounters) -> Self {
        Self {
            total_request_count: c.requests,
            total_error_count: c.errors,
            total_retry_count: c.retries,
            total_request_time: c.time_ms,
            average_request_time: average(c.time_ms, c.requests),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostingsStatus {
    #[serde(flatten)]
    pub requests: PhaseStatus,
    pub total_postings_removed: u64,
    pub total_postings_upserted: u64,
    /// Postings dispatched per cycle that had anything to dispatch.
    pub average_posting_count: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleStatus {
    pub interval: String,
    pub total_run_count: u64,
    pub total_skipped_count: u64,
}

/// Point-in-time copy of every counter plus derived averages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub anchors: PhaseStatus,
    pub polling: PhaseStatus,
    pub postings: PostingsStatus,
    pub schedule: ScheduleStatus,
}

fn average(total: u64, count: u64) -> Option<f64> {
    if count == 0 {
        None
    } else {
        Some(total as f64 / count as f64)
    }
}

/// Thread-safe diagnostics aggregator shared by the engine and the status route.
#[derive(Debug)]
pub struct Diagnostics {
    inner: Mutex<Counters>,
    interval: Mutex<String>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl Diagnostics {
    pub fn new() -> Self {
        ensure_metrics_described();
        Self {
            inner: Mutex::new(Counters::default()),
            interval: Mutex::new(String::new()),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Counters) -> R) -> R {
        // Counters stay usable even if a holder panicked mid-update.
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    /// Count one request for `phase`.
    pub fn record(&self, phase: Phase, elapsed: Duration, succeeded: bool) {
        let ms = elapsed.as_millis().min(u64::MAX as u128) as u64;
        self.with(|c| {
            let p = c.phase_mut(phase);
            p.requests += 1;
            p.time_ms = p.time_ms.saturating_add(ms);
            if !succeeded {
                p.errors += 1;
            }
        });
        counter!("sync_requests_total", "phase" => phase.label()).increment(1);
        histogram!("sync_request_ms", "phase" => phase.label()).record(ms as f64);
        if !succeeded {
            counter!("sync_errors_total", "phase" => phase.label()).increment(1);
        }
    }

    pub fn record_retries(&self, phase: Phase, retries: u32) {
        if retries == 0 {
            return;
        }
        self.with(|c| c.phase_mut(phase).retries += u64::from(retries));
        counter!("sync_retries_total", "phase" => phase.label()).increment(u64::from(retries));
    }

    pub fn record_removed(&self, n: usize) {
        self.with(|c| c.removed += n as u64);
        counter!("sync_postings_removed_total").increment(n as u64);
    }

    pub fn record_upserted(&self, n: usize) {
        self.with(|c| c.upserted += n as u64);
        counter!("sync_postings_upserted_total").increment(n as u64);
    }

    /// A cycle reached the dispatch step with at least one posting.
    pub fn record_dispatch_cycle(&self) {
        self.with(|c| c.dispatch_cycles += 1);
    }

    pub fn record_run(&self) {
        self.with(|c| c.runs += 1);
        counter!("sync_runs_total").increment(1);
    }

    pub fn record_skipped_trigger(&self) {
        self.with(|c| c.skipped += 1);
        counter!("sync_triggers_skipped_total").increment(1);
    }

    pub fn set_interval(&self, interval: &str) {
        let mut g = self.interval.lock().unwrap_or_else(|p| p.into_inner());
        *g = interval.to_string();
    }

    /// Deep copy with averages computed now. Never mutates the counters.
    pub fn snapshot(&self) -> SyncStatus {
        let interval = self
            .interval
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        self.with(|c| SyncStatus {
            anchors: c.anchors.into(),
            polling: c.polling.into(),
            postings: PostingsStatus {
                requests: c.postings.into(),
                total_postings_removed: c.removed,
                total_postings_upserted: c.upserted,
                average_posting_count: average(c.removed + c.upserted, c.dispatch_cycles),
            },
            schedule: ScheduleStatus {
                interval,
                total_run_count: c.runs,
                total_skipped_count: c.skipped,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_are_none_before_any_request() {
        let d = Diagnostics::new();
        let s = d.snapshot();
        assert_eq!(s.anchors.average_request_time, None);
        assert_eq!(s.polling.average_request_time, None);
        assert_eq!(s.postings.requests.average_request_time, None);
        assert_eq!(s.postings.average_posting_count, None);

        let v = serde_json::to_value(&s).unwrap();
        assert!(v["polling"]["averageRequestTime"].is_null());
        assert!(v["postings"]["totalPostingsUpserted"].is_number());
    }

    #[test]
    fn record_accumulates_per_phase() {
        let d = Diagnostics::new();
        d.record(Phase::Polling, Duration::from_millis(100), true);
        d.record(Phase::Polling, Duration::from_millis(300), false);
        d.record(Phase::Anchors, Duration::from_millis(50), true);
        d.record_retries(Phase::Postings, 3);

        let s = d.snapshot();
        assert_eq!(s.polling.total_request_count, 2);
        assert_eq!(s.polling.total_error_count, 1);
        assert_eq!(s.polling.total_request_time, 400);
        assert_eq!(s.polling.average_request_time, Some(200.0));
        assert_eq!(s.anchors.average_request_time, Some(50.0));
        assert_eq!(s.postings.requests.total_retry_count, 3);
        assert_eq!(s.postings.requests.total_request_count, 0);
    }

    #[test]
    fn snapshot_does_not_mutate() {
        let d = Diagnostics::new();
        d.record(Phase::Postings, Duration::from_millis(10), true);
        d.record_upserted(4);
        d.record_removed(2);
        d.record_dispatch_cycle();
        d.record_dispatch_cycle();
        let a = d.snapshot();
        let b = d.snapshot();
        assert_eq!(a, b);
        assert_eq!(a.postings.average_posting_count, Some(3.0));
    }

    #[test]
    fn schedule_counters() {
        let d = Diagnostics::new();
        d.set_interval("every 5 minutes");
        d.record_run();
        d.record_skipped_trigger();
        d.record_skipped_trigger();
        let s = d.snapshot().schedule;
        assert_eq!(s.interval, "every 5 minutes");
        assert_eq!(s.total_run_count, 1);
        assert_eq!(s.total_skipped_count, 2);
    }
}
