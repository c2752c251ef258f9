//! Run statistics and the observable scheduling counters.
//!
//! Shared by every thread of a run; counters are atomics, the error lists
//! and the clock sit behind a mutex. The scheduling counters (interruptions,
//! drops, behind-schedule, and the temporary/permanent error split) are the
//! externally binding feedback of the dispatch contract.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Clock {
    started: Option<Instant>,
    stopped: Option<Instant>,
    started_wall: Option<DateTime<Utc>>,
}

/// Live counters of a pipeline run.
#[derive(Debug, Default)]
pub struct RunFeedback {
    records_read: AtomicU64,
    records_transformed: AtomicU64,
    records_delivered: AtomicU64,
    interruptions: AtomicU64,
    drops: AtomicU64,
    behind: AtomicU64,
    behind_significant: AtomicU64,
    behind_max_ms: AtomicU64,
    behind_sum_ms: AtomicU64,
    temporary_errors: Mutex<Vec<String>>,
    permanent_errors: Mutex<Vec<String>>,
    clock: Mutex<Clock>,
}

impl RunFeedback {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn start(&self) {
        let mut clock = self.clock.lock().unwrap();
        clock.started = Some(Instant::now());
        clock.stopped = None;
        clock.started_wall = Some(Utc::now());
    }

    pub(crate) fn stop(&self) {
        let mut clock = self.clock.lock().unwrap();
        clock.stopped = Some(Instant::now());
    }

    /// Wall-clock timestamp of the run start, for reporting how late a
    /// delivery was against its intended execution time.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.clock.lock().unwrap().started_wall
    }

    /// Time the run has been going, or its total duration once stopped.
    pub fn elapsed(&self) -> Duration {
        let clock = self.clock.lock().unwrap();
        match (clock.started, clock.stopped) {
            (Some(started), Some(stopped)) => stopped.duration_since(started),
            (Some(started), None) => started.elapsed(),
            _ => Duration::ZERO,
        }
    }

    pub(crate) fn inc_read(&self) {
        self.records_read.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_transformed(&self) {
        self.records_transformed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_delivered(&self) {
        self.records_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_interruptions(&self) {
        self.interruptions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_drops(&self, count: u64) {
        if count > 0 {
            self.drops.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// Record a late delivery. Lateness beyond the significance tolerance
    /// counts towards the behind-schedule contract counter.
    pub(crate) fn record_behind(&self, behind_ms: u64, significant: bool) {
        self.behind.fetch_add(1, Ordering::Relaxed);
        if significant {
            self.behind_significant.fetch_add(1, Ordering::Relaxed);
        }
        self.behind_max_ms.fetch_max(behind_ms, Ordering::Relaxed);
        self.behind_sum_ms.fetch_add(behind_ms, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self, message: impl Into<String>, permanent: bool) {
        let message = message.into();
        if permanent {
            self.permanent_errors.lock().unwrap().push(message);
        } else {
            self.temporary_errors.lock().unwrap().push(message);
        }
    }

    pub fn records_read(&self) -> u64 {
        self.records_read.load(Ordering::Relaxed)
    }

    pub fn records_transformed(&self) -> u64 {
        self.records_transformed.load(Ordering::Relaxed)
    }

    pub fn records_delivered(&self) -> u64 {
        self.records_delivered.load(Ordering::Relaxed)
    }

    pub fn interruptions(&self) -> u64 {
        self.interruptions.load(Ordering::Relaxed)
    }

    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Deliveries materially later than their release time.
    pub fn behind_schedule(&self) -> u64 {
        self.behind_significant.load(Ordering::Relaxed)
    }

    pub fn temporary_errors(&self) -> Vec<String> {
        self.temporary_errors.lock().unwrap().clone()
    }

    pub fn permanent_errors(&self) -> Vec<String> {
        self.permanent_errors.lock().unwrap().clone()
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> FeedbackSnapshot {
        FeedbackSnapshot {
            records_read: self.records_read(),
            records_transformed: self.records_transformed(),
            records_delivered: self.records_delivered(),
            interruptions: self.interruptions(),
            drops: self.drops(),
            behind_schedule: self.behind_schedule(),
            behind_total: self.behind.load(Ordering::Relaxed),
            behind_max_ms: self.behind_max_ms.load(Ordering::Relaxed),
            temporary_errors: self.temporary_errors(),
            permanent_errors: self.permanent_errors(),
            elapsed: self.elapsed(),
        }
    }
}

/// Frozen view of a run's counters.
#[derive(Debug, Clone)]
pub struct FeedbackSnapshot {
    pub records_read: u64,
    pub records_transformed: u64,
    pub records_delivered: u64,
    pub interruptions: u64,
    pub drops: u64,
    /// Deliveries later than the configured tolerance.
    pub behind_schedule: u64,
    /// Every late delivery, tolerated or not.
    pub behind_total: u64,
    pub behind_max_ms: u64,
    pub temporary_errors: Vec<String>,
    pub permanent_errors: Vec<String>,
    pub elapsed: Duration,
}

impl std::fmt::Display for FeedbackSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "read {}, transformed {}, delivered {} record(s) in {:?}; \
             {} temporary and {} permanent error(s), {} interruption(s), \
             {} drop(s), {} behind schedule (max {} ms)",
            self.records_read,
            self.records_transformed,
            self.records_delivered,
            self.elapsed,
            self.temporary_errors.len(),
            self.permanent_errors.len(),
            self.interruptions,
            self.drops,
            self.behind_schedule,
            self.behind_max_ms,
        )
    }
}
