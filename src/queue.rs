//! Priority- and time-aware dispatch queue between producers and the
//! consumer loop.
//!
//! The queue is the sole shared mutable structure of a run. Producers
//! [`put`](DispatchQueue::put) without ever blocking (the backing store
//! grows instead); the single consumer [`get`](DispatchQueue::get)s,
//! blocking until a *ready* record exists or the queue is permanently
//! closed.
//!
//! Ordering among ready records (release-time elapsed) is priority-major,
//! arrival-minor. A record whose release-time has not elapsed is held, not
//! ready, and never blocks the delivery of ready records behind it: release
//! times delay, they never reorder past an already-ready higher-priority
//! record.
//!
//! Scheduling pressure is relieved in two ways, both observable through the
//! run counters:
//!
//! - a ready record strictly below the priority of the delivery currently
//!   in flight is dropped on arrival;
//! - when the ready backlog exceeds the configured threshold, the
//!   lowest-priority ready records are evicted, newest first.
//!
//! A put that outranks the in-flight delivery reports
//! [`preempts`](PutOutcome::preempts); the caller raises the consumer's
//! interrupt token so the delivery yields at its next suspension point.

use crate::error::{PipeError, Result};
use crate::record::Record;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// What happened to a record handed to [`DispatchQueue::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    /// Whether the record was stored. `false` means it was dropped against
    /// a higher-priority delivery in flight.
    pub stored: bool,
    /// The record outranks the delivery in flight; the caller should raise
    /// the consumer's interrupt token.
    pub preempts: bool,
    /// Number of lower-priority ready records evicted to bound the backlog.
    pub evicted: usize,
}

struct Entry {
    record: Record,
    seq: u64,
}

struct Inner {
    entries: Vec<Entry>,
    next_seq: u64,
    closed: bool,
    epoch: Instant,
    /// Priority of the record handed out by the last `get`, until
    /// `delivery_done` clears it.
    delivering: Option<i8>,
}

impl Inner {
    fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn is_ready(&self, record: &Record, elapsed: u64) -> bool {
        match record.time() {
            None => true,
            Some(t) => t as u64 <= elapsed,
        }
    }

    /// Index of the best ready entry: maximum priority, minimum sequence.
    fn best_ready(&self, elapsed: u64) -> Option<usize> {
        let mut best: Option<(usize, i8, u64)> = None;
        for (idx, entry) in self.entries.iter().enumerate() {
            if !self.is_ready(&entry.record, elapsed) {
                continue;
            }
            let key = (entry.record.priority(), entry.seq);
            let better = match best {
                None => true,
                Some((_, prio, seq)) => key.0 > prio || (key.0 == prio && key.1 < seq),
            };
            if better {
                best = Some((idx, key.0, key.1));
            }
        }
        best.map(|(idx, _, _)| idx)
    }

    /// Milliseconds until the earliest held entry becomes ready.
    fn next_release_in(&self, elapsed: u64) -> Option<u64> {
        self.entries
            .iter()
            .filter_map(|e| e.record.time())
            .map(|t| t as u64)
            .filter(|&t| t > elapsed)
            .min()
            .map(|t| t - elapsed)
    }

    fn ready_count(&self, elapsed: u64) -> usize {
        self.entries
            .iter()
            .filter(|e| self.is_ready(&e.record, elapsed))
            .count()
    }
}

/// Bounded-pressure hand-off buffer between producer threads and the
/// consumer loop.
pub struct DispatchQueue {
    inner: Mutex<Inner>,
    cond: Condvar,
    backlog_threshold: usize,
    /// Tolerance for put-time readiness: producers hand timed records over
    /// up to this many milliseconds before their release, and drop/preempt
    /// decisions must classify those as ready.
    release_lead_ms: u64,
}

impl DispatchQueue {
    /// An open, empty queue whose readiness clock starts now.
    pub fn new(backlog_threshold: usize, release_lead_ms: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: Vec::with_capacity(16),
                next_seq: 0,
                closed: false,
                epoch: Instant::now(),
                delivering: None,
            }),
            cond: Condvar::new(),
            backlog_threshold,
            release_lead_ms,
        }
    }

    /// Milliseconds since the queue's epoch (the pipeline start).
    pub fn elapsed_ms(&self) -> u64 {
        self.inner.lock().unwrap().elapsed_ms()
    }

    /// Store a record for delivery. Never blocks; grows the backing store
    /// as needed. Fails once the queue has been closed.
    pub fn put(&self, record: Record) -> Result<PutOutcome> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(PipeError::Closed);
        }
        let elapsed = inner.elapsed_ms();
        let ready = inner.is_ready(&record, elapsed + self.release_lead_ms);

        if ready {
            if let Some(current) = inner.delivering {
                if record.priority() < current {
                    tracing::trace!(%record, in_flight = current as i64, "dropped against in-flight delivery");
                    return Ok(PutOutcome {
                        stored: false,
                        preempts: false,
                        evicted: 0,
                    });
                }
            }
        }
        let preempts = ready
            && inner
                .delivering
                .map_or(false, |current| record.priority() > current);

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let priority = record.priority();
        inner.entries.push(Entry { record, seq });

        let mut evicted = 0usize;
        while inner.ready_count(elapsed) > self.backlog_threshold {
            // evict the lowest-priority ready record, newest first, but
            // never one outranking the record that caused the overflow
            let victim = inner
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| inner.is_ready(&e.record, elapsed) && e.record.priority() < priority)
                .min_by_key(|(_, e)| (e.record.priority(), std::cmp::Reverse(e.seq)))
                .map(|(idx, _)| idx);
            match victim {
                Some(idx) => {
                    let gone = inner.entries.remove(idx);
                    tracing::warn!(record = %gone.record, "backlog overflow, evicting record");
                    evicted += 1;
                }
                None => break,
            }
        }

        self.cond.notify_all();
        Ok(PutOutcome {
            stored: true,
            preempts,
            evicted,
        })
    }

    /// Take the next ready record, blocking until one exists. Returns
    /// `None` once the queue is closed and fully drained. The returned
    /// record counts as "in flight" until [`delivery_done`](Self::delivery_done).
    pub fn get(&self) -> Option<Record> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            let elapsed = inner.elapsed_ms();
            if let Some(idx) = inner.best_ready(elapsed) {
                let entry = inner.entries.remove(idx);
                inner.delivering = Some(entry.record.priority());
                tracing::trace!(record = %entry.record, "dequeued for delivery");
                return Some(entry.record);
            }
            if inner.closed && inner.entries.is_empty() {
                return None;
            }
            inner = match inner.next_release_in(elapsed) {
                Some(ms) => {
                    let wait = Duration::from_millis(ms.max(1));
                    self.cond.wait_timeout(inner, wait).unwrap().0
                }
                None => self.cond.wait(inner).unwrap(),
            };
        }
    }

    /// Mark the record handed out by the last `get` as fully delivered.
    pub fn delivery_done(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.delivering = None;
    }

    /// Close the queue: remaining records can still be taken, further puts
    /// fail, and blocked `get`s wake promptly. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Number of undelivered records, ready or held.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reopen the queue with a fresh epoch. Fails while undelivered
    /// records remain.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.entries.is_empty() {
            return Err(PipeError::NotDrained(inner.entries.len()));
        }
        inner.closed = false;
        inner.next_seq = 0;
        inner.epoch = Instant::now();
        inner.delivering = None;
        Ok(())
    }

    /// Throw away every undelivered record, returning how many were
    /// discarded. Used on abort so the queue is drained and resettable.
    pub fn discard_remaining(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let count = inner.entries.len();
        inner.entries.clear();
        inner.delivering = None;
        self.cond.notify_all();
        count
    }
}
