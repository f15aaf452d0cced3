//! Counters for pools and pipeline stages.
//!
//! Accounting counters live under one lock so a snapshot always satisfies
//! `processed + errored + skipped + in_flight == submitted`. Per-worker
//! counters are atomics in a [`DashMap`], updated inside the same critical
//! section so their sums agree with the pool totals.

use crate::pool::SkipReason;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How a unit of work left the accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The transform succeeded.
    Processed,
    /// The transform failed or panicked.
    Errored,
    /// The work was skipped.
    Skipped(SkipReason),
}

/// Skipped counts broken down by reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SkipCounts {
    /// Still queued when the pool shut down.
    pub shutting_down: u64,
    /// Interrupted by a per-job deadline or an expired grace period.
    pub deadline_exceeded: u64,
    /// Interrupted by cancellation.
    pub cancelled: u64,
    /// Declined by the transform.
    pub declined: u64,
}

impl SkipCounts {
    fn bump(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::ShuttingDown => self.shutting_down += 1,
            SkipReason::DeadlineExceeded => self.deadline_exceeded += 1,
            SkipReason::Cancelled => self.cancelled += 1,
            SkipReason::Declined => self.declined += 1,
        }
    }
}

#[derive(Debug, Default)]
struct Accounting {
    submitted: u64,
    processed: u64,
    errored: u64,
    skipped: u64,
    in_flight: u64,
    executing: u64,
    skipped_by_reason: SkipCounts,
    service_time: Duration,
}

#[derive(Debug, Default)]
struct WorkerCounters {
    processed: AtomicU64,
    errored: AtomicU64,
    skipped: AtomicU64,
    panics: AtomicU64,
    service_nanos: AtomicU64,
    active: AtomicBool,
}

/// Records accounting and per-worker counters for one pool or stage.
#[derive(Debug)]
pub struct MetricsRecorder {
    name: String,
    accounting: Mutex<Accounting>,
    workers: DashMap<usize, Arc<WorkerCounters>>,
    panics: AtomicU64,
    replacements: AtomicU64,
}

impl MetricsRecorder {
    /// Creates a recorder labelled `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            accounting: Mutex::new(Accounting::default()),
            workers: DashMap::new(),
            panics: AtomicU64::new(0),
            replacements: AtomicU64::new(0),
        }
    }

    /// Returns the label.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Counts a unit of work entering the system.
    pub fn record_submitted(&self) {
        let mut acc = self.accounting.lock();
        acc.submitted += 1;
        acc.in_flight += 1;
    }

    /// Undoes [`record_submitted`](Self::record_submitted) for work that
    /// was never accepted.
    pub fn rollback_submitted(&self) {
        let mut acc = self.accounting.lock();
        acc.submitted = acc.submitted.saturating_sub(1);
        acc.in_flight = acc.in_flight.saturating_sub(1);
    }

    /// Counts `count` units picked up by a worker.
    pub fn record_started(&self, count: u64) {
        self.accounting.lock().executing += count;
    }

    /// Counts a unit of work leaving the system.
    ///
    /// `worker_id` is `None` for work that never reached a worker.
    pub fn record_finished(&self, worker_id: Option<usize>, completion: Completion, service_time: Duration) {
        let worker = worker_id.map(|id| self.worker(id));
        let nanos = u64::try_from(service_time.as_nanos()).unwrap_or(u64::MAX);

        let mut acc = self.accounting.lock();
        acc.in_flight = acc.in_flight.saturating_sub(1);
        if worker.is_some() {
            acc.executing = acc.executing.saturating_sub(1);
        }
        acc.service_time += service_time;
        match completion {
            Completion::Processed => acc.processed += 1,
            Completion::Errored => acc.errored += 1,
            Completion::Skipped(reason) => {
                acc.skipped += 1;
                acc.skipped_by_reason.bump(reason);
            }
        }
        if let Some(worker) = worker {
            let counter = match completion {
                Completion::Processed => &worker.processed,
                Completion::Errored => &worker.errored,
                Completion::Skipped(_) => &worker.skipped,
            };
            counter.fetch_add(1, Ordering::Relaxed);
            worker.service_nanos.fetch_add(nanos, Ordering::Relaxed);
        }
    }

    /// Marks a worker as running.
    pub fn worker_started(&self, worker_id: usize) {
        self.worker(worker_id).active.store(true, Ordering::Relaxed);
    }

    /// Marks a worker as exited.
    pub fn worker_stopped(&self, worker_id: usize) {
        if let Some(worker) = self.workers.get(&worker_id) {
            worker.active.store(false, Ordering::Relaxed);
        }
    }

    /// Counts a recovered panic.
    pub fn record_panic(&self, worker_id: usize) {
        self.panics.fetch_add(1, Ordering::Relaxed);
        self.worker(worker_id).panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a worker replaced after repeated panics.
    pub fn record_replacement(&self) {
        self.replacements.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of running workers.
    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.active.load(Ordering::Relaxed))
            .count()
    }

    /// Returns the current in-flight count.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.accounting.lock().in_flight
    }

    /// Takes a consistent snapshot. `queue_depth` is reported as given.
    #[must_use]
    pub fn snapshot(&self, queue_depth: usize) -> MetricsSnapshot {
        let acc = self.accounting.lock();
        let mut per_worker: Vec<WorkerSnapshot> = self
            .workers
            .iter()
            .map(|entry| WorkerSnapshot::read(*entry.key(), entry.value()))
            .collect();
        per_worker.sort_by_key(|w| w.worker_id);

        let finished = acc.processed + acc.errored;
        let total_ms = acc.service_time.as_secs_f64() * 1000.0;
        #[allow(clippy::cast_precision_loss)]
        let mean_ms = if finished == 0 { 0.0 } else { total_ms / finished as f64 };

        MetricsSnapshot {
            name: self.name.clone(),
            submitted: acc.submitted,
            processed: acc.processed,
            errored: acc.errored,
            skipped: acc.skipped,
            in_flight: acc.in_flight,
            executing: acc.executing,
            skipped_by_reason: acc.skipped_by_reason,
            total_service_time_ms: total_ms,
            mean_service_time_ms: mean_ms,
            active_workers: per_worker.iter().filter(|w| w.active).count(),
            panics: self.panics.load(Ordering::Relaxed),
            replacements: self.replacements.load(Ordering::Relaxed),
            queue_depth,
            per_worker,
            taken_at: Utc::now(),
        }
    }

    fn worker(&self, worker_id: usize) -> Arc<WorkerCounters> {
        self.workers.entry(worker_id).or_default().clone()
    }
}

/// Counters of one worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSnapshot {
    /// Worker id, unique within its pool or stage.
    pub worker_id: usize,
    /// Jobs that succeeded.
    pub processed: u64,
    /// Jobs that failed or panicked.
    pub errored: u64,
    /// Jobs interrupted while running.
    pub skipped: u64,
    /// Recovered panics.
    pub panics: u64,
    /// Total time spent in the transform.
    pub total_service_time_ms: f64,
    /// Whether the worker is still running.
    pub active: bool,
}

impl WorkerSnapshot {
    #[allow(clippy::cast_precision_loss)]
    fn read(worker_id: usize, counters: &WorkerCounters) -> Self {
        Self {
            worker_id,
            processed: counters.processed.load(Ordering::Relaxed),
            errored: counters.errored.load(Ordering::Relaxed),
            skipped: counters.skipped.load(Ordering::Relaxed),
            panics: counters.panics.load(Ordering::Relaxed),
            total_service_time_ms: counters.service_nanos.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            active: counters.active.load(Ordering::Relaxed),
        }
    }
}

/// A read-only view of a recorder at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Pool or stage name.
    pub name: String,
    /// Work accepted.
    pub submitted: u64,
    /// Work that succeeded.
    pub processed: u64,
    /// Work that failed.
    pub errored: u64,
    /// Work that was skipped.
    pub skipped: u64,
    /// Work accepted but not yet finished, queued or running.
    pub in_flight: u64,
    /// Work currently held by a worker.
    pub executing: u64,
    /// Skips by reason.
    pub skipped_by_reason: SkipCounts,
    /// Total time spent in transforms.
    pub total_service_time_ms: f64,
    /// Mean time per processed or errored unit.
    pub mean_service_time_ms: f64,
    /// Workers currently running.
    pub active_workers: usize,
    /// Recovered panics.
    pub panics: u64,
    /// Workers replaced after repeated panics.
    pub replacements: u64,
    /// Items waiting in the input queue(s).
    pub queue_depth: usize,
    /// Per-worker breakdown, ordered by worker id.
    pub per_worker: Vec<WorkerSnapshot>,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}

impl MetricsSnapshot {
    /// Returns true if every accepted unit is accounted for exactly once.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.processed + self.errored + self.skipped + self.in_flight == self.submitted
    }

    /// Renders the snapshot as pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
