//! # Stage Counters
//!
//! Counters are the only mutable state shared across stage boundaries.
//! Everything here is an `Arc<AtomicU64>` or an aggregate view over them,
//! so the per-task hot path is a handful of atomic increments.
//!
//! A [`SumCounter`] gives a stage its total expected input count without
//! any message-counting on the queues: at graph-build time each stage
//! appends one child counter per predecessor (the predecessor's success,
//! split, or per-target route counter), plus an init value for tasks
//! injected directly at the stage.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;

/// Aggregating read view: `value = init + Σ children`.
///
/// Children are appended while the graph is wired and only read afterwards.
#[derive(Debug, Default)]
pub struct SumCounter {
    init_value: AtomicU64,
    children: RwLock<Vec<Arc<AtomicU64>>>,
}

impl SumCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count tasks injected directly at this stage.
    pub fn add_init_value(&self, count: u64) {
        self.init_value.fetch_add(count, Ordering::Relaxed);
    }

    /// Bind an upstream contribution counter.
    pub fn append_counter(&self, counter: Arc<AtomicU64>) {
        self.children
            .write()
            .expect("sum counter children lock poisoned")
            .push(counter);
    }

    pub fn value(&self) -> u64 {
        let children = self
            .children
            .read()
            .expect("sum counter children lock poisoned");
        self.init_value.load(Ordering::Relaxed)
            + children
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .sum::<u64>()
    }

    /// Zero the init contribution. Child counters belong to upstream
    /// stages and are reset by their owners.
    pub fn reset(&self) {
        self.init_value.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time counter readings for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub tasks_input: u64,
    pub tasks_successed: u64,
    pub tasks_failed: u64,
    pub tasks_duplicated: u64,
    pub tasks_processed: u64,
    pub tasks_pending: u64,
}

/// Per-stage counters plus the private retry/dedup maps.
///
/// The counters are shared with downstream consumers (through
/// [`SumCounter`] bindings) and with the status snapshotter; the maps are
/// private to the stage's workers and guarded by one mutex each.
#[derive(Debug, Default)]
pub struct StageMetrics {
    pub task_counter: SumCounter,
    pub success_counter: Arc<AtomicU64>,
    pub error_counter: Arc<AtomicU64>,
    pub duplicate_counter: Arc<AtomicU64>,

    retry_counts: Mutex<HashMap<String, u32>>,
    processed: Mutex<HashSet<String>>,
}

impl StageMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.success_counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.error_counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicate_counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Has this envelope id already completed here?
    pub fn is_processed(&self, id: &str) -> bool {
        self.processed
            .lock()
            .expect("processed set lock poisoned")
            .contains(id)
    }

    pub fn mark_processed(&self, id: &str) {
        self.processed
            .lock()
            .expect("processed set lock poisoned")
            .insert(id.to_string());
    }

    /// Retry attempts recorded so far for this envelope id.
    pub fn retry_attempts(&self, id: &str) -> u32 {
        self.retry_counts
            .lock()
            .expect("retry map lock poisoned")
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    /// Record one more retry; returns the new attempt count.
    pub fn bump_retry(&self, id: &str) -> u32 {
        let mut counts = self.retry_counts.lock().expect("retry map lock poisoned");
        let entry = counts.entry(id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn clear_retry(&self, id: &str) {
        self.retry_counts
            .lock()
            .expect("retry map lock poisoned")
            .remove(id);
    }

    /// `input == success + error + duplicate`: every envelope this stage
    /// will ever receive has been accounted for.
    pub fn is_finished(&self) -> bool {
        let processed = self.success_counter.load(Ordering::Relaxed)
            + self.error_counter.load(Ordering::Relaxed)
            + self.duplicate_counter.load(Ordering::Relaxed);
        self.task_counter.value() == processed
    }

    pub fn counts(&self) -> TaskCounts {
        let input = self.task_counter.value();
        let successed = self.success_counter.load(Ordering::Relaxed);
        let failed = self.error_counter.load(Ordering::Relaxed);
        let duplicated = self.duplicate_counter.load(Ordering::Relaxed);
        let processed = successed + failed + duplicated;
        TaskCounts {
            tasks_input: input,
            tasks_successed: successed,
            tasks_failed: failed,
            tasks_duplicated: duplicated,
            tasks_processed: processed,
            tasks_pending: input.saturating_sub(processed),
        }
    }

    /// Clear the per-run retry and dedup maps.
    pub fn reset_state(&self) {
        self.retry_counts
            .lock()
            .expect("retry map lock poisoned")
            .clear();
        self.processed
            .lock()
            .expect("processed set lock poisoned")
            .clear();
    }

    /// Zero this stage's own counters and init input (for a fresh run).
    pub fn reset_counters(&self) {
        self.success_counter.store(0, Ordering::Relaxed);
        self.error_counter.store(0, Ordering::Relaxed);
        self.duplicate_counter.store(0, Ordering::Relaxed);
        self.task_counter.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_counter_aggregates_init_and_children() {
        let sum = SumCounter::new();
        sum.add_init_value(3);
        let upstream_a = Arc::new(AtomicU64::new(0));
        let upstream_b = Arc::new(AtomicU64::new(0));
        sum.append_counter(upstream_a.clone());
        sum.append_counter(upstream_b.clone());

        upstream_a.store(5, Ordering::Relaxed);
        upstream_b.store(2, Ordering::Relaxed);
        assert_eq!(sum.value(), 10);

        sum.reset();
        assert_eq!(sum.value(), 7, "reset only clears the init contribution");
    }

    #[test]
    fn counts_balance_input_accounting() {
        let metrics = StageMetrics::new();
        metrics.task_counter.add_init_value(4);
        metrics.record_success();
        metrics.record_success();
        metrics.record_error();

        let counts = metrics.counts();
        assert_eq!(counts.tasks_input, 4);
        assert_eq!(counts.tasks_processed, 3);
        assert_eq!(counts.tasks_pending, 1);
        assert!(!metrics.is_finished());

        metrics.record_duplicate();
        assert!(metrics.is_finished());
        assert_eq!(metrics.counts().tasks_pending, 0);
    }

    #[test]
    fn retry_bookkeeping() {
        let metrics = StageMetrics::new();
        assert_eq!(metrics.retry_attempts("e1"), 0);
        assert_eq!(metrics.bump_retry("e1"), 1);
        assert_eq!(metrics.bump_retry("e1"), 2);
        assert_eq!(metrics.retry_attempts("e1"), 2);
        metrics.clear_retry("e1");
        assert_eq!(metrics.retry_attempts("e1"), 0);
    }

    #[test]
    fn processed_set_round_trip() {
        let metrics = StageMetrics::new();
        assert!(!metrics.is_processed("abc"));
        metrics.mark_processed("abc");
        assert!(metrics.is_processed("abc"));
        metrics.reset_state();
        assert!(!metrics.is_processed("abc"));
    }
}
