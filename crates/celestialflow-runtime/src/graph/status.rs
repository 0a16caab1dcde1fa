//! Per-stage status snapshots for the reporter.
//!
//! A snapshot carries the stage summary, the four counters plus derived
//! totals, per-interval deltas against the previous snapshot, wall-clock
//! bookkeeping (elapsed accrues one reporter interval per tick in which
//! the stage still had pending work), a remaining-time estimate, and a
//! bounded history window of throughput samples.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use celestialflow_shared::StageStatus;

use crate::stage::{now_epoch, FailureRecord, TaskStage};

/// Maximum throughput samples kept per stage.
const HISTORY_WINDOW: usize = 20;

/// One throughput sample.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HistorySample {
    pub timestamp: f64,
    pub tasks_processed: u64,
}

/// Snapshot of one stage, shaped for the reporter push API.
#[derive(Debug, Clone, Serialize)]
pub struct StageStatusSnapshot {
    pub stage_mode: String,
    pub execution_mode: String,
    pub func_name: String,
    pub class_name: String,
    pub status: StageStatus,

    pub tasks_successed: u64,
    pub tasks_failed: u64,
    pub tasks_duplicated: u64,
    pub tasks_processed: u64,
    pub tasks_pending: u64,

    pub add_tasks_successed: u64,
    pub add_tasks_failed: u64,
    pub add_tasks_duplicated: u64,
    pub add_tasks_processed: u64,
    pub add_tasks_pending: i64,

    pub start_time: String,
    pub elapsed_time: String,
    pub remaining_time: String,
    pub task_avg_time: String,
    pub history: Vec<HistorySample>,
}

/// Previous-tick counter values, for deltas.
#[derive(Debug, Clone, Copy, Default)]
struct LastCounts {
    successed: u64,
    failed: u64,
    duplicated: u64,
    pending: u64,
}

/// Live run state for one stage, shared between the driver, the stage
/// task, and the reporter.
#[derive(Debug)]
pub(crate) struct StageRuntime {
    pub stage: TaskStage,
    pub tag: String,
    pub status: AtomicU8,
    pub exit_code: AtomicI32,
    /// Unix seconds when the stage started; `None` before start.
    pub start_time: Mutex<Option<f64>>,
    pub elapsed: Mutex<f64>,
    pub history: Mutex<Vec<HistorySample>>,
}

impl StageRuntime {
    pub fn new(stage: TaskStage, tag: String) -> Self {
        Self {
            stage,
            tag,
            status: AtomicU8::new(StageStatus::NotStarted.as_u8()),
            exit_code: AtomicI32::new(0),
            start_time: Mutex::new(None),
            elapsed: Mutex::new(0.0),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn mark_running(&self) {
        self.status
            .store(StageStatus::Running.as_u8(), Ordering::Relaxed);
        *self.start_time.lock().expect("start time lock") = Some(now_epoch());
    }

    pub fn mark_stopped(&self, exit_code: i32) {
        self.status
            .store(StageStatus::Stopped.as_u8(), Ordering::Relaxed);
        self.exit_code.store(exit_code, Ordering::Relaxed);
    }

    pub fn status(&self) -> StageStatus {
        StageStatus::from_u8(self.status.load(Ordering::Relaxed))
    }

    pub fn reset(&self) {
        self.status
            .store(StageStatus::NotStarted.as_u8(), Ordering::Relaxed);
        self.exit_code.store(0, Ordering::Relaxed);
        *self.start_time.lock().expect("start time lock") = None;
        *self.elapsed.lock().expect("elapsed lock") = 0.0;
        self.history.lock().expect("history lock").clear();
    }
}

/// Run state shared with the reporter task.
#[derive(Debug)]
pub(crate) struct GraphShared {
    pub stages: Vec<std::sync::Arc<StageRuntime>>,
    interval_secs: Mutex<f64>,
    pub failures: Mutex<Vec<FailureRecord>>,
    last: Mutex<HashMap<String, LastCounts>>,
}

impl GraphShared {
    pub fn new(stages: Vec<std::sync::Arc<StageRuntime>>, interval_secs: f64) -> Self {
        Self {
            stages,
            interval_secs: Mutex::new(interval_secs),
            failures: Mutex::new(Vec::new()),
            last: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_interval(&self, interval_secs: f64) {
        *self.interval_secs.lock().expect("interval lock") = interval_secs;
    }

    pub fn reset(&self) {
        for runtime in &self.stages {
            runtime.reset();
        }
        self.failures.lock().expect("failures lock").clear();
        self.last.lock().expect("last counts lock").clear();
    }

    /// Compute snapshots for every stage, advancing delta and elapsed
    /// bookkeeping.
    pub fn snapshot(&self) -> HashMap<String, StageStatusSnapshot> {
        let now = now_epoch();
        let interval_secs = *self.interval_secs.lock().expect("interval lock");
        let mut last_map = self.last.lock().expect("last counts lock");
        let mut out = HashMap::with_capacity(self.stages.len());

        for runtime in &self.stages {
            let counts = runtime.stage.metrics().counts();
            let summary = runtime.stage.summary();
            let last = last_map.get(&runtime.tag).copied().unwrap_or_default();

            let start_time = *runtime.start_time.lock().expect("start time lock");
            let mut elapsed = runtime.elapsed.lock().expect("elapsed lock");
            if start_time.is_some() && last.pending > 0 {
                // The stage was still busy at the previous tick.
                *elapsed += interval_secs;
            }
            let elapsed_secs = *elapsed;
            drop(elapsed);

            let remaining = if counts.tasks_processed > 0 && counts.tasks_pending > 0 {
                elapsed_secs / counts.tasks_processed as f64 * counts.tasks_pending as f64
            } else {
                0.0
            };

            let task_avg_time = if counts.tasks_processed > 0 {
                let avg = elapsed_secs / counts.tasks_processed as f64;
                if avg >= 1.0 {
                    format!("{avg:.2}s/it")
                } else if elapsed_secs > 0.0 {
                    format!("{:.2}it/s", counts.tasks_processed as f64 / elapsed_secs)
                } else {
                    "0.00it/s".to_string()
                }
            } else {
                "N/A".to_string()
            };

            let mut history = runtime.history.lock().expect("history lock");
            history.push(HistorySample {
                timestamp: now,
                tasks_processed: counts.tasks_processed,
            });
            if history.len() > HISTORY_WINDOW {
                history.remove(0);
            }
            let history_copy = history.clone();
            drop(history);

            last_map.insert(
                runtime.tag.clone(),
                LastCounts {
                    successed: counts.tasks_successed,
                    failed: counts.tasks_failed,
                    duplicated: counts.tasks_duplicated,
                    pending: counts.tasks_pending,
                },
            );

            out.insert(
                runtime.tag.clone(),
                StageStatusSnapshot {
                    stage_mode: summary.stage_mode,
                    execution_mode: summary.execution_mode,
                    func_name: summary.func_name,
                    class_name: summary.class_name,
                    status: runtime.status(),
                    tasks_successed: counts.tasks_successed,
                    tasks_failed: counts.tasks_failed,
                    tasks_duplicated: counts.tasks_duplicated,
                    tasks_processed: counts.tasks_processed,
                    tasks_pending: counts.tasks_pending,
                    add_tasks_successed: counts.tasks_successed.saturating_sub(last.successed),
                    add_tasks_failed: counts.tasks_failed.saturating_sub(last.failed),
                    add_tasks_duplicated: counts
                        .tasks_duplicated
                        .saturating_sub(last.duplicated),
                    add_tasks_processed: counts
                        .tasks_processed
                        .saturating_sub(last.successed + last.failed + last.duplicated),
                    add_tasks_pending: counts.tasks_pending as i64 - last.pending as i64,
                    start_time: format_timestamp(start_time),
                    elapsed_time: format_duration(elapsed_secs),
                    remaining_time: format_duration(remaining),
                    task_avg_time,
                    history: history_copy,
                },
            );
        }
        out
    }
}

/// `""` before start, local wall-clock time otherwise.
pub(crate) fn format_timestamp(epoch: Option<f64>) -> String {
    match epoch {
        None => String::new(),
        Some(secs) => chrono::DateTime::from_timestamp_micros((secs * 1e6) as i64)
            .map(|utc| {
                utc.with_timezone(&chrono::Local)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string()
            })
            .unwrap_or_default(),
    }
}

/// Compact human duration: `12.3s`, `4m05s`, `1h02m`.
pub(crate) fn format_duration(secs: f64) -> String {
    if secs < 60.0 {
        format!("{secs:.1}s")
    } else if secs < 3600.0 {
        let minutes = (secs / 60.0).floor() as u64;
        let rest = (secs % 60.0).round() as u64;
        format!("{minutes}m{rest:02}s")
    } else {
        let hours = (secs / 3600.0).floor() as u64;
        let minutes = ((secs % 3600.0) / 60.0).round() as u64;
        format!("{hours}h{minutes:02}m")
    }
}
