//! # TaskStage
//!
//! A stage is a worker pool running one user function: it drains its
//! ingress fan-in queue, applies the per-task pipeline (dedup → argument
//! extraction → invoke → classify → emit/fail → mark processed), and
//! forwards outputs to its egress queue. When every ingress endpoint has
//! terminated, the stage quiesces its workers, emits one termination
//! signal on every outbound channel, and returns.
//!
//! Specialized behaviors (splitter fan-out, router target selection) are
//! enum-dispatched through [`StageKind`]; the pipeline itself is shared.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use crossbeam::channel::Sender;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use celestialflow_shared::{
    ConfigurationError, EventKind, ExecutionMode, FlowError, QueueItem, SharedProvenance,
    StageMode, TaskEnvelope, TaskValue, TerminationSignal, UserFuncError,
};

use crate::func::SharedStageFunc;
use crate::metrics::StageMetrics;
use crate::queue::TaskQueue;

/// A captured terminal failure, routed to the driver's failure channel.
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    /// Unix seconds.
    pub timestamp: f64,
    pub stage_tag: String,
    /// `Kind(message)` rendering of the error.
    pub error: String,
    /// Id of the envelope that failed.
    pub error_id: String,
    /// String rendering of the payload.
    pub task: String,
}

/// Per-stage knobs.
#[derive(Debug, Clone)]
pub struct StageConfig {
    pub execution_mode: ExecutionMode,
    pub stage_mode: StageMode,
    pub worker_limit: usize,
    pub max_retries: u32,
    /// Error kinds that re-enter the input instead of failing.
    pub retry_kinds: HashSet<String>,
    pub enable_duplicate_check: bool,
    /// Pass array payload elements as separate arguments.
    pub unpack_task_args: bool,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::Serial,
            stage_mode: StageMode::Serial,
            worker_limit: 4,
            max_retries: 0,
            retry_kinds: HashSet::new(),
            enable_duplicate_check: true,
            unpack_task_args: false,
        }
    }
}

impl StageConfig {
    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.worker_limit == 0 {
            return Err(ConfigurationError::ZeroWorkerLimit);
        }
        Ok(())
    }
}

/// Stage specialization, dispatched in the success-emission path.
#[derive(Debug, Clone)]
pub enum StageKind {
    /// Broadcast the wrapped result to every outbound channel.
    Default,
    /// Treat the result as a sequence; forward each element as its own
    /// child envelope to every outbound channel.
    Splitter { split_counter: Arc<AtomicU64> },
    /// Treat the result as `(target_tag, payload)`; forward the payload to
    /// the selected channel only.
    Router {
        route_counters: Arc<DashMap<String, Arc<AtomicU64>>>,
    },
}

impl StageKind {
    fn class_name(&self) -> &'static str {
        match self {
            StageKind::Default => "TaskStage",
            StageKind::Splitter { .. } => "TaskSplitter",
            StageKind::Router { .. } => "TaskRouter",
        }
    }
}

/// Status-summary fields pushed with every snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    pub stage_mode: String,
    pub execution_mode: String,
    pub func_name: String,
    pub class_name: String,
}

struct StageInner {
    func: SharedStageFunc,
    kind: StageKind,
    class_name: RwLock<&'static str>,
    config: RwLock<StageConfig>,
    metrics: Arc<StageMetrics>,
    tag: RwLock<String>,
}

impl std::fmt::Debug for StageInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageInner")
            .field("func", &self.func.name())
            .field("kind", &self.kind)
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

/// Everything a running stage needs from the graph.
#[derive(Clone)]
pub(crate) struct StageIo {
    pub in_q: Arc<TaskQueue>,
    pub out_q: Arc<TaskQueue>,
    pub fail_tx: Sender<FailureRecord>,
    pub provenance: SharedProvenance,
}

impl std::fmt::Debug for StageIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageIo").finish_non_exhaustive()
    }
}

/// A worker-pool stage. Cheap to clone; clones share function, counters,
/// and configuration.
#[derive(Debug, Clone)]
pub struct TaskStage {
    inner: Arc<StageInner>,
}

impl TaskStage {
    /// A default (broadcast) stage.
    pub fn new(func: SharedStageFunc, config: StageConfig) -> Result<Self, ConfigurationError> {
        Self::with_kind(func, config, StageKind::Default)
    }

    pub(crate) fn with_kind(
        func: SharedStageFunc,
        config: StageConfig,
        kind: StageKind,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let class_name = kind.class_name();
        Ok(Self {
            inner: Arc::new(StageInner {
                func,
                kind,
                class_name: RwLock::new(class_name),
                config: RwLock::new(config),
                metrics: Arc::new(StageMetrics::new()),
                tag: RwLock::new(String::new()),
            }),
        })
    }

    /// Override the class name shown in summaries (Redis stage builders).
    pub(crate) fn set_class_name(&self, name: &'static str) {
        *self.inner.class_name.write().expect("class name lock") = name;
    }

    pub fn tag(&self) -> String {
        self.inner.tag.read().expect("tag lock").clone()
    }

    pub(crate) fn set_tag(&self, tag: impl Into<String>) {
        *self.inner.tag.write().expect("tag lock") = tag.into();
    }

    pub fn func_name(&self) -> String {
        self.inner.func.name().to_string()
    }

    pub fn metrics(&self) -> Arc<StageMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    pub fn kind(&self) -> &StageKind {
        &self.inner.kind
    }

    pub fn config(&self) -> StageConfig {
        self.inner.config.read().expect("config lock").clone()
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.inner.config.read().expect("config lock").execution_mode
    }

    pub fn stage_mode(&self) -> StageMode {
        self.inner.config.read().expect("config lock").stage_mode
    }

    pub fn set_stage_mode(&self, mode: StageMode) {
        self.inner.config.write().expect("config lock").stage_mode = mode;
    }

    pub fn set_execution_mode(&self, mode: ExecutionMode) {
        self.inner.config.write().expect("config lock").execution_mode = mode;
    }

    /// Accumulate error kinds that should re-enter the input.
    pub fn add_retry_kinds<I, S>(&self, kinds: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut config = self.inner.config.write().expect("config lock");
        config.retry_kinds.extend(kinds.into_iter().map(Into::into));
    }

    pub fn summary(&self) -> StageSummary {
        let config = self.inner.config.read().expect("config lock");
        StageSummary {
            stage_mode: config.stage_mode.as_str().to_string(),
            execution_mode: config.execution_mode.as_str().to_string(),
            func_name: self.inner.func.name().to_string(),
            class_name: (*self.inner.class_name.read().expect("class name lock")).to_string(),
        }
    }

    /// The counter a downstream stage binds into its `task_counter`:
    /// splitters contribute children, routers contribute per-target
    /// deliveries, everything else contributes successes.
    pub(crate) fn contribution_counter_for(&self, successor_tag: &str) -> Arc<AtomicU64> {
        match &self.inner.kind {
            StageKind::Default => Arc::clone(&self.inner.metrics.success_counter),
            StageKind::Splitter { split_counter } => Arc::clone(split_counter),
            StageKind::Router { route_counters } => Arc::clone(
                &route_counters
                    .entry(successor_tag.to_string())
                    .or_insert_with(|| Arc::new(AtomicU64::new(0))),
            ),
        }
    }

    /// Per-target delivery counts (router stages only).
    pub fn route_counts(&self) -> Option<std::collections::HashMap<String, u64>> {
        match &self.inner.kind {
            StageKind::Router { route_counters } => Some(
                route_counters
                    .iter()
                    .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Total children emitted (splitter stages only).
    pub fn split_count(&self) -> Option<u64> {
        match &self.inner.kind {
            StageKind::Splitter { split_counter } => Some(split_counter.load(Ordering::Relaxed)),
            _ => None,
        }
    }

    /// Fresh-run reset: clears retry/dedup maps and zeroes all counters
    /// this stage owns, including its specialization counters.
    pub(crate) fn reset_for_run(&self) {
        self.inner.metrics.reset_state();
        self.inner.metrics.reset_counters();
        match &self.inner.kind {
            StageKind::Default => {}
            StageKind::Splitter { split_counter } => split_counter.store(0, Ordering::Relaxed),
            StageKind::Router { route_counters } => {
                for entry in route_counters.iter() {
                    entry.value().store(0, Ordering::Relaxed);
                }
            }
        }
    }

    /// Run until all upstream terminations arrive, then emit one
    /// termination on every outbound channel and return.
    ///
    /// User-function errors never fail this future; a panicked worker
    /// does, but only after the termination signal has been propagated so
    /// the rest of the graph can finish.
    pub(crate) async fn start_stage(&self, io: StageIo) -> Result<(), FlowError> {
        let started = Instant::now();
        let tag = self.tag();
        let config = self.config();
        info!(
            stage = %tag,
            execution_mode = %config.execution_mode,
            workers = config.worker_limit,
            "stage started"
        );

        let pool_result = match config.execution_mode {
            ExecutionMode::Serial => self.run_pool(1, &io).await,
            ExecutionMode::Thread => self.run_pool(config.worker_limit, &io).await,
            ExecutionMode::Async => self.run_cooperative(config.worker_limit, &io).await,
        };

        // Drain retry re-injections that landed behind the termination
        // marker. Each envelope has a bounded retry budget, so this loop
        // terminates.
        loop {
            let residual = io.in_q.drain_residual();
            if residual.is_empty() {
                break;
            }
            for envelope in residual {
                self.process_envelope(envelope, &io).await;
            }
        }

        // Termination is propagated even after a fatal pool failure, so
        // downstream stages can still quiesce.
        let merged = io
            .in_q
            .merged_signal()
            .unwrap_or_else(TerminationSignal::mint);
        io.out_q.put(QueueItem::Termination(merged));

        let counts = self.inner.metrics.counts();
        info!(
            stage = %tag,
            execution_mode = %config.execution_mode,
            elapsed_secs = started.elapsed().as_secs_f64(),
            successed = counts.tasks_successed,
            failed = counts.tasks_failed,
            duplicated = counts.tasks_duplicated,
            "stage stopped"
        );

        pool_result
    }

    /// `workers` independent loops draining the shared fan-in queue.
    async fn run_pool(&self, workers: usize, io: &StageIo) -> Result<(), FlowError> {
        let mut pool = JoinSet::new();
        for _ in 0..workers {
            let stage = self.clone();
            let io = io.clone();
            pool.spawn(async move {
                loop {
                    match io.in_q.get().await {
                        QueueItem::Termination(_) => break,
                        QueueItem::Task(envelope) => stage.process_envelope(envelope, &io).await,
                    }
                }
            });
        }

        let mut fatal = None;
        while let Some(joined) = pool.join_next().await {
            if let Err(join_err) = joined {
                warn!(stage = %self.tag(), error = %join_err, "worker aborted");
                fatal = Some(FlowError::fatal(join_err.to_string()));
            }
        }
        match fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Single cooperative loop keeping up to `limit` tasks in flight.
    async fn run_cooperative(&self, limit: usize, io: &StageIo) -> Result<(), FlowError> {
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut in_flight = JoinSet::new();
        let mut fatal = None;

        loop {
            let item = io.in_q.get().await;
            match item {
                QueueItem::Termination(_) => break,
                QueueItem::Task(envelope) => {
                    let permit = Arc::clone(&semaphore)
                        .acquire_owned()
                        .await
                        .expect("stage semaphore closed");
                    let stage = self.clone();
                    let io = io.clone();
                    in_flight.spawn(async move {
                        let _permit = permit;
                        stage.process_envelope(envelope, &io).await;
                    });
                    // Reap already-finished tasks so the set stays small.
                    while let Some(joined) = in_flight.try_join_next() {
                        if let Err(join_err) = joined {
                            warn!(stage = %self.tag(), error = %join_err, "in-flight task aborted");
                            fatal = Some(FlowError::fatal(join_err.to_string()));
                        }
                    }
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(join_err) = joined {
                warn!(stage = %self.tag(), error = %join_err, "in-flight task aborted");
                fatal = Some(FlowError::fatal(join_err.to_string()));
            }
        }
        match fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// The per-task pipeline.
    async fn process_envelope(&self, envelope: TaskEnvelope, io: &StageIo) {
        let started = Instant::now();
        let config = self.config();

        if config.enable_duplicate_check && self.inner.metrics.is_processed(&envelope.id) {
            self.inner.metrics.record_duplicate();
            debug!(stage = %self.tag(), id = %envelope.id, "duplicate skipped");
            return;
        }

        let args = extract_args(&envelope.task, config.unpack_task_args);
        match self.inner.func.call(args).await {
            Ok(result) => {
                if let Err(err) = self.emit_success(&envelope, result, started, io) {
                    self.emit_failure(&envelope, err, io);
                }
            }
            Err(err) => {
                let attempts = self.inner.metrics.retry_attempts(&envelope.id);
                if config.retry_kinds.contains(&err.kind) && attempts < config.max_retries {
                    let attempt = self.inner.metrics.bump_retry(&envelope.id);
                    debug!(
                        stage = %self.tag(),
                        id = %envelope.id,
                        attempt,
                        max_retries = config.max_retries,
                        error = %err,
                        "retrying"
                    );
                    io.in_q.put_first(QueueItem::Task(envelope));
                    return;
                }
                self.emit_failure(&envelope, err, io);
            }
        }

        if config.enable_duplicate_check {
            self.inner.metrics.mark_processed(&envelope.id);
        }
    }

    fn emit_success(
        &self,
        envelope: &TaskEnvelope,
        result: TaskValue,
        started: Instant,
        io: &StageIo,
    ) -> Result<(), UserFuncError> {
        match &self.inner.kind {
            StageKind::Default => {
                io.out_q.put(QueueItem::Task(TaskEnvelope::wrap(result)));
                self.inner.metrics.record_success();
                self.inner.metrics.clear_retry(&envelope.id);
                trace!(
                    stage = %self.tag(),
                    func = self.inner.func.name(),
                    id = %envelope.id,
                    elapsed_secs = started.elapsed().as_secs_f64(),
                    "task succeeded"
                );
                Ok(())
            }
            StageKind::Splitter { split_counter } => {
                let elements = split_sequence(result);
                let count = elements.len() as u64;
                for element in elements {
                    let child_id = io.provenance.emit(
                        EventKind::TaskSplit,
                        std::slice::from_ref(&envelope.id),
                        Some(&element),
                    );
                    io.out_q
                        .put(QueueItem::Task(TaskEnvelope::with_id(element, child_id)));
                }
                split_counter.fetch_add(count, Ordering::Relaxed);
                self.inner.metrics.record_success();
                self.inner.metrics.clear_retry(&envelope.id);
                debug!(
                    stage = %self.tag(),
                    id = %envelope.id,
                    children = count,
                    elapsed_secs = started.elapsed().as_secs_f64(),
                    "split"
                );
                Ok(())
            }
            StageKind::Router { route_counters } => {
                let (target, payload) = parse_routed(&result)?;
                let counter = route_counters
                    .get(&target)
                    .map(|entry| Arc::clone(entry.value()))
                    .ok_or_else(|| {
                        UserFuncError::new(
                            "ConfigurationError",
                            format!("Unknown target: {target}"),
                        )
                    })?;

                let routed_id = io.provenance.emit(
                    EventKind::TaskRoute,
                    std::slice::from_ref(&envelope.id),
                    Some(&payload),
                );
                io.out_q
                    .put_target(
                        QueueItem::Task(TaskEnvelope::with_id(payload, routed_id)),
                        &target,
                    )
                    .map_err(|err| UserFuncError::new("ConfigurationError", err.to_string()))?;
                counter.fetch_add(1, Ordering::Relaxed);
                self.inner.metrics.record_success();
                self.inner.metrics.clear_retry(&envelope.id);
                debug!(
                    stage = %self.tag(),
                    id = %envelope.id,
                    target = %target,
                    elapsed_secs = started.elapsed().as_secs_f64(),
                    "routed"
                );
                Ok(())
            }
        }
    }

    fn emit_failure(&self, envelope: &TaskEnvelope, err: UserFuncError, io: &StageIo) {
        self.inner.metrics.record_error();
        self.inner.metrics.clear_retry(&envelope.id);
        let record = FailureRecord {
            timestamp: now_epoch(),
            stage_tag: self.tag(),
            error: err.to_string(),
            error_id: envelope.id.clone(),
            task: envelope.task.to_string(),
        };
        warn!(
            stage = %record.stage_tag,
            id = %envelope.id,
            error = %record.error,
            "task failed"
        );
        if io.fail_tx.send(record).is_err() {
            warn!(stage = %self.tag(), "failure channel closed; record dropped");
        }
    }
}

/// Unix seconds with sub-second precision.
pub(crate) fn now_epoch() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

/// Compute the argument list from a payload.
fn extract_args(task: &TaskValue, unpack: bool) -> Vec<TaskValue> {
    match (unpack, task) {
        (true, TaskValue::Array(items)) => items.clone(),
        _ => vec![task.clone()],
    }
}

/// Convert a splitter result into a finite ordered sequence. Strings (and
/// every other non-array value) are single-element.
fn split_sequence(result: TaskValue) -> Vec<TaskValue> {
    match result {
        TaskValue::Array(items) => items,
        other => vec![other],
    }
}

/// Validate a router result: a two-element array of `[target, payload]`.
fn parse_routed(result: &TaskValue) -> Result<(String, TaskValue), UserFuncError> {
    let TaskValue::Array(items) = result else {
        return Err(UserFuncError::new(
            "TypeError",
            format!("router expects [target, payload], got {result}"),
        ));
    };
    if items.len() != 2 {
        return Err(UserFuncError::new(
            "TypeError",
            format!("router expects [target, payload], got {} elements", items.len()),
        ));
    }
    let Some(target) = items[0].as_str() else {
        return Err(UserFuncError::new(
            "TypeError",
            format!("router target must be a string, got {}", items[0]),
        ));
    };
    Ok((target.to_string(), items[1].clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::func::FnStage;
    use crate::queue::{Direction, TaskChannel, TaskQueue};
    use celestialflow_shared::HashProvenance;
    use serde_json::json;

    fn io_for(stage: &TaskStage, in_tags: &[&str], out_tags: &[&str]) -> StageIo {
        let provenance = HashProvenance::shared();
        let in_q = TaskQueue::new(
            in_tags.iter().map(|t| TaskChannel::unbounded(*t)).collect(),
            Direction::In,
            stage.tag(),
            Arc::clone(&provenance),
        )
        .unwrap();
        let out_q = TaskQueue::new(
            out_tags.iter().map(|t| TaskChannel::unbounded(*t)).collect(),
            Direction::Out,
            stage.tag(),
            Arc::clone(&provenance),
        )
        .unwrap();
        let (fail_tx, _fail_rx) = crossbeam::channel::unbounded();
        StageIo {
            in_q: Arc::new(in_q),
            out_q: Arc::new(out_q),
            fail_tx,
            provenance,
        }
    }

    fn square_stage() -> TaskStage {
        let func = FnStage::new("square", |args: Vec<TaskValue>| {
            let n = args[0].as_i64().unwrap_or(0);
            Ok(json!(n * n))
        });
        let stage = TaskStage::new(func, StageConfig::default()).unwrap();
        stage.set_tag("square");
        stage
    }

    #[test]
    fn zero_worker_limit_is_rejected() {
        let func = FnStage::new("noop", |args: Vec<TaskValue>| Ok(args[0].clone()));
        let config = StageConfig {
            worker_limit: 0,
            ..StageConfig::default()
        };
        assert!(matches!(
            TaskStage::new(func, config),
            Err(ConfigurationError::ZeroWorkerLimit)
        ));
    }

    #[test]
    fn extract_args_unpacks_arrays_only_when_asked() {
        let task = json!([1, 2, 3]);
        assert_eq!(extract_args(&task, false), vec![task.clone()]);
        assert_eq!(
            extract_args(&task, true),
            vec![json!(1), json!(2), json!(3)]
        );
        let scalar = json!(5);
        assert_eq!(extract_args(&scalar, true), vec![scalar.clone()]);
    }

    #[test]
    fn split_sequence_treats_strings_as_single_element() {
        assert_eq!(split_sequence(json!("abc")), vec![json!("abc")]);
        assert_eq!(
            split_sequence(json!(["a", "b"])),
            vec![json!("a"), json!("b")]
        );
        assert_eq!(split_sequence(json!(7)), vec![json!(7)]);
    }

    #[test]
    fn parse_routed_validates_shape() {
        assert!(parse_routed(&json!("down")).is_err());
        assert!(parse_routed(&json!(["down"])).is_err());
        assert!(parse_routed(&json!([1, 2])).is_err());
        let (target, payload) = parse_routed(&json!(["down", 9])).unwrap();
        assert_eq!(target, "down");
        assert_eq!(payload, json!(9));
    }

    #[tokio::test]
    async fn stage_processes_until_termination_and_propagates_it() {
        let stage = square_stage();
        let io = io_for(&stage, &["ingress"], &["next"]);

        for n in [2, 3] {
            io.in_q
                .put_channel(QueueItem::Task(TaskEnvelope::wrap(json!(n))), 0);
        }
        io.in_q.put_channel(
            QueueItem::Termination(TerminationSignal::new("t0")),
            0,
        );

        stage.start_stage(io.clone()).await.unwrap();

        let counts = stage.metrics().counts();
        assert_eq!(counts.tasks_successed, 2);
        assert_eq!(counts.tasks_failed, 0);

        // Two results then exactly one termination, in that order.
        let mut results = Vec::new();
        loop {
            match io.out_q.get().await {
                QueueItem::Task(env) => results.push(env.task.as_i64().unwrap()),
                QueueItem::Termination(_) => break,
            }
        }
        results.sort_unstable();
        assert_eq!(results, vec![4, 9]);
    }

    #[tokio::test]
    async fn duplicate_envelopes_are_counted_not_rerun() {
        let stage = square_stage();
        let io = io_for(&stage, &["ingress"], &[]);

        for _ in 0..3 {
            io.in_q
                .put_channel(QueueItem::Task(TaskEnvelope::wrap(json!(5))), 0);
        }
        io.in_q.put_channel(
            QueueItem::Termination(TerminationSignal::new("t0")),
            0,
        );
        stage.start_stage(io).await.unwrap();

        let counts = stage.metrics().counts();
        assert_eq!(counts.tasks_successed, 1);
        assert_eq!(counts.tasks_duplicated, 2);
    }

    #[tokio::test]
    async fn terminal_errors_land_on_the_failure_channel() {
        let func = FnStage::new("always_fails", |_args: Vec<TaskValue>| {
            Err(UserFuncError::new("ValueError", "nope"))
        });
        let stage = TaskStage::new(func, StageConfig::default()).unwrap();
        stage.set_tag("failing");
        let (fail_tx, fail_rx) = crossbeam::channel::unbounded();
        let mut io = io_for(&stage, &["ingress"], &[]);
        io.fail_tx = fail_tx;

        io.in_q
            .put_channel(QueueItem::Task(TaskEnvelope::wrap(json!(1))), 0);
        io.in_q.put_channel(
            QueueItem::Termination(TerminationSignal::new("t0")),
            0,
        );
        stage.start_stage(io).await.unwrap();

        let record = fail_rx.try_recv().unwrap();
        assert_eq!(record.stage_tag, "failing");
        assert_eq!(record.error, "ValueError(nope)");
        assert_eq!(stage.metrics().counts().tasks_failed, 1);
    }

    #[tokio::test]
    async fn retryable_errors_reenter_the_input_up_to_the_bound() {
        use std::sync::atomic::AtomicU32;
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&attempts);
        let func = FnStage::new("flaky", move |_args: Vec<TaskValue>| {
            let n = seen.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(UserFuncError::new("FlakyError", "transient"))
            } else {
                Ok(json!("ok"))
            }
        });
        let config = StageConfig {
            max_retries: 3,
            retry_kinds: HashSet::from(["FlakyError".to_string()]),
            ..StageConfig::default()
        };
        let stage = TaskStage::new(func, config).unwrap();
        stage.set_tag("flaky");
        let io = io_for(&stage, &["ingress"], &[]);

        io.in_q
            .put_channel(QueueItem::Task(TaskEnvelope::wrap(json!(1))), 0);
        io.in_q.put_channel(
            QueueItem::Termination(TerminationSignal::new("t0")),
            0,
        );
        stage.start_stage(io).await.unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let counts = stage.metrics().counts();
        assert_eq!(counts.tasks_successed, 1);
        assert_eq!(counts.tasks_failed, 0);
    }

    #[tokio::test]
    async fn retry_bound_is_enforced() {
        let func = FnStage::new("hopeless", |_args: Vec<TaskValue>| {
            Err(UserFuncError::new("FlakyError", "always"))
        });
        let config = StageConfig {
            max_retries: 2,
            retry_kinds: HashSet::from(["FlakyError".to_string()]),
            ..StageConfig::default()
        };
        let stage = TaskStage::new(func, config).unwrap();
        stage.set_tag("hopeless");
        let (fail_tx, fail_rx) = crossbeam::channel::unbounded();
        let mut io = io_for(&stage, &["ingress"], &[]);
        io.fail_tx = fail_tx;

        io.in_q
            .put_channel(QueueItem::Task(TaskEnvelope::wrap(json!(1))), 0);
        io.in_q.put_channel(
            QueueItem::Termination(TerminationSignal::new("t0")),
            0,
        );
        stage.start_stage(io).await.unwrap();

        // Original attempt + 2 retries, then one terminal failure.
        assert_eq!(fail_rx.len(), 1);
        assert_eq!(stage.metrics().counts().tasks_failed, 1);
    }
}
