//! # TaskGraph
//!
//! Topology and lifecycle driver over a flat registry of stages. Stages
//! are referred to by index handles; edges are registered while wiring and
//! frozen at `set_roots`, which also binds downstream input counters,
//! analyzes the topology, and prepares the shared run state.
//!
//! Each `start_graph` run builds a fresh channel fabric, injects initial
//! tasks (plus one termination signal per root unless disabled), drives
//! every stage to completion per the layout mode, then aggregates failures
//! in memory and on disk.

mod status;
mod topology;

pub use status::{HistorySample, StageStatusSnapshot};
pub(crate) use status::{GraphShared, StageRuntime};
pub use topology::Topology;

use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use crossbeam::channel::{Receiver, Sender};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use celestialflow_shared::config::{FallbackConfig, ReporterConfig};
use celestialflow_shared::{
    ConfigurationError, FlowError, FlowResult, HashProvenance, QueueItem, SharedProvenance,
    StageMode, TaskEnvelope, TaskValue, TerminationSignal,
};

use crate::persist::FallbackWriter;
use crate::queue::{Direction, TaskChannel, TaskQueue};
use crate::reporter::{InjectionTarget, ReporterHandle, TaskReporter};
use crate::stage::{FailureRecord, StageIo, TaskStage};

/// How long a still-running stage gets after a shutdown request before it
/// is forcibly cancelled.
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Opaque reference to a stage registered with a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageHandle(pub(crate) usize);

/// Graph-level scheduling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutMode {
    /// Start every stage concurrently; dependencies resolve through queue
    /// flow.
    Process,
    /// Start one layer at a time, in level order. DAG only.
    Serial,
}

impl LayoutMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayoutMode::Process => "process",
            LayoutMode::Serial => "serial",
        }
    }
}

impl FromStr for LayoutMode {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "process" => Ok(LayoutMode::Process),
            "serial" => Ok(LayoutMode::Serial),
            other => Err(ConfigurationError::invalid_option(
                "layout mode",
                other,
                &["serial", "process"],
            )),
        }
    }
}

/// External stop switch for graphs without natural termination (loops,
/// complete graphs).
#[derive(Debug, Clone)]
pub struct GraphShutdown {
    tx: watch::Sender<bool>,
}

impl GraphShutdown {
    /// Request shutdown. Stages get a grace period to finish naturally
    /// before being cancelled.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// Outcome of one graph run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub elapsed: Duration,
    /// `(error_info, stage_tag)` → task strings that hit it.
    pub by_error: HashMap<(String, String), Vec<String>>,
    /// `stage_tag` → task strings that failed there.
    pub by_stage: HashMap<String, Vec<String>>,
}

/// Result of [`TaskGraph::test_methods`].
#[derive(Debug, Clone)]
pub struct BenchReport {
    /// `time_table[i][j]` is the wall-clock of `stage_modes[i]` ×
    /// `execution_modes[j]`.
    pub time_table: Vec<Vec<Duration>>,
    pub stage_modes: Vec<StageMode>,
    pub execution_modes: Vec<celestialflow_shared::ExecutionMode>,
    pub by_error: HashMap<(String, String), Vec<String>>,
    pub by_stage: HashMap<String, Vec<String>>,
}

struct StageEntry {
    stage: TaskStage,
    next: Vec<usize>,
    prev: Vec<Option<usize>>,
}

/// Per-run channel fabric.
struct RunFabric {
    in_queues: HashMap<usize, Arc<TaskQueue>>,
    out_queues: HashMap<usize, Arc<TaskQueue>>,
    /// First ingress channel of each stage, for task injection.
    ingress: HashMap<usize, TaskChannel>,
    fail_tx: Sender<FailureRecord>,
    fail_rx: Receiver<FailureRecord>,
}

/// A directed graph of stages and its lifecycle driver.
pub struct TaskGraph {
    entries: Vec<StageEntry>,
    tag_to_idx: HashMap<String, usize>,
    roots: Vec<usize>,
    /// Reachable stages in BFS-from-roots order.
    active: Vec<usize>,
    layout_mode: LayoutMode,
    provenance: SharedProvenance,
    fallback: FallbackConfig,
    reporter_config: ReporterConfig,
    is_report: bool,
    shutdown_grace: Duration,
    topology: Topology,
    finalized: bool,
    shared: Option<Arc<GraphShared>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    error_timeline: HashMap<(String, String), Vec<(String, f64)>>,
    stage_errors: HashMap<String, HashMap<String, (String, String)>>,
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("stages", &self.entries.len())
            .field("roots", &self.roots)
            .field("layout_mode", &self.layout_mode)
            .field("finalized", &self.finalized)
            .finish_non_exhaustive()
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskGraph {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            entries: Vec::new(),
            tag_to_idx: HashMap::new(),
            roots: Vec::new(),
            active: Vec::new(),
            layout_mode: LayoutMode::Process,
            provenance: HashProvenance::shared(),
            fallback: FallbackConfig::default(),
            reporter_config: ReporterConfig::default(),
            is_report: false,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            topology: Topology::default(),
            finalized: false,
            shared: None,
            shutdown_tx,
            shutdown_rx,
            error_timeline: HashMap::new(),
            stage_errors: HashMap::new(),
        }
    }

    pub fn with_layout(layout_mode: LayoutMode) -> Self {
        let mut graph = Self::new();
        graph.layout_mode = layout_mode;
        graph
    }

    /// Register a stage; wiring happens through [`set_graph_context`].
    ///
    /// [`set_graph_context`]: TaskGraph::set_graph_context
    pub fn add_stage(&mut self, stage: TaskStage) -> StageHandle {
        self.entries.push(StageEntry {
            stage,
            next: Vec::new(),
            prev: Vec::new(),
        });
        StageHandle(self.entries.len() - 1)
    }

    /// Wire a stage into the graph: successors, stage mode, and name (the
    /// name doubles as the unique stage tag).
    pub fn set_graph_context(
        &mut self,
        handle: StageHandle,
        next: &[StageHandle],
        stage_mode: StageMode,
        name: &str,
    ) {
        let idx = handle.0;
        self.entries[idx].stage.set_stage_mode(stage_mode);
        self.entries[idx].stage.set_tag(name);
        for &StageHandle(succ) in next {
            if !self.entries[idx].next.contains(&succ) {
                self.entries[idx].next.push(succ);
            }
            if !self.entries[succ].prev.contains(&Some(idx)) {
                self.entries[succ].prev.push(Some(idx));
            }
        }
    }

    /// Freeze the graph: roots, reachability, tags, counter bindings, and
    /// topology. Call once, after all wiring.
    pub fn set_roots(&mut self, roots: &[StageHandle]) -> FlowResult<()> {
        self.roots = roots.iter().map(|h| h.0).collect();
        for &root in &self.roots {
            if self.entries[root].prev.is_empty() {
                // Synthetic ingress source for roots with no predecessor.
                self.entries[root].prev.push(None);
            }
        }

        // Reachability walk.
        let mut seen = HashSet::new();
        let mut active = Vec::new();
        let mut queue: VecDeque<usize> = self.roots.iter().copied().collect();
        while let Some(idx) = queue.pop_front() {
            if !seen.insert(idx) {
                continue;
            }
            active.push(idx);
            queue.extend(self.entries[idx].next.iter().copied());
        }

        // Unique tags.
        let mut tag_to_idx = HashMap::with_capacity(active.len());
        for &idx in &active {
            let mut tag = self.entries[idx].stage.tag();
            if tag.is_empty() {
                tag = format!("stage-{idx}");
                self.entries[idx].stage.set_tag(&tag);
            }
            if tag_to_idx.insert(tag.clone(), idx).is_some() {
                return Err(ConfigurationError::DuplicateQueueTag(tag).into());
            }
        }

        // Counter bindings: each stage learns its total expected input by
        // summing per-predecessor contribution counters.
        for &idx in &active {
            let tag = self.entries[idx].stage.tag();
            let preds: Vec<usize> = self.entries[idx].prev.iter().flatten().copied().collect();
            for pred in preds {
                let counter = self.entries[pred].stage.contribution_counter_for(&tag);
                self.entries[idx]
                    .stage
                    .metrics()
                    .task_counter
                    .append_counter(counter);
            }
        }

        // Topology over active positions.
        let pos: HashMap<usize, usize> = active.iter().enumerate().map(|(p, &i)| (i, p)).collect();
        let mut edges = Vec::new();
        for &idx in &active {
            for &succ in &self.entries[idx].next {
                if let (Some(&from), Some(&to)) = (pos.get(&idx), pos.get(&succ)) {
                    edges.push((from, to));
                }
            }
        }
        self.topology = topology::analyze(active.len(), &edges);
        if self.layout_mode == LayoutMode::Serial && !self.topology.is_dag {
            warn!("serial layout requires a DAG; falling back to process layout");
            self.layout_mode = LayoutMode::Process;
        }

        let runtimes = active
            .iter()
            .map(|&idx| {
                Arc::new(StageRuntime::new(
                    self.entries[idx].stage.clone(),
                    self.entries[idx].stage.tag(),
                ))
            })
            .collect();
        self.shared = Some(Arc::new(GraphShared::new(
            runtimes,
            self.reporter_config.interval.as_secs_f64(),
        )));

        self.tag_to_idx = tag_to_idx;
        self.active = active;
        self.finalized = true;
        Ok(())
    }

    /// Switch layout after finalization. Serial on a cyclic graph is a
    /// configuration error.
    pub fn set_layout_mode(&mut self, layout_mode: LayoutMode) -> Result<(), ConfigurationError> {
        if layout_mode == LayoutMode::Serial && self.finalized && !self.topology.is_dag {
            return Err(ConfigurationError::SerialLayoutRequiresDag);
        }
        self.layout_mode = layout_mode;
        Ok(())
    }

    pub fn layout_mode(&self) -> LayoutMode {
        self.layout_mode
    }

    pub fn is_dag(&self) -> bool {
        self.topology.is_dag
    }

    /// Override stage and execution modes on every reachable stage.
    pub fn set_graph_mode(
        &mut self,
        stage_mode: StageMode,
        execution_mode: celestialflow_shared::ExecutionMode,
    ) {
        for &idx in &self.active {
            self.entries[idx].stage.set_stage_mode(stage_mode);
            self.entries[idx].stage.set_execution_mode(execution_mode);
        }
    }

    pub fn set_provenance(&mut self, provenance: SharedProvenance) {
        self.provenance = provenance;
    }

    pub fn set_fallback(&mut self, fallback: FallbackConfig) {
        self.fallback = fallback;
    }

    /// Enable or disable the reporter for subsequent runs.
    pub fn set_reporter(&mut self, enabled: bool, config: ReporterConfig) {
        self.is_report = enabled;
        if let Some(shared) = &self.shared {
            shared.set_interval(config.interval.as_secs_f64());
        }
        self.reporter_config = config;
    }

    pub fn set_shutdown_grace(&mut self, grace: Duration) {
        self.shutdown_grace = grace;
    }

    /// Handle for stopping a run externally (required for loop graphs).
    pub fn shutdown_handle(&self) -> GraphShutdown {
        GraphShutdown {
            tx: self.shutdown_tx.clone(),
        }
    }

    pub fn stage_tags(&self) -> Vec<String> {
        self.active
            .iter()
            .map(|&idx| self.entries[idx].stage.tag())
            .collect()
    }

    pub fn stage(&self, handle: StageHandle) -> &TaskStage {
        &self.entries[handle.0].stage
    }

    /// `(error_info, stage_tag)` → failing task strings, from the last run.
    pub fn get_fail_by_error(&self) -> HashMap<(String, String), Vec<String>> {
        self.error_timeline
            .iter()
            .map(|(key, entries)| {
                (
                    key.clone(),
                    entries.iter().map(|(task, _)| task.clone()).collect(),
                )
            })
            .collect()
    }

    /// `stage_tag` → failing task strings, from the last run.
    pub fn get_fail_by_stage(&self) -> HashMap<String, Vec<String>> {
        self.stage_errors
            .iter()
            .map(|(stage, tasks)| (stage.clone(), tasks.keys().cloned().collect()))
            .collect()
    }

    /// Current per-stage status snapshots (advances delta bookkeeping).
    pub fn get_status_dict(&self) -> HashMap<String, StageStatusSnapshot> {
        match &self.shared {
            Some(shared) => shared.snapshot(),
            None => HashMap::new(),
        }
    }

    /// Topology description for the reporter.
    pub fn get_graph_topology(&self) -> TaskValue {
        let layers: HashMap<String, Vec<String>> = self
            .topology
            .layers
            .iter()
            .map(|(level, positions)| {
                (
                    level.to_string(),
                    positions
                        .iter()
                        .map(|&p| self.entries[self.active[p]].stage.tag())
                        .collect(),
                )
            })
            .collect();
        json!({
            "isDAG": self.topology.is_dag,
            "layout_mode": self.layout_mode.as_str(),
            "class_name": "TaskGraph",
            "layers_dict": layers,
        })
    }

    /// Node/edge structure for the reporter and the start-of-run log.
    pub fn structure_json(&self) -> TaskValue {
        let nodes: Vec<TaskValue> = self
            .active
            .iter()
            .map(|&idx| {
                let entry = &self.entries[idx];
                let summary = entry.stage.summary();
                let next: Vec<String> = entry
                    .next
                    .iter()
                    .map(|&succ| self.entries[succ].stage.tag())
                    .collect();
                let prev: Vec<TaskValue> = entry
                    .prev
                    .iter()
                    .map(|p| match p {
                        Some(pred) => TaskValue::String(self.entries[*pred].stage.tag()),
                        None => TaskValue::Null,
                    })
                    .collect();
                json!({
                    "name": entry.stage.tag(),
                    "class_name": summary.class_name,
                    "func_name": summary.func_name,
                    "execution_mode": summary.execution_mode,
                    "stage_mode": summary.stage_mode,
                    "next": next,
                    "prev": prev,
                })
            })
            .collect();
        TaskValue::Array(nodes)
    }

    /// Human-readable adjacency listing, one line per stage.
    pub fn structure_list(&self) -> Vec<String> {
        self.active
            .iter()
            .map(|&idx| {
                let entry = &self.entries[idx];
                let next: Vec<String> = entry
                    .next
                    .iter()
                    .map(|&succ| self.entries[succ].stage.tag())
                    .collect();
                format!(
                    "{}({}) -> [{}]",
                    entry.stage.tag(),
                    entry.stage.summary().class_name,
                    next.join(", ")
                )
            })
            .collect()
    }

    /// Run the graph to completion over `init_tasks_dict`.
    ///
    /// With `put_termination_signal` (the default for acyclic use), one
    /// termination signal is pushed onto each root ingress after the
    /// initial tasks; loop graphs pass `false` and stop through
    /// [`shutdown_handle`](TaskGraph::shutdown_handle).
    pub async fn start_graph(
        &mut self,
        init_tasks_dict: HashMap<String, Vec<TaskValue>>,
        put_termination_signal: bool,
    ) -> FlowResult<RunReport> {
        if !self.finalized {
            return Err(ConfigurationError::RootsNotSet.into());
        }
        let started = Instant::now();
        let started_local = Local::now();
        let shared = Arc::clone(self.shared.as_ref().expect("finalized graph has run state"));

        // Fresh run state.
        let _ = self.shutdown_tx.send(false);
        shared.reset();
        for &idx in &self.active {
            self.entries[idx].stage.reset_for_run();
        }
        self.error_timeline.clear();
        self.stage_errors.clear();

        let fabric = self.build_fabric()?;
        let errors_writer = FallbackWriter::for_run(&self.fallback, "realtime_errors", started_local);

        for line in self.structure_list() {
            info!(structure = %line, "graph structure");
        }
        info!(layout = self.layout_mode.as_str(), is_dag = self.topology.is_dag, "graph started");
        errors_writer.append(&json!({
            "timestamp": started_local.to_rfc3339(),
            "structure": self.structure_json(),
        }));

        let reporter = self.spawn_reporter(&shared, &fabric);

        self.inject_tasks(&fabric, &init_tasks_dict)?;
        if put_termination_signal {
            for &root in &self.roots {
                if let Some(channel) = fabric.ingress.get(&root) {
                    let signal = TerminationSignal::mint();
                    trace!(root = %self.entries[root].stage.tag(), id = %signal.id, "ingress termination");
                    let _ = channel.send(QueueItem::Termination(signal));
                }
            }
        }

        self.execute_stages(&shared, &fabric).await;

        // Aggregate failures: in-memory indexes plus the JSONL fallback.
        self.collect_failures(&shared, &fabric, &errors_writer);
        if self.fallback.persist_leftover_tasks {
            self.persist_leftovers(&fabric, started_local);
        }

        if let Some(reporter) = reporter {
            reporter.stop().await;
        }

        let elapsed = started.elapsed();
        info!(elapsed_secs = elapsed.as_secs_f64(), "graph finished");

        Ok(RunReport {
            elapsed,
            by_error: self.get_fail_by_error(),
            by_stage: self.get_fail_by_stage(),
        })
    }

    /// Cartesian benchmark over stage modes × execution modes.
    pub async fn test_methods(
        &mut self,
        init_tasks_dict: HashMap<String, Vec<TaskValue>>,
        stage_modes: &[StageMode],
        execution_modes: &[celestialflow_shared::ExecutionMode],
    ) -> FlowResult<BenchReport> {
        let stage_modes: Vec<StageMode> = if stage_modes.is_empty() {
            vec![StageMode::Serial, StageMode::Process]
        } else {
            stage_modes.to_vec()
        };
        let execution_modes: Vec<celestialflow_shared::ExecutionMode> =
            if execution_modes.is_empty() {
                vec![
                    celestialflow_shared::ExecutionMode::Serial,
                    celestialflow_shared::ExecutionMode::Thread,
                ]
            } else {
                execution_modes.to_vec()
            };

        let mut time_table = Vec::with_capacity(stage_modes.len());
        let mut by_error = HashMap::new();
        let mut by_stage = HashMap::new();

        for &stage_mode in &stage_modes {
            let mut row = Vec::with_capacity(execution_modes.len());
            for &execution_mode in &execution_modes {
                self.set_graph_mode(stage_mode, execution_mode);
                let run_started = Instant::now();
                let report = self.start_graph(init_tasks_dict.clone(), true).await?;
                row.push(run_started.elapsed());
                by_error.extend(report.by_error);
                by_stage.extend(report.by_stage);
            }
            time_table.push(row);
        }

        Ok(BenchReport {
            time_table,
            stage_modes,
            execution_modes,
            by_error,
            by_stage,
        })
    }

    // =========================================================================
    // Run internals
    // =========================================================================

    fn build_fabric(&self) -> FlowResult<RunFabric> {
        let (fail_tx, fail_rx) = crossbeam::channel::unbounded();
        let mut edge_channels: HashMap<(Option<usize>, usize), TaskChannel> = HashMap::new();
        let mut in_queues = HashMap::new();
        let mut out_queues = HashMap::new();
        let mut ingress = HashMap::new();

        for &idx in &self.active {
            let entry = &self.entries[idx];
            let mut channels = Vec::with_capacity(entry.prev.len());
            for prev in &entry.prev {
                let tag = match prev {
                    Some(pred) => self.entries[*pred].stage.tag(),
                    None => "__source__".to_string(),
                };
                let channel = TaskChannel::unbounded(tag);
                edge_channels.insert((*prev, idx), channel.clone());
                channels.push(channel);
            }
            if let Some(first) = channels.first() {
                ingress.insert(idx, first.clone());
            }
            let queue = TaskQueue::new(
                channels,
                Direction::In,
                entry.stage.tag(),
                Arc::clone(&self.provenance),
            )?;
            in_queues.insert(idx, Arc::new(queue));
        }

        for &idx in &self.active {
            let entry = &self.entries[idx];
            let mut channels = Vec::with_capacity(entry.next.len());
            for &succ in &entry.next {
                let mut channel = edge_channels
                    .get(&(Some(idx), succ))
                    .expect("edge channel exists for registered successor")
                    .clone();
                // The producer side labels the edge by its destination.
                channel.tag = self.entries[succ].stage.tag();
                channels.push(channel);
            }
            let queue = TaskQueue::new(
                channels,
                Direction::Out,
                entry.stage.tag(),
                Arc::clone(&self.provenance),
            )?;
            out_queues.insert(idx, Arc::new(queue));
        }

        Ok(RunFabric {
            in_queues,
            out_queues,
            ingress,
            fail_tx,
            fail_rx,
        })
    }

    fn io_for(&self, fabric: &RunFabric, idx: usize) -> StageIo {
        StageIo {
            in_q: Arc::clone(&fabric.in_queues[&idx]),
            out_q: Arc::clone(&fabric.out_queues[&idx]),
            fail_tx: fabric.fail_tx.clone(),
            provenance: Arc::clone(&self.provenance),
        }
    }

    fn inject_tasks(
        &self,
        fabric: &RunFabric,
        init_tasks_dict: &HashMap<String, Vec<TaskValue>>,
    ) -> FlowResult<()> {
        for (tag, tasks) in init_tasks_dict {
            let idx = *self
                .tag_to_idx
                .get(tag)
                .ok_or_else(|| ConfigurationError::UnknownStage(tag.clone()))?;
            let channel = fabric
                .ingress
                .get(&idx)
                .ok_or_else(|| ConfigurationError::UnknownStage(tag.clone()))?;
            let metrics = self.entries[idx].stage.metrics();
            for task in tasks {
                let envelope = TaskEnvelope::wrap(task.clone());
                trace!(stage = %tag, id = %envelope.id, "init task injected");
                let _ = channel.send(QueueItem::Task(envelope));
                metrics.task_counter.add_init_value(1);
            }
        }
        Ok(())
    }

    async fn execute_stages(&self, shared: &Arc<GraphShared>, fabric: &RunFabric) {
        match self.layout_mode {
            LayoutMode::Process => {
                let positions: Vec<usize> = (0..self.active.len()).collect();
                self.run_positions(&positions, shared, fabric).await;
            }
            LayoutMode::Serial => {
                let layers: Vec<(usize, Vec<usize>)> = self
                    .topology
                    .layers
                    .iter()
                    .map(|(level, positions)| (*level, positions.clone()))
                    .collect();
                for (level, positions) in layers {
                    let tags: Vec<String> = positions
                        .iter()
                        .map(|&p| shared.stages[p].tag.clone())
                        .collect();
                    info!(level, stages = ?tags, "layer started");
                    let layer_started = Instant::now();
                    self.run_positions(&positions, shared, fabric).await;
                    info!(
                        level,
                        elapsed_secs = layer_started.elapsed().as_secs_f64(),
                        "layer finished"
                    );
                }
            }
        }
    }

    /// Start the stages at `positions`: process-mode ones spawned, serial
    /// ones awaited inline in order. Returns when all have stopped.
    async fn run_positions(
        &self,
        positions: &[usize],
        shared: &Arc<GraphShared>,
        fabric: &RunFabric,
    ) {
        let mut handles: Vec<(usize, JoinHandle<()>)> = Vec::new();
        for &pos in positions {
            let idx = self.active[pos];
            let runtime = Arc::clone(&shared.stages[pos]);
            let io = self.io_for(fabric, idx);
            let stage = self.entries[idx].stage.clone();
            let rx = self.shutdown_rx.clone();
            let grace = self.shutdown_grace;
            runtime.mark_running();

            if stage.stage_mode() == StageMode::Process {
                handles.push((
                    pos,
                    tokio::spawn(async move {
                        let code = run_stage_guarded(stage, io, rx, grace).await;
                        runtime.mark_stopped(code);
                    }),
                ));
            } else {
                let code = run_stage_guarded(stage, io, rx, grace).await;
                runtime.mark_stopped(code);
            }
        }

        for (pos, handle) in handles {
            if let Err(join_err) = handle.await {
                warn!(
                    stage = %shared.stages[pos].tag,
                    error = %join_err,
                    "stage task join failed"
                );
                shared.stages[pos].mark_stopped(1);
            }
            debug!(
                stage = %shared.stages[pos].tag,
                exit_code = shared.stages[pos]
                    .exit_code
                    .load(std::sync::atomic::Ordering::Relaxed),
                "stage joined"
            );
        }
    }

    fn spawn_reporter(
        &self,
        shared: &Arc<GraphShared>,
        fabric: &RunFabric,
    ) -> Option<ReporterHandle> {
        if !self.is_report {
            return None;
        }
        let injection: Vec<InjectionTarget> = self
            .active
            .iter()
            .filter_map(|&idx| {
                fabric.ingress.get(&idx).map(|channel| InjectionTarget {
                    tag: self.entries[idx].stage.tag(),
                    channel: channel.clone(),
                    stage: self.entries[idx].stage.clone(),
                })
            })
            .collect();
        Some(TaskReporter::spawn(
            self.reporter_config.clone(),
            Arc::clone(shared),
            self.structure_json(),
            self.get_graph_topology(),
            injection,
        ))
    }

    fn collect_failures(
        &mut self,
        shared: &Arc<GraphShared>,
        fabric: &RunFabric,
        errors_writer: &FallbackWriter,
    ) {
        while let Ok(record) = fabric.fail_rx.try_recv() {
            let key = (record.error.clone(), record.stage_tag.clone());

            let timeline = self.error_timeline.entry(key.clone()).or_default();
            if !timeline.iter().any(|(task, _)| task == &record.task) {
                timeline.push((record.task.clone(), record.timestamp));
            }

            self.stage_errors
                .entry(record.stage_tag.clone())
                .or_default()
                .entry(record.task.clone())
                .or_insert_with(|| key.clone());

            errors_writer.append(&json!({
                "timestamp": chrono::DateTime::from_timestamp_micros(
                    (record.timestamp * 1e6) as i64
                )
                .map(|dt| dt.to_rfc3339())
                .unwrap_or_default(),
                "stage": record.stage_tag,
                "error": record.error,
                "task": record.task,
            }));

            shared
                .failures
                .lock()
                .expect("failures lock poisoned")
                .push(record);
        }
    }

    fn persist_leftovers(&self, fabric: &RunFabric, started_local: chrono::DateTime<Local>) {
        let writer = FallbackWriter::for_run(&self.fallback, "leftover_tasks", started_local);
        for &idx in &self.active {
            let Some(queue) = fabric.in_queues.get(&idx) else {
                continue;
            };
            for envelope in queue.drain() {
                writer.append(&json!({
                    "timestamp": Local::now().to_rfc3339(),
                    "stage": self.entries[idx].stage.tag(),
                    "task": envelope.task.to_string(),
                }));
            }
        }
    }
}

/// Drive one stage to completion, honoring shutdown with a grace period.
/// Returns the stage's exit code.
async fn run_stage_guarded(
    stage: TaskStage,
    io: StageIo,
    mut shutdown_rx: watch::Receiver<bool>,
    grace: Duration,
) -> i32 {
    let tag = stage.tag();
    let stage_fut = stage.start_stage(io);
    tokio::pin!(stage_fut);

    let result = tokio::select! {
        res = &mut stage_fut => res,
        _ = wait_for_shutdown(&mut shutdown_rx) => {
            match tokio::time::timeout(grace, &mut stage_fut).await {
                Ok(res) => res,
                Err(_) => {
                    warn!(stage = %tag, grace_secs = grace.as_secs_f64(), "stage still alive after grace; forcing termination");
                    return 1;
                }
            }
        }
    };

    match result {
        Ok(()) => 0,
        Err(err) => {
            warn!(stage = %tag, error = %err, "stage terminated abnormally");
            1
        }
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: never resolves, the stage future wins.
            futures::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::func::FnStage;
    use crate::stage::StageConfig;
    use serde_json::json;

    fn identity_stage() -> TaskStage {
        let func = FnStage::new("identity", |args: Vec<TaskValue>| Ok(args[0].clone()));
        TaskStage::new(func, StageConfig::default()).unwrap()
    }

    fn wired_chain() -> (TaskGraph, StageHandle, StageHandle) {
        let mut graph = TaskGraph::new();
        let a = graph.add_stage(identity_stage());
        let b = graph.add_stage(identity_stage());
        graph.set_graph_context(a, &[b], StageMode::Process, "A");
        graph.set_graph_context(b, &[], StageMode::Process, "B");
        graph.set_roots(&[a]).unwrap();
        (graph, a, b)
    }

    #[test]
    fn layout_mode_parses() {
        assert_eq!("serial".parse::<LayoutMode>().unwrap(), LayoutMode::Serial);
        assert!("parallel".parse::<LayoutMode>().is_err());
    }

    #[test]
    fn roots_get_synthetic_ingress() {
        let (graph, a, _) = wired_chain();
        assert_eq!(graph.entries[a.0].prev, vec![None]);
        assert!(graph.is_dag());
        assert_eq!(graph.stage_tags(), vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn duplicate_stage_names_are_rejected() {
        let mut graph = TaskGraph::new();
        let a = graph.add_stage(identity_stage());
        let b = graph.add_stage(identity_stage());
        graph.set_graph_context(a, &[b], StageMode::Process, "same");
        graph.set_graph_context(b, &[], StageMode::Process, "same");
        assert!(graph.set_roots(&[a]).is_err());
    }

    #[test]
    fn downstream_counter_binds_to_upstream_success() {
        let (graph, a, b) = wired_chain();
        graph.entries[a.0].stage.metrics().record_success();
        graph.entries[a.0].stage.metrics().record_success();
        assert_eq!(
            graph.entries[b.0].stage.metrics().task_counter.value(),
            2,
            "B expects exactly A's successes"
        );
    }

    #[test]
    fn serial_layout_on_cycle_falls_back_to_process() {
        let mut graph = TaskGraph::with_layout(LayoutMode::Serial);
        let a = graph.add_stage(identity_stage());
        let b = graph.add_stage(identity_stage());
        graph.set_graph_context(a, &[b], StageMode::Process, "A");
        graph.set_graph_context(b, &[a], StageMode::Process, "B");
        graph.set_roots(&[a]).unwrap();
        assert!(!graph.is_dag());
        assert_eq!(graph.layout_mode(), LayoutMode::Process);
        assert!(matches!(
            graph.set_layout_mode(LayoutMode::Serial),
            Err(ConfigurationError::SerialLayoutRequiresDag)
        ));
    }

    #[test]
    fn structure_listing_names_successors() {
        let (graph, _, _) = wired_chain();
        let lines = graph.structure_list();
        assert_eq!(lines[0], "A(TaskStage) -> [B]");
        assert_eq!(lines[1], "B(TaskStage) -> []");
    }

    #[test]
    fn topology_json_shape() {
        let (graph, _, _) = wired_chain();
        let topo = graph.get_graph_topology();
        assert_eq!(topo["isDAG"], json!(true));
        assert_eq!(topo["layout_mode"], json!("process"));
        assert_eq!(topo["layers_dict"]["0"], json!(["A"]));
        assert_eq!(topo["layers_dict"]["1"], json!(["B"]));
    }

    #[tokio::test]
    async fn start_before_roots_is_a_configuration_error() {
        let mut graph = TaskGraph::new();
        let result = graph.start_graph(HashMap::new(), true).await;
        assert!(matches!(
            result,
            Err(FlowError::Configuration(ConfigurationError::RootsNotSet))
        ));
    }

    #[tokio::test]
    async fn injecting_into_unknown_stage_fails() {
        let (mut graph, _, _) = wired_chain();
        let scratch = tempfile::tempdir().unwrap();
        graph.set_fallback(FallbackConfig {
            dir: scratch.path().to_string_lossy().into_owned(),
            persist_leftover_tasks: false,
        });
        let mut init = HashMap::new();
        init.insert("missing".to_string(), vec![json!(1)]);
        let result = graph.start_graph(init, true).await;
        assert!(matches!(
            result,
            Err(FlowError::Configuration(ConfigurationError::UnknownStage(_)))
        ));
    }
}
