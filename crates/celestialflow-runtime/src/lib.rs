//! # CelestialFlow Runtime
//!
//! Graph execution engine for streams of tasks over a directed graph of
//! worker-pool stages. Chains, trees, meshes, cycles, and complete graphs
//! with multi-root ingress are all supported; stages are connected by
//! unbounded fan-in queues, and completion propagates through termination
//! signals that merge across fan-ins.
//!
//! ## Building blocks
//!
//! - [`stage::TaskStage`]: a worker pool around one [`func::StageFunc`],
//!   with retry, deduplication, counters, and structured failure capture.
//! - [`queue::TaskQueue`]: the fan-in/fan-out channel fabric.
//! - [`graph::TaskGraph`]: topology analysis, two layout modes, stage
//!   lifecycle, counter wiring, and failure aggregation.
//! - [`nodes`]: splitter, router, and the Redis remote-worker handoff.
//! - [`structures`]: chain/loop/cross/complete presets.
//! - [`reporter::TaskReporter`]: optional push client for a live status
//!   server.
//!
//! ## Example
//!
//! ```no_run
//! use std::collections::HashMap;
//! use celestialflow_runtime::func::FnStage;
//! use celestialflow_runtime::stage::{StageConfig, TaskStage};
//! use celestialflow_runtime::structures::task_chain;
//! use celestialflow_shared::StageMode;
//! use serde_json::json;
//!
//! # async fn run() -> celestialflow_shared::FlowResult<()> {
//! let double = TaskStage::new(
//!     FnStage::new("double", |args: Vec<serde_json::Value>| {
//!         Ok(json!(args[0].as_i64().unwrap_or(0) * 2))
//!     }),
//!     StageConfig::default(),
//! )?;
//! let mut graph = task_chain(vec![double], StageMode::Process)?;
//! let mut init = HashMap::new();
//! init.insert("Stage 1".to_string(), vec![json!(21)]);
//! let report = graph.start_graph(init, true).await?;
//! assert!(report.by_error.is_empty());
//! # Ok(())
//! # }
//! ```

pub mod func;
pub mod graph;
pub mod metrics;
pub mod nodes;
pub mod persist;
pub mod queue;
pub mod reporter;
pub mod stage;
pub mod structures;

pub use func::{AsyncFnStage, FnStage, SharedStageFunc, StageFunc};
pub use graph::{
    BenchReport, GraphShutdown, LayoutMode, RunReport, StageHandle, StageStatusSnapshot, TaskGraph,
};
pub use metrics::{StageMetrics, SumCounter, TaskCounts};
pub use nodes::{redis_ack, redis_sink, redis_source, router, splitter};
pub use queue::{TaskChannel, TaskQueue};
pub use stage::{FailureRecord, StageConfig, StageKind, TaskStage};
pub use structures::{task_chain, task_complete, task_cross, task_loop};
