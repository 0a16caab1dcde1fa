//! 1→target routing stage.

use std::sync::Arc;

use dashmap::DashMap;

use celestialflow_shared::{ConfigurationError, ExecutionMode, TaskValue};

use crate::func::FnStage;
use crate::stage::{StageConfig, StageKind, TaskStage};

/// Build a router stage.
///
/// The function passes the payload through; at emission the result must be
/// a `[target_tag, payload]` pair. The payload is forwarded on the single
/// outbound channel registered under `target_tag`, and the per-target
/// counter (which downstream `task_counter`s bind to) advances by one.
/// Malformed results and unknown targets become failure records, never
/// panics.
pub fn router() -> Result<TaskStage, ConfigurationError> {
    let func = FnStage::new("route_task", |args: Vec<TaskValue>| {
        Ok(args.into_iter().next().unwrap_or(TaskValue::Null))
    });
    let config = StageConfig {
        execution_mode: ExecutionMode::Serial,
        max_retries: 0,
        ..StageConfig::default()
    };
    TaskStage::with_kind(
        func,
        config,
        StageKind::Router {
            route_counters: Arc::new(DashMap::new()),
        },
    )
}
