//! 1→N fan-out stage.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use celestialflow_shared::{ConfigurationError, ExecutionMode, TaskValue};

use crate::func::FnStage;
use crate::stage::{StageConfig, StageKind, TaskStage};

/// Build a splitter stage.
///
/// The function is the identity; the fan-out happens at emission, where
/// the result is converted to a finite ordered sequence and each element
/// forwarded as its own child envelope to every outbound channel. The
/// stage's `split_counter` advances by the number of children (not by 1),
/// and downstream `task_counter`s bind to it.
pub fn splitter() -> Result<TaskStage, ConfigurationError> {
    let func = FnStage::new("split_task", |args: Vec<TaskValue>| {
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
        StageKind::Splitter {
            split_counter: Arc::new(AtomicU64::new(0)),
        },
    )
}
