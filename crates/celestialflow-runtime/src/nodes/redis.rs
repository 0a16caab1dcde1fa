//! # Redis Remote-Worker Handoff
//!
//! Three cooperating stages implement blocking RPC over Redis:
//!
//! - [`redis_sink`] serializes `{id, task, emit_ts}` and `RPUSH`es it onto
//!   the input key, returning the task id.
//! - [`redis_source`] `BLPOP`s the input key and re-injects the parsed
//!   task into the graph.
//! - [`redis_ack`] polls `HGET output_key task_id` until the remote worker
//!   writes `{status, result|error}`, deletes the entry, and returns the
//!   result or fails with a remote-worker error.
//!
//! The JSON shapes here are the external contract with whatever runtime
//! consumes the remote side.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::json;
use tokio::sync::OnceCell;

use celestialflow_shared::config::RedisConfig;
use celestialflow_shared::{
    content_hash, ConfigurationError, ExecutionMode, TaskValue, UserFuncError,
};

use crate::func::StageFunc;
use crate::stage::{now_epoch, StageConfig, TaskStage};

/// Ack poll cadence while waiting on the remote worker.
const ACK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lazily-initialised shared connection.
#[derive(Debug)]
struct RedisHandle {
    config: RedisConfig,
    manager: OnceCell<ConnectionManager>,
}

impl RedisHandle {
    fn new(config: RedisConfig) -> Self {
        Self {
            config,
            manager: OnceCell::new(),
        }
    }

    async fn connection(&self) -> Result<ConnectionManager, UserFuncError> {
        let manager = self
            .manager
            .get_or_try_init(|| async {
                let client = redis::Client::open(self.config.url())
                    .map_err(|err| UserFuncError::redis(err.to_string()))?;
                client
                    .get_connection_manager()
                    .await
                    .map_err(|err| UserFuncError::redis(err.to_string()))
            })
            .await?;
        Ok(manager.clone())
    }
}

/// Encode the sink payload; returns `(task_id, json)`.
pub(crate) fn encode_sink_payload(args: &[TaskValue]) -> (String, String) {
    let task = TaskValue::Array(args.to_vec());
    let task_id = content_hash(&task);
    let payload = json!({
        "id": task_id,
        "task": task,
        "emit_ts": now_epoch(),
    });
    (task_id, payload.to_string())
}

/// Decode a sink payload back into a task value, unpacking single-element
/// arrays.
pub(crate) fn decode_source_payload(raw: &str) -> Result<TaskValue, UserFuncError> {
    let parsed: TaskValue = serde_json::from_str(raw)
        .map_err(|err| UserFuncError::new("ValueError", format!("bad source payload: {err}")))?;
    let task = parsed.get("task").cloned().unwrap_or(TaskValue::Null);
    Ok(unwrap_single(task))
}

/// Decode an ack response: `{"status": "success"|"error", ...}`.
pub(crate) fn decode_ack_payload(raw: &str) -> Result<TaskValue, UserFuncError> {
    let parsed: TaskValue = serde_json::from_str(raw)
        .map_err(|err| UserFuncError::new("ValueError", format!("bad ack payload: {err}")))?;
    match parsed.get("status").and_then(|s| s.as_str()) {
        Some("success") => Ok(unwrap_single(
            parsed.get("result").cloned().unwrap_or(TaskValue::Null),
        )),
        Some("error") => Err(UserFuncError::remote_worker(
            parsed
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("unknown remote error")
                .to_string(),
        )),
        _ => Err(UserFuncError::new(
            "ValueError",
            format!("Unknown ack status: {parsed}"),
        )),
    }
}

fn unwrap_single(value: TaskValue) -> TaskValue {
    match value {
        TaskValue::Array(items) if items.len() == 1 => items.into_iter().next().unwrap_or_default(),
        other => other,
    }
}

struct SinkFunc {
    key: String,
    redis: RedisHandle,
}

#[async_trait]
impl StageFunc for SinkFunc {
    fn name(&self) -> &str {
        "redis_sink"
    }

    async fn call(&self, args: Vec<TaskValue>) -> Result<TaskValue, UserFuncError> {
        let mut conn = self.redis.connection().await?;
        let (task_id, payload) = encode_sink_payload(&args);
        let _: i64 = conn
            .rpush(&self.key, payload)
            .await
            .map_err(|err| UserFuncError::redis(err.to_string()))?;
        Ok(TaskValue::String(task_id))
    }
}

struct SourceFunc {
    key: String,
    redis: RedisHandle,
    /// Seconds; 0 waits forever (BLPOP semantics).
    timeout_secs: f64,
}

#[async_trait]
impl StageFunc for SourceFunc {
    fn name(&self) -> &str {
        "redis_source"
    }

    async fn call(&self, _args: Vec<TaskValue>) -> Result<TaskValue, UserFuncError> {
        let mut conn = self.redis.connection().await?;
        let popped: Option<(String, String)> = conn
            .blpop(&self.key, self.timeout_secs)
            .await
            .map_err(|err| UserFuncError::redis(err.to_string()))?;
        let (_, raw) = popped.ok_or_else(|| {
            UserFuncError::timeout("Redis item not returned in time after being fetched")
        })?;
        decode_source_payload(&raw)
    }
}

struct AckFunc {
    key: String,
    redis: RedisHandle,
    /// Zero disables the timeout.
    timeout: Duration,
}

#[async_trait]
impl StageFunc for AckFunc {
    fn name(&self) -> &str {
        "redis_ack"
    }

    async fn call(&self, args: Vec<TaskValue>) -> Result<TaskValue, UserFuncError> {
        let task_id = args
            .first()
            .and_then(|v| v.as_str())
            .ok_or_else(|| UserFuncError::new("TypeError", "ack expects a task_id string"))?
            .to_string();
        let mut conn = self.redis.connection().await?;
        let started = Instant::now();

        loop {
            let hit: Option<String> = conn
                .hget(&self.key, &task_id)
                .await
                .map_err(|err| UserFuncError::redis(err.to_string()))?;
            if let Some(raw) = hit {
                // One-shot ack: delete before decoding.
                let _: i64 = conn
                    .hdel(&self.key, &task_id)
                    .await
                    .map_err(|err| UserFuncError::redis(err.to_string()))?;
                return decode_ack_payload(&raw);
            }

            if !self.timeout.is_zero() && started.elapsed() > self.timeout {
                return Err(UserFuncError::timeout(format!(
                    "task_id={task_id} not acknowledged"
                )));
            }
            tokio::time::sleep(ACK_POLL_INTERVAL).await;
        }
    }
}

/// Stage that hands tasks to remote workers through a Redis list.
///
/// Runs a thread pool of 4 so individual workers may block on the Redis
/// socket without stalling the graph. Returns the task id, which an ack
/// stage downstream can wait on.
pub fn redis_sink(
    key: impl Into<String>,
    config: RedisConfig,
    unpack_task_args: bool,
) -> Result<TaskStage, ConfigurationError> {
    let func = SinkFunc {
        key: key.into(),
        redis: RedisHandle::new(config),
    };
    let stage_config = StageConfig {
        execution_mode: ExecutionMode::Thread,
        worker_limit: 4,
        unpack_task_args,
        ..StageConfig::default()
    };
    let stage = TaskStage::new(std::sync::Arc::new(func), stage_config)?;
    stage.set_class_name("TaskRedisSink");
    Ok(stage)
}

/// Stage that pulls tasks pushed by a remote producer.
///
/// Each upstream envelope is only a wake-up signal; the payload comes from
/// `BLPOP`. Duplicate checking is disabled: remote payloads are already
/// unique at the source.
pub fn redis_source(
    key: impl Into<String>,
    config: RedisConfig,
    timeout: Duration,
) -> Result<TaskStage, ConfigurationError> {
    let func = SourceFunc {
        key: key.into(),
        redis: RedisHandle::new(config),
        timeout_secs: timeout.as_secs_f64(),
    };
    let stage_config = StageConfig {
        execution_mode: ExecutionMode::Serial,
        enable_duplicate_check: false,
        ..StageConfig::default()
    };
    let stage = TaskStage::new(std::sync::Arc::new(func), stage_config)?;
    stage.set_class_name("TaskRedisSource");
    Ok(stage)
}

/// Stage that waits for remote completion of a task id.
pub fn redis_ack(
    key: impl Into<String>,
    config: RedisConfig,
    timeout: Duration,
) -> Result<TaskStage, ConfigurationError> {
    let func = AckFunc {
        key: key.into(),
        redis: RedisHandle::new(config),
        timeout,
    };
    let stage_config = StageConfig {
        execution_mode: ExecutionMode::Serial,
        enable_duplicate_check: false,
        ..StageConfig::default()
    };
    let stage = TaskStage::new(std::sync::Arc::new(func), stage_config)?;
    stage.set_class_name("TaskRedisAck");
    Ok(stage)
}
