//! Core value types that flow over the queue fabric.
//!
//! The fabric carries exactly one item shape, [`QueueItem`]: either a
//! [`TaskEnvelope`] with a user payload, or a [`TerminationSignal`]
//! sentinel announcing that a producer will send nothing further. Using a
//! tagged enum (instead of downcasting) lets the fabric branch on the tag
//! in one `match`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::ConfigurationError;
use crate::hashing::content_hash;

/// Dynamic user payload. Heterogeneous task data is modelled as JSON
/// values; canonicalisation for hashing happens in [`crate::hashing`].
pub type TaskValue = serde_json::Value;

/// The unit of work on queues: an immutable payload plus its stable
/// content-derived id.
///
/// The `id` is used for deduplication and provenance. Two envelopes whose
/// payloads compare equal after canonicalisation carry identical ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task: TaskValue,
    pub id: String,
}

impl TaskEnvelope {
    /// Wrap a raw payload, deriving the id from the payload content.
    pub fn wrap(task: TaskValue) -> Self {
        let id = content_hash(&task);
        Self { task, id }
    }

    /// Wrap a payload under an id minted elsewhere (provenance-derived
    /// child ids from splitters and routers).
    pub fn with_id(task: TaskValue, id: impl Into<String>) -> Self {
        Self {
            task,
            id: id.into(),
        }
    }

    /// The raw payload, for handing to a user function.
    pub fn unwrap_task(&self) -> &TaskValue {
        &self.task
    }
}

/// Sentinel marking the end of one producer's output on a channel.
///
/// Never carries a payload. The id is minted by the provenance service
/// when terminations merge through a fan-in, or from a unique source at
/// graph ingress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationSignal {
    pub id: String,
}

impl TerminationSignal {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Mint a fresh signal from a unique source (graph ingress, where no
    /// upstream parents exist).
    pub fn mint() -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
        }
    }
}

/// What actually travels on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueueItem {
    Task(TaskEnvelope),
    Termination(TerminationSignal),
}

impl QueueItem {
    /// Short item kind for structured logging.
    pub fn kind(&self) -> &'static str {
        match self {
            QueueItem::Task(_) => "task",
            QueueItem::Termination(_) => "termination",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            QueueItem::Task(envelope) => &envelope.id,
            QueueItem::Termination(signal) => &signal.id,
        }
    }
}

/// In-process worker discipline of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One sequential loop.
    Serial,
    /// Exactly `worker_limit` workers draining the input concurrently.
    Thread,
    /// A single cooperative loop with up to `worker_limit` tasks in flight.
    Async,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Serial => "serial",
            ExecutionMode::Thread => "thread",
            ExecutionMode::Async => "async",
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "serial" => Ok(ExecutionMode::Serial),
            "thread" => Ok(ExecutionMode::Thread),
            "async" => Ok(ExecutionMode::Async),
            other => Err(ConfigurationError::ExecutionMode(other.to_string())),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a stage runs in its own spawned worker or inline in the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageMode {
    /// Invoked synchronously by the graph driver.
    Serial,
    /// Spawned as an isolated worker communicating only through queues.
    Process,
}

impl StageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageMode::Serial => "serial",
            StageMode::Process => "process",
        }
    }
}

impl FromStr for StageMode {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "serial" => Ok(StageMode::Serial),
            "process" => Ok(StageMode::Process),
            other => Err(ConfigurationError::StageMode(other.to_string())),
        }
    }
}

impl fmt::Display for StageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a stage within a running graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    NotStarted,
    Running,
    Stopped,
}

impl StageStatus {
    pub fn as_u8(self) -> u8 {
        match self {
            StageStatus::NotStarted => 0,
            StageStatus::Running => 1,
            StageStatus::Stopped => 2,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => StageStatus::Running,
            2 => StageStatus::Stopped,
            _ => StageStatus::NotStarted,
        }
    }
}
