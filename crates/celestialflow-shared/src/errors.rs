//! # Error Taxonomy
//!
//! Unified error handling for the CelestialFlow runtime.
//!
//! The taxonomy separates errors by propagation policy:
//! - [`ConfigurationError`] is fatal before a graph starts and never occurs
//!   afterwards.
//! - [`UserFuncError`] is captured per task, classified retryable or
//!   terminal, and never aborts the graph.
//! - [`QueueError`] is logged and the offending endpoint skipped for one
//!   sweep.
//! - [`FlowError::Fatal`] covers runtime corruption (a panicked worker);
//!   the stage stops abnormally but still propagates termination.

use thiserror::Error;

/// Runtime operation result type
pub type FlowResult<T> = Result<T, FlowError>;

/// Error kind string for a Redis source/ack timeout.
pub const KIND_TIMEOUT: &str = "TimeoutError";
/// Error kind string reported by the Redis ack stage for remote failures.
pub const KIND_REMOTE_WORKER: &str = "RemoteWorkerError";
/// Error kind string for Redis transport failures.
pub const KIND_REDIS: &str = "RedisError";

/// Errors raised while assembling a graph. Fatal before start.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Invalid {field}: {value}. Valid options are {allowed:?}.")]
    InvalidOption {
        field: String,
        value: String,
        allowed: Vec<String>,
    },

    #[error("Invalid execution mode: {0}. Valid options are [\"serial\", \"thread\", \"async\"].")]
    ExecutionMode(String),

    #[error("Invalid stage mode: {0}. Valid options are [\"serial\", \"process\"].")]
    StageMode(String),

    #[error("Invalid log level: {0}")]
    LogLevel(String),

    #[error("Duplicate queue tag: {0}")]
    DuplicateQueueTag(String),

    #[error("Unknown target tag {target} on stage {stage}")]
    UnknownTarget { target: String, stage: String },

    #[error("Unknown stage tag: {0}")]
    UnknownStage(String),

    #[error("Serial layout requires an acyclic graph")]
    SerialLayoutRequiresDag,

    #[error("Graph has no roots; call set_roots before starting")]
    RootsNotSet,

    #[error("worker_limit must be greater than zero")]
    ZeroWorkerLimit,
}

impl ConfigurationError {
    /// Generic invalid-option constructor for config fields without a
    /// dedicated variant.
    pub fn invalid_option(
        field: impl Into<String>,
        value: impl Into<String>,
        allowed: &[&str],
    ) -> Self {
        Self::InvalidOption {
            field: field.into(),
            value: value.into(),
            allowed: allowed.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// A captured failure from a user function.
///
/// Carries a `kind` string (the error's type name) used for retry
/// classification and failure indexing, plus a human-readable message.
/// Formats as `Kind(message)`, the shape stored in failure records.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}({message})")]
pub struct UserFuncError {
    pub kind: String,
    pub message: String,
}

impl UserFuncError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// A remote worker reported `status = "error"`.
    pub fn remote_worker(message: impl Into<String>) -> Self {
        Self::new(KIND_REMOTE_WORKER, message)
    }

    /// A Redis source/ack wait exceeded its timeout.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(KIND_TIMEOUT, message)
    }

    /// Redis transport failure, treated like any other user-function error.
    pub fn redis(message: impl Into<String>) -> Self {
        Self::new(KIND_REDIS, message)
    }
}

/// Unexpected failure while probing or writing a queue endpoint.
///
/// Never fatal: the fabric logs it and skips the endpoint for the current
/// sweep.
#[derive(Debug, Clone, Error)]
#[error("queue endpoint {endpoint_tag} on stage {stage_tag}: {message}")]
pub struct QueueError {
    pub endpoint_tag: String,
    pub stage_tag: String,
    pub message: String,
}

/// Top-level runtime error.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Runtime fatal: {0}")]
    Fatal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization/deserialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlowError {
    /// Worker-pool corruption: the stage terminates abnormally but the
    /// graph keeps making progress.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_option_lists_allowed_values() {
        let err = ConfigurationError::invalid_option("direction", "sideways", &["in", "out"]);
        let rendered = err.to_string();
        assert!(rendered.contains("direction"));
        assert!(rendered.contains("sideways"));
        assert!(rendered.contains("in"));
        assert!(rendered.contains("out"));
    }

    #[test]
    fn user_func_error_formats_as_kind_message() {
        let err = UserFuncError::new("ValueError", "n must be positive");
        assert_eq!(err.to_string(), "ValueError(n must be positive)");
    }

    #[test]
    fn dedicated_kinds_use_reserved_names() {
        assert_eq!(UserFuncError::timeout("late").kind, KIND_TIMEOUT);
        assert_eq!(UserFuncError::remote_worker("boom").kind, KIND_REMOTE_WORKER);
        assert_eq!(UserFuncError::redis("conn reset").kind, KIND_REDIS);
    }

    #[test]
    fn configuration_error_wraps_into_flow_error() {
        let err: FlowError = ConfigurationError::SerialLayoutRequiresDag.into();
        assert!(matches!(err, FlowError::Configuration(_)));
    }
}
