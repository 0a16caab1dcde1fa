//! # CelestialFlow Shared
//!
//! Leaf types shared by every component of the CelestialFlow runtime:
//! task envelopes and termination signals, the dynamic payload value with
//! content hashing, the error taxonomy, provenance events, configuration
//! structs, and tracing setup.
//!
//! Nothing in this crate owns a queue or a worker; it exists so that the
//! runtime crate and embedders agree on the vocabulary that flows over
//! channels.

pub mod config;
pub mod errors;
pub mod hashing;
pub mod logging;
pub mod provenance;
pub mod types;

pub use errors::{ConfigurationError, FlowError, FlowResult, QueueError, UserFuncError};
pub use hashing::{canonicalize, content_hash};
pub use logging::{init_tracing, LogLevel};
pub use provenance::{EventKind, HashProvenance, ProvenanceClient, SharedProvenance};
pub use types::{
    ExecutionMode, QueueItem, StageMode, StageStatus, TaskEnvelope, TaskValue, TerminationSignal,
};
