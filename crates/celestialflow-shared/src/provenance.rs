//! # Provenance Events
//!
//! Every envelope id is either a content hash (initial envelopes) or
//! derived by emitting a causal event with the predecessors as parents.
//! The provenance service is a pluggable collaborator behind the
//! [`ProvenanceClient`] trait; the default [`HashProvenance`] needs no
//! external service and preserves the id invariants by returning content
//! hashes.

use std::fmt;
use std::sync::Arc;

use crate::hashing::{content_hash, hash_bytes};
use crate::types::TaskValue;

/// Causal event kinds emitted by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A splitter produced a child envelope from a parent.
    TaskSplit,
    /// A router forwarded a payload to a selected target.
    TaskRoute,
    /// A fan-in merged the terminations of all its endpoints.
    TerminationMerge,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TaskSplit => "task.split",
            EventKind::TaskRoute => "task.route",
            EventKind::TerminationMerge => "termination.merge",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared handle to a provenance client.
pub type SharedProvenance = Arc<dyn ProvenanceClient>;

/// Mint ids for derived envelopes and merged terminations.
///
/// `subject` is the payload the new id will identify; termination merges
/// have no payload and pass `None`. Implementations may forward events to
/// an external causal-provenance service; they must return a non-empty id.
pub trait ProvenanceClient: Send + Sync + fmt::Debug {
    fn emit(&self, kind: EventKind, parents: &[String], subject: Option<&TaskValue>) -> String;
}

/// Default client: no external service.
///
/// Ids for payload-bearing events are the content hash of the subject, so
/// equal payloads keep equal ids; termination merges hash the kind and
/// parent ids, which is enough for uniqueness across distinct merges.
#[derive(Debug, Default, Clone)]
pub struct HashProvenance;

impl HashProvenance {
    pub fn shared() -> SharedProvenance {
        Arc::new(Self)
    }
}

impl ProvenanceClient for HashProvenance {
    fn emit(&self, kind: EventKind, parents: &[String], subject: Option<&TaskValue>) -> String {
        match subject {
            Some(value) => content_hash(value),
            None => {
                let mut seed = String::from(kind.as_str());
                for parent in parents {
                    seed.push(':');
                    seed.push_str(parent);
                }
                hash_bytes(seed.as_bytes())
            }
        }
    }
}
