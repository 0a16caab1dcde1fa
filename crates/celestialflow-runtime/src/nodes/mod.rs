//! Specialized stage constructors.
//!
//! All of these are ordinary [`TaskStage`](crate::stage::TaskStage)s with
//! a preset function, configuration, and emission behavior. The splitter
//! and router specialize the success-emission path; the Redis stages are
//! plain stages whose functions speak the remote-worker wire schema.

mod redis;
mod router;
mod splitter;

pub use redis::{redis_ack, redis_sink, redis_source};
pub use router::router;
pub use splitter::splitter;
