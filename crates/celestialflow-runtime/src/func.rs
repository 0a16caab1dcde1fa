//! # User-Function Seam
//!
//! A stage wraps exactly one [`StageFunc`]. The trait is async so that
//! I/O-bound functions suspend instead of pinning a worker; CPU-bound or
//! otherwise blocking functions are wrapped with [`FnStage::blocking`],
//! which runs them on the blocking thread pool.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use celestialflow_shared::{TaskValue, UserFuncError};

/// The transformation a stage applies to each task.
///
/// `args` is the extracted argument list: the payload itself, or its
/// elements when the stage unpacks array payloads.
#[async_trait]
pub trait StageFunc: Send + Sync {
    /// Function name, for logging and status summaries.
    fn name(&self) -> &str;

    async fn call(&self, args: Vec<TaskValue>) -> Result<TaskValue, UserFuncError>;
}

/// Shared handle to a stage function.
pub type SharedStageFunc = Arc<dyn StageFunc>;

/// A synchronous closure run inline on the worker.
pub struct FnStage<F> {
    name: String,
    func: F,
}

impl<F> std::fmt::Debug for FnStage<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage").field("name", &self.name).finish()
    }
}

impl<F> FnStage<F>
where
    F: Fn(Vec<TaskValue>) -> Result<TaskValue, UserFuncError> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, func: F) -> SharedStageFunc {
        Arc::new(Self {
            name: name.into(),
            func,
        })
    }

    /// Wrap a closure that blocks (sleeps, sync I/O, heavy compute). Each
    /// invocation runs on the blocking thread pool, so a stage with
    /// `worker_limit` workers executes at most `worker_limit` blocking
    /// calls at once.
    pub fn blocking(name: impl Into<String>, func: F) -> SharedStageFunc {
        Arc::new(BlockingFnStage {
            name: name.into(),
            func: Arc::new(func),
        })
    }
}

#[async_trait]
impl<F> StageFunc for FnStage<F>
where
    F: Fn(Vec<TaskValue>) -> Result<TaskValue, UserFuncError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, args: Vec<TaskValue>) -> Result<TaskValue, UserFuncError> {
        (self.func)(args)
    }
}

struct BlockingFnStage<F> {
    name: String,
    func: Arc<F>,
}

#[async_trait]
impl<F> StageFunc for BlockingFnStage<F>
where
    F: Fn(Vec<TaskValue>) -> Result<TaskValue, UserFuncError> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, args: Vec<TaskValue>) -> Result<TaskValue, UserFuncError> {
        let func = Arc::clone(&self.func);
        match tokio::task::spawn_blocking(move || (func)(args)).await {
            Ok(result) => result,
            // A panic inside a blocking user function is captured here and
            // classified like any other user error.
            Err(join_err) => Err(UserFuncError::new("Panic", join_err.to_string())),
        }
    }
}

/// An async closure.
pub struct AsyncFnStage<F> {
    name: String,
    func: F,
}

impl<F> std::fmt::Debug for AsyncFnStage<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncFnStage")
            .field("name", &self.name)
            .finish()
    }
}

impl<F, Fut> AsyncFnStage<F>
where
    F: Fn(Vec<TaskValue>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TaskValue, UserFuncError>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, func: F) -> SharedStageFunc {
        Arc::new(Self {
            name: name.into(),
            func,
        })
    }
}

#[async_trait]
impl<F, Fut> StageFunc for AsyncFnStage<F>
where
    F: Fn(Vec<TaskValue>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TaskValue, UserFuncError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, args: Vec<TaskValue>) -> Result<TaskValue, UserFuncError> {
        (self.func)(args).await
    }
}
