// Action pipeline: deferred, cancellable units of async work.
// Every job stage, step and container operation is an `Executor`; they are
// composed into sequences, then-chains and conditional gates and only run
// when `execute` is awaited.

use anyhow::Result;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;

/// Execution context handed to every executor of a job.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    cancel: CancellationToken,
    job: Arc<str>,
}

impl PipelineContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            job: Arc::from(""),
        }
    }

    /// Same token, labelled with the job used as a log field.
    pub fn with_job(&self, job: &str) -> Self {
        Self {
            cancel: self.cancel.clone(),
            job: Arc::from(job),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn job(&self) -> &str {
        &self.job
    }
}

type RunFn = dyn Fn(PipelineContext) -> BoxFuture<'static, Result<()>> + Send + Sync;
type Predicate = dyn Fn(&PipelineContext) -> bool + Send + Sync;

/// A deferred unit of work. Cloning is cheap and an executor may run more
/// than once.
#[derive(Clone)]
pub struct Executor {
    run: Arc<RunFn>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Executor")
    }
}

impl Executor {
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(PipelineContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            run: Arc::new(move |ctx| Box::pin(f(ctx))),
        }
    }

    pub fn noop() -> Self {
        Self::from_fn(|_| async { Ok(()) })
    }

    /// An executor that always fails with `err`.
    pub fn error<E>(err: E) -> Self
    where
        E: std::error::Error + Clone + Send + Sync + 'static,
    {
        Self::from_fn(move |_| {
            let err = err.clone();
            async move { Err(err.into()) }
        })
    }

    /// Run `executors` in order, stopping at the first failure.
    pub fn pipeline(executors: Vec<Executor>) -> Self {
        let executors = Arc::new(executors);
        Self::from_fn(move |ctx| {
            let executors = Arc::clone(&executors);
            async move {
                for executor in executors.iter() {
                    executor.execute(ctx.clone()).await?;
                }
                Ok(())
            }
        })
    }

    /// Run `next` after `self` succeeds.
    pub fn then(self, next: Executor) -> Self {
        Self::from_fn(move |ctx| {
            let first = self.clone();
            let next = next.clone();
            async move {
                first.execute(ctx.clone()).await?;
                next.execute(ctx).await
            }
        })
    }

    /// Run only when `predicate` holds at execution time; otherwise succeed
    /// without running.
    pub fn when<P>(self, predicate: P) -> Self
    where
        P: Fn(&PipelineContext) -> bool + Send + Sync + 'static,
    {
        let predicate: Arc<Predicate> = Arc::new(predicate);
        Self::from_fn(move |ctx| {
            let inner = self.clone();
            let predicate = Arc::clone(&predicate);
            async move {
                if predicate(&ctx) {
                    inner.execute(ctx).await
                } else {
                    Ok(())
                }
            }
        })
    }

    pub fn when_bool(self, condition: bool) -> Self {
        if condition {
            self
        } else {
            Self::noop()
        }
    }

    /// Run the executor. Fails with `PipelineError::Cancelled` without
    /// starting when the context is already cancelled.
    pub async fn execute(&self, ctx: PipelineContext) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(PipelineError::Cancelled.into());
        }
        (self.run)(ctx).await
    }
}
