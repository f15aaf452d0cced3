//! Job handlers.

use super::job::JobId;
use crate::cancellation::Scope;
use crate::errors::TransformError;
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;

/// Execution context handed to a handler.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_ids: Vec<JobId>,
    worker_id: usize,
    attempt: u32,
    scope: Scope,
}

impl JobContext {
    pub(crate) fn new(job_ids: Vec<JobId>, worker_id: usize, attempt: u32, scope: Scope) -> Self {
        Self {
            job_ids,
            worker_id,
            attempt,
            scope,
        }
    }

    /// Returns the id of the job being handled, or of the first job of a
    /// batch.
    #[must_use]
    pub fn job_id(&self) -> Option<&JobId> {
        self.job_ids.first()
    }

    /// Returns the ids of every job in the call, in payload order.
    #[must_use]
    pub fn job_ids(&self) -> &[JobId] {
        &self.job_ids
    }

    /// Returns the worker running the job.
    #[must_use]
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Returns the 1-based attempt number.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns the job scope. It carries the job deadline and becomes done
    /// when the pool is forced to stop.
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }
}

/// Processes job payloads.
///
/// Handlers are shared by every worker and must tolerate concurrent calls.
#[async_trait]
pub trait JobHandler<J, R>: Send + Sync
where
    J: Send + 'static,
    R: Send + 'static,
{
    /// Handles a single payload.
    async fn handle(&self, payload: J, ctx: &JobContext) -> Result<R, TransformError>;

    /// Handles a batch, returning one result per payload in order.
    ///
    /// Only called when the pool is configured with a batch size. The
    /// default calls [`handle`](Self::handle) on each payload in turn.
    async fn handle_batch(&self, payloads: Vec<J>, ctx: &JobContext) -> Vec<Result<R, TransformError>> {
        let mut results = Vec::with_capacity(payloads.len());
        for payload in payloads {
            results.push(self.handle(payload, ctx).await);
        }
        results
    }
}

/// A handler backed by an async closure. See [`handler_fn`].
pub struct FnHandler<F, J, R> {
    f: F,
    _types: PhantomData<fn(J) -> R>,
}

/// Wraps an async closure as a [`JobHandler`].
///
/// ```rust,ignore
/// let square = handler_fn(|x: u64, _ctx| async move { Ok::<_, TransformError>(x * x) });
/// ```
pub fn handler_fn<J, R, F, Fut>(f: F) -> FnHandler<F, J, R>
where
    J: Send + 'static,
    R: Send + 'static,
    F: Fn(J, JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R, TransformError>> + Send,
{
    FnHandler { f, _types: PhantomData }
}

#[async_trait]
impl<J, R, F, Fut> JobHandler<J, R> for FnHandler<F, J, R>
where
    J: Send + 'static,
    R: Send + 'static,
    F: Fn(J, JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R, TransformError>> + Send,
{
    async fn handle(&self, payload: J, ctx: &JobContext) -> Result<R, TransformError> {
        (self.f)(payload, ctx.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> JobContext {
        JobContext::new(vec![JobId::new("a"), JobId::new("b")], 3, 1, Scope::background())
    }

    #[tokio::test]
    async fn test_handler_fn_receives_context() {
        let handler = handler_fn(|x: u32, ctx: JobContext| async move {
            Ok::<_, TransformError>(format!("{x}@{}", ctx.worker_id()))
        });
        assert_eq!(handler.handle(7, &ctx()).await.unwrap(), "7@3");
    }

    #[tokio::test]
    async fn test_default_batch_keeps_order_and_errors() {
        let handler = handler_fn(|x: u32, _| async move {
            if x == 2 {
                Err(TransformError::new("even", "two"))
            } else {
                Ok(x * 10)
            }
        });
        let results = handler.handle_batch(vec![1, 2, 3], &ctx()).await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0], Ok(10));
        assert!(results[1].is_err());
        assert_eq!(results[2], Ok(30));
    }

    #[test]
    fn test_context_ids() {
        let ctx = ctx();
        assert_eq!(ctx.job_id().map(JobId::as_str), Some("a"));
        assert_eq!(ctx.job_ids().len(), 2);
        assert_eq!(ctx.attempt(), 1);
    }
}
