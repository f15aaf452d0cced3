//! Job handlers with scripted behavior.

use crate::errors::TransformError;
use crate::pool::{JobContext, JobHandler};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Echoes payloads back and records every call.
#[derive(Debug)]
pub struct RecordingHandler<J> {
    payloads: Mutex<Vec<J>>,
    workers: Mutex<Vec<usize>>,
    batches: Mutex<Vec<usize>>,
}

impl<J> Default for RecordingHandler<J> {
    fn default() -> Self {
        Self {
            payloads: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
        }
    }
}

impl<J: Clone> RecordingHandler<J> {
    /// Creates a handler with no recorded calls.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the payloads handled, in call order.
    #[must_use]
    pub fn payloads(&self) -> Vec<J> {
        self.payloads.lock().clone()
    }

    /// Returns the number of payloads handled.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.payloads.lock().len()
    }

    /// Returns the worker of every call, in call order.
    #[must_use]
    pub fn workers(&self) -> Vec<usize> {
        self.workers.lock().clone()
    }

    /// Returns the size of every batch call.
    #[must_use]
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().clone()
    }
}

#[async_trait]
impl<J> JobHandler<J, J> for RecordingHandler<J>
where
    J: Clone + Send + Sync + 'static,
{
    async fn handle(&self, payload: J, ctx: &JobContext) -> Result<J, TransformError> {
        self.payloads.lock().push(payload.clone());
        self.workers.lock().push(ctx.worker_id());
        Ok(payload)
    }

    async fn handle_batch(&self, payloads: Vec<J>, ctx: &JobContext) -> Vec<Result<J, TransformError>> {
        self.batches.lock().push(payloads.len());
        self.payloads.lock().extend(payloads.iter().cloned());
        self.workers.lock().push(ctx.worker_id());
        payloads.into_iter().map(Ok).collect()
    }
}

/// Fails every attempt before `succeed_on`, then echoes the payload.
#[derive(Debug)]
pub struct FlakyHandler {
    succeed_on: u32,
    calls: AtomicUsize,
}

impl FlakyHandler {
    /// Creates a handler that succeeds on attempt `succeed_on`.
    #[must_use]
    pub fn new(succeed_on: u32) -> Self {
        Self {
            succeed_on,
            calls: AtomicUsize::new(0),
        }
    }

    /// Returns the number of attempts seen.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<J: Send + 'static> JobHandler<J, J> for FlakyHandler {
    async fn handle(&self, payload: J, ctx: &JobContext) -> Result<J, TransformError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if ctx.attempt() < self.succeed_on {
            return Err(TransformError::new(
                "flaky",
                format!("attempt {} of {}", ctx.attempt(), self.succeed_on),
            ));
        }
        Ok(payload)
    }
}

/// Sleeps on the job scope's clock before echoing the payload.
#[derive(Debug, Clone, Copy)]
pub struct SlowHandler {
    delay: Duration,
}

impl SlowHandler {
    /// Creates a handler that takes `delay` per job.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl<J: Send + 'static> JobHandler<J, J> for SlowHandler {
    async fn handle(&self, payload: J, ctx: &JobContext) -> Result<J, TransformError> {
        ctx.scope().clock().sleep(self.delay).await;
        Ok(payload)
    }
}

/// Panics on payloads matching a predicate, echoing the rest.
pub struct PanickingHandler<F> {
    should_panic: F,
}

impl<F> PanickingHandler<F> {
    /// Creates a handler that panics when `should_panic` returns true.
    pub fn new(should_panic: F) -> Self {
        Self { should_panic }
    }
}

#[async_trait]
impl<J, F> JobHandler<J, J> for PanickingHandler<F>
where
    J: std::fmt::Debug + Send + 'static,
    F: Fn(&J) -> bool + Send + Sync,
{
    async fn handle(&self, payload: J, _ctx: &JobContext) -> Result<J, TransformError> {
        assert!(!(self.should_panic)(&payload), "refusing payload {payload:?}");
        Ok(payload)
    }
}
